use std::sync::Arc;

use crate::config::Settings;
use crate::stats::RelayStats;
use crate::store::NotificationStore;

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn NotificationStore>,
    pub stats: Arc<RelayStats>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            settings,
            store,
            stats: Arc::new(RelayStats::new()),
        }
    }
}
