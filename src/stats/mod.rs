//! Diagnostic high-water-mark counters for the status surface.
//!
//! Updated on ingest and acknowledgement; read by `GET /status`. Diagnostic
//! only, never consulted for correctness.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayStats {
    highest_received: AtomicI64,
    highest_acked: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub highest_received: i64,
    pub highest_acked: i64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, id: i64) {
        self.highest_received.fetch_max(id, Ordering::Relaxed);
    }

    pub fn record_acked(&self, id: i64) {
        self.highest_acked.fetch_max(id, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            highest_received: self.highest_received.load(Ordering::Relaxed),
            highest_acked: self.highest_acked.load(Ordering::Relaxed),
        }
    }
}
