//! Handler routing: turns a stored notification into concrete delivery targets.
//!
//! A handler name maps to one rule or an ordered list of rules. Rules are
//! evaluated in order against the notification path and the first regex match
//! wins; remaining rules are not tried even if they would also match.

use std::collections::{BTreeMap, HashMap};

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

use crate::store::Notification;

/// A routing rule as it appears in configuration.
///
/// Unknown keys are rejected at load time rather than silently ignored, so a
/// misspelled `verify_ssl` cannot weaken TLS verification unnoticed.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Regular expression matched against the notification path.
    #[serde(rename = "match")]
    pub pattern: String,
    pub url: UrlTemplates,
    #[serde(default)]
    pub method: TargetMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

/// One URL template or an ordered list of templates (fan-out).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UrlTemplates {
    One(String),
    Many(Vec<String>),
}

/// One rule or an ordered list of rules for a handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HandlerRules {
    One(RuleConfig),
    Many(Vec<RuleConfig>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMethod {
    Get,
    #[default]
    Post,
}

fn default_verify_ssl() -> bool {
    true
}

/// One resolved outbound delivery: URL with captures substituted, method,
/// merged headers, and TLS verification mode. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub url: String,
    pub method: TargetMethod,
    /// Captured inbound headers overlaid with the rule's headers; the rule
    /// wins on key collision.
    pub headers: BTreeMap<String, String>,
    pub verify_tls: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Path is not valid for the {handler} handler: {path}")]
    PathNotMatched { handler: String, path: String },
}

#[derive(Error, Debug)]
#[error("Invalid match pattern {pattern:?} for handler {handler}: {source}")]
pub struct RoutingConfigError {
    pub handler: String,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Debug)]
struct CompiledRule {
    pattern: Regex,
    urls: Vec<String>,
    method: TargetMethod,
    headers: BTreeMap<String, String>,
    verify_tls: bool,
}

/// Immutable routing table compiled from configuration at startup.
#[derive(Debug, Default)]
pub struct RoutingTable {
    handlers: HashMap<String, Vec<CompiledRule>>,
}

impl RoutingTable {
    /// Compile every rule's regex up front so a bad pattern fails at load
    /// time instead of on the first matching notification.
    pub fn compile(
        config: &HashMap<String, HandlerRules>,
    ) -> Result<Self, RoutingConfigError> {
        let mut handlers = HashMap::with_capacity(config.len());

        for (name, rules) in config {
            let rules: Vec<&RuleConfig> = match rules {
                HandlerRules::One(rule) => vec![rule],
                HandlerRules::Many(list) => list.iter().collect(),
            };

            let mut compiled = Vec::with_capacity(rules.len());
            for rule in rules {
                let pattern =
                    Regex::new(&rule.pattern).map_err(|source| RoutingConfigError {
                        handler: name.clone(),
                        pattern: rule.pattern.clone(),
                        source,
                    })?;
                let urls = match &rule.url {
                    UrlTemplates::One(url) => vec![url.clone()],
                    UrlTemplates::Many(urls) => urls.clone(),
                };
                compiled.push(CompiledRule {
                    pattern,
                    urls,
                    method: rule.method,
                    headers: rule.headers.clone(),
                    verify_tls: rule.verify_ssl,
                });
            }
            handlers.insert(name.clone(), compiled);
        }

        Ok(Self { handlers })
    }

    /// Resolve a notification into its delivery targets.
    ///
    /// The first rule whose regex matches the path is selected; one target is
    /// produced per URL template with `$1`, `$2`, ... replaced by the matched
    /// capture groups.
    pub fn resolve(
        &self,
        notification: &Notification,
    ) -> Result<Vec<ResolvedTarget>, RoutingError> {
        let rules = self
            .handlers
            .get(&notification.handler)
            .ok_or_else(|| RoutingError::UnknownHandler(notification.handler.clone()))?;

        let (rule, captures) = rules
            .iter()
            .find_map(|rule| {
                rule.pattern
                    .captures(&notification.path)
                    .map(|caps| (rule, caps))
            })
            .ok_or_else(|| RoutingError::PathNotMatched {
                handler: notification.handler.clone(),
                path: notification.path.clone(),
            })?;

        // Inbound headers first, rule headers overlaid on collision.
        let mut headers = notification.headers.clone();
        for (key, value) in &rule.headers {
            headers.insert(key.clone(), value.clone());
        }

        Ok(rule
            .urls
            .iter()
            .map(|template| ResolvedTarget {
                url: substitute_captures(template, &captures),
                method: rule.method,
                headers: headers.clone(),
                verify_tls: rule.verify_tls,
            })
            .collect())
    }
}

/// Replace every `$<n>` token with the text of capture group n.
///
/// Groups that did not participate in the match substitute the empty string.
/// Indices are replaced highest-first so `$12` is never clobbered by `$1`.
fn substitute_captures(template: &str, captures: &Captures<'_>) -> String {
    let mut url = template.to_string();
    for i in (1..captures.len()).rev() {
        let text = captures.get(i).map_or("", |m| m.as_str());
        url = url.replace(&format!("${}", i), text);
    }
    url
}
