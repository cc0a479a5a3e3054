//! Alert rendering and delivery.
//!
//! [`AlertDispatcher`] renders a [`MatchEvent`] into an [`AlertMessage`] and
//! hands it to every destination the rule names. Destinations are tried
//! concurrently and independently, each with its own bounded retry.

pub mod alertmanager;
pub mod log;
pub mod render;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{AlertConfig, DestinationKind, LOG_DESTINATION};
use crate::error::DispatchError;
use crate::evaluator::MatchEvent;
use crate::rules::RuleDefinition;

pub use self::alertmanager::AlertmanagerDestination;
pub use self::log::LogDestination;
pub use self::webhook::WebhookDestination;

/// The rendered alert, also the webhook JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    pub rule: String,
    pub kind: String,
    pub index: String,
    pub subject: String,
    pub text: String,
    pub fingerprint: String,
    pub key: Option<String>,
    pub match_count: u64,
    pub matched_ids: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fields: Map<String, Value>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

/// A notification transport.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// One delivery attempt.
    async fn send(&self, alert: &AlertMessage) -> Result<(), DispatchError>;
}

/// Aggregate result of delivering one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every destination accepted the alert.
    Sent { destinations: Vec<String> },
    /// Some destinations failed after all retries.
    Partial {
        sent: Vec<String>,
        failed: Vec<(String, String)>,
    },
    /// Nothing was delivered.
    Failed { failed: Vec<(String, String)> },
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { .. })
    }

    /// At least one destination received the alert.
    pub fn delivered(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }

    /// Human-readable summary of the failures, if any.
    pub fn error_summary(&self) -> Option<String> {
        let failed = match self {
            DispatchOutcome::Sent { .. } => return None,
            DispatchOutcome::Partial { failed, .. } | DispatchOutcome::Failed { failed } => failed,
        };
        Some(
            failed
                .iter()
                .map(|(dest, err)| format!("{dest}: {err}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Routes rendered alerts to named destinations.
pub struct AlertDispatcher {
    destinations: HashMap<String, Arc<dyn Destination>>,
    max_attempts: u32,
    backoff: Duration,
}

impl AlertDispatcher {
    /// An empty dispatcher; register destinations before use.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            destinations: HashMap::new(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Build every configured destination plus the built-in `log` one.
    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let mut dispatcher =
            Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms));
        dispatcher.register(Arc::new(LogDestination::new(LOG_DESTINATION)));
        for dest in &config.destinations {
            match &dest.kind {
                DestinationKind::Webhook {
                    url,
                    headers,
                    timeout_secs,
                } => {
                    let webhook = WebhookDestination::new(
                        &dest.name,
                        url,
                        headers,
                        Duration::from_secs(*timeout_secs),
                    )?;
                    dispatcher.register(Arc::new(webhook));
                }
                DestinationKind::Alertmanager {
                    url,
                    labels,
                    resolve_timeout_secs,
                    timeout_secs,
                } => {
                    let am = AlertmanagerDestination::new(
                        &dest.name,
                        url,
                        labels,
                        Duration::from_secs(*resolve_timeout_secs),
                        Duration::from_secs(*timeout_secs),
                    )?;
                    dispatcher.register(Arc::new(am));
                }
                DestinationKind::Log => {
                    dispatcher.register(Arc::new(LogDestination::new(&dest.name)));
                }
            }
        }
        Ok(dispatcher)
    }

    /// Add or replace a destination under its own name.
    pub fn register(&mut self, destination: Arc<dyn Destination>) {
        self.destinations
            .insert(destination.name().to_string(), destination);
    }

    pub fn destination_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.destinations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Render `event` for `rule` without sending it.
    pub fn render(
        &self,
        event: &MatchEvent,
        rule: &RuleDefinition,
    ) -> Result<AlertMessage, DispatchError> {
        let fields = render::included_fields(rule, event);
        let text = match &rule.alert_text {
            Some(tpl) => render::fill_placeholders(tpl, rule, event),
            None => render::default_text(rule, event, &fields)
                .map_err(|e| DispatchError::Render(e.to_string()))?,
        };
        let subject = match &rule.alert_subject {
            Some(tpl) => render::fill_placeholders(tpl, rule, event),
            None => render::default_subject(rule, event),
        };

        Ok(AlertMessage {
            rule: rule.name.clone(),
            kind: event.kind.to_string(),
            index: rule.index.clone(),
            subject,
            text,
            fingerprint: event.fingerprint.clone(),
            key: event.key.clone(),
            match_count: event.match_count,
            matched_ids: event.matched_ids.clone(),
            window_start: event.window.start,
            window_end: event.window.end,
            fields,
            details: event.details.clone(),
            timestamp: event.match_time,
        })
    }

    /// Deliver `event` to every destination of `rule`.
    pub async fn dispatch(&self, event: &MatchEvent, rule: &RuleDefinition) -> DispatchOutcome {
        let alert = match self.render(event, rule) {
            Ok(a) => a,
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "failed to render alert");
                return DispatchOutcome::Failed {
                    failed: rule
                        .destinations
                        .iter()
                        .map(|d| (d.clone(), e.to_string()))
                        .collect(),
                };
            }
        };

        let deliveries = rule.destinations.iter().map(|name| {
            let alert = &alert;
            async move {
                let result = match self.destinations.get(name) {
                    Some(dest) => self.send_with_retry(dest.as_ref(), alert).await,
                    None => Err(DispatchError::UnknownDestination(name.clone())),
                };
                (name.clone(), result)
            }
        });

        let mut sent = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(()) => sent.push(name),
                Err(e) => {
                    warn!(
                        rule = %rule.name,
                        destination = %name,
                        error = %e,
                        "alert delivery failed"
                    );
                    failed.push((name, e.to_string()));
                }
            }
        }

        match (sent.is_empty(), failed.is_empty()) {
            (_, true) => DispatchOutcome::Sent { destinations: sent },
            (true, false) => DispatchOutcome::Failed { failed },
            (false, false) => DispatchOutcome::Partial { sent, failed },
        }
    }

    async fn send_with_retry(
        &self,
        dest: &dyn Destination,
        alert: &AlertMessage,
    ) -> Result<(), DispatchError> {
        let mut attempt = 1;
        loop {
            match dest.send(alert).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff.saturating_mul(1 << (attempt - 1).min(16));
                    debug!(
                        destination = %dest.name(),
                        attempt,
                        error = %e,
                        "retrying alert delivery"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
