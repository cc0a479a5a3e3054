//! Push alerts to an Alertmanager through its v2 API.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use super::{AlertMessage, Destination};
use crate::error::DispatchError;

/// One element of the `POST /api/v2/alerts` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

pub struct AlertmanagerDestination {
    name: String,
    endpoint: String,
    labels: BTreeMap<String, String>,
    resolve_after: chrono::Duration,
    client: Client,
}

impl AlertmanagerDestination {
    pub fn new(
        name: &str,
        url: &str,
        labels: &BTreeMap<String, String>,
        resolve_after: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("destination '{name}': failed to build HTTP client"))?;

        Ok(Self {
            name: name.to_string(),
            endpoint: format!("{}/api/v2/alerts", url.trim_end_matches('/')),
            labels: labels.clone(),
            resolve_after: chrono::Duration::from_std(resolve_after)
                .with_context(|| format!("destination '{name}': resolve timeout out of range"))?,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Map a rendered alert onto Alertmanager's label/annotation model.
    pub fn to_postable(&self, alert: &AlertMessage) -> PostableAlert {
        let mut labels = self.labels.clone();
        labels.insert("alertname".to_string(), alert.rule.clone());
        labels.insert("rule_kind".to_string(), alert.kind.clone());
        labels.insert("index".to_string(), alert.index.clone());
        labels.insert("fingerprint".to_string(), alert.fingerprint.clone());
        if let Some(key) = &alert.key {
            labels.insert("key".to_string(), key.clone());
        }

        let annotations = BTreeMap::from([
            ("summary".to_string(), alert.subject.clone()),
            ("description".to_string(), alert.text.clone()),
            ("match_count".to_string(), alert.match_count.to_string()),
            ("matched_ids".to_string(), alert.matched_ids.join(",")),
        ]);

        PostableAlert {
            labels,
            annotations,
            starts_at: alert.timestamp,
            ends_at: alert
                .timestamp
                .checked_add_signed(self.resolve_after)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[async_trait]
impl Destination for AlertmanagerDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertMessage) -> Result<(), DispatchError> {
        let body = [self.to_postable(alert)];
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport {
                destination: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                destination: self.name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
