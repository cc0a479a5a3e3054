//! HTTP POST of the JSON alert payload.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use super::{AlertMessage, Destination};
use crate::error::DispatchError;

pub struct WebhookDestination {
    name: String,
    url: String,
    client: Client,
}

impl WebhookDestination {
    pub fn new(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (k, v) in headers {
            let key = HeaderName::from_bytes(k.as_bytes())
                .with_context(|| format!("destination '{name}': invalid header name '{k}'"))?;
            let value = HeaderValue::from_str(v)
                .with_context(|| format!("destination '{name}': invalid value for header '{k}'"))?;
            header_map.insert(key, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()
            .with_context(|| format!("destination '{name}': failed to build HTTP client"))?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertMessage) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
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
