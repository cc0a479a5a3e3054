//! Elasticsearch-compatible HTTP gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Record, SearchGateway, SearchResult};
use crate::config::SearchConfig;
use crate::error::QueryError;

/// Longest error body kept in a [`QueryError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Talks to one or more backend nodes, rotating between them per request.
pub struct ElasticGateway {
    client: Client,
    addresses: Vec<String>,
    next: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticGateway {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("failed to build search HTTP client")?;

        Ok(Self {
            client,
            addresses: config
                .addresses
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn next_address(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len().max(1);
        self.addresses.get(i).map(String::as_str).unwrap_or_default()
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        }
    }

    /// Check that at least one configured node answers.
    pub async fn ping(&self) -> Result<(), QueryError> {
        let mut last_err = QueryError::Transport("no search addresses configured".to_string());
        for addr in &self.addresses {
            match self.with_auth(self.client.get(addr.as_str())).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(address = %addr, "search backend reachable");
                    return Ok(());
                }
                Ok(resp) => {
                    last_err = QueryError::Status {
                        status: resp.status().as_u16(),
                        body: String::new(),
                    };
                }
                Err(e) => last_err = e.into(),
            }
            warn!(address = %addr, error = %last_err, "search backend not reachable");
        }
        Err(last_err)
    }

    async fn post(&self, index: &str, endpoint: &str, body: &Value) -> Result<Value, QueryError> {
        let url = format!("{}/{}/{}", self.next_address(), index, endpoint);
        let resp = self
            .with_auth(self.client.post(&url))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl SearchGateway for ElasticGateway {
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResult, QueryError> {
        let value = self.post(index, "_search", body).await?;
        parse_search_response(&value)
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64, QueryError> {
        let value = self.post(index, "_count", body).await?;
        value
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| QueryError::Decode("missing 'count' in count response".to_string()))
    }
}

/// Decode a `_search` response body.
pub fn parse_search_response(value: &Value) -> Result<SearchResult, QueryError> {
    let hits = value
        .get("hits")
        .ok_or_else(|| QueryError::Decode("missing 'hits' in search response".to_string()))?;

    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(obj) => obj.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };

    let records = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(parse_hit).collect())
        .unwrap_or_default();

    Ok(SearchResult { records, total })
}

fn parse_hit(hit: &Value) -> Option<Record> {
    let id = hit.get("_id")?.as_str()?.to_string();
    let index = hit
        .get("_index")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let source = hit.get("_source").cloned().unwrap_or(Value::Null);

    // Date sorts come back as epoch millis in the first sort value.
    let timestamp = hit
        .get("sort")
        .and_then(|s| s.get(0))
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .or_else(|| {
            source
                .get("@timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        });

    Some(Record {
        id,
        index,
        timestamp,
        source,
    })
}
