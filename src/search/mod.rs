//! Search backend interface consumed by the scheduler.
//!
//! The scheduler only needs "run this query, return matching records and a
//! total". [`elastic::ElasticGateway`] is the HTTP implementation; tests
//! provide their own [`SearchGateway`].

pub mod elastic;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QueryError;
use crate::rules::RuleDefinition;

pub use self::elastic::ElasticGateway;

/// One document returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub index: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Value,
}

impl Record {
    /// Look up a dotted path (`host.name`) in the document source.
    ///
    /// A literal key containing dots (`"host.name": ...`) is tried first.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.source, path)
    }

    /// Field value rendered as a comparable string.
    pub fn scalar(&self, path: &str) -> Scalar {
        match self.field(path) {
            None | Some(Value::Null) => Scalar::Missing,
            Some(Value::String(s)) => Scalar::Value(s.clone()),
            Some(Value::Bool(b)) => Scalar::Value(b.to_string()),
            Some(Value::Number(n)) => Scalar::Value(n.to_string()),
            Some(_) => Scalar::Compound,
        }
    }
}

/// Outcome of reading a single field for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    /// Absent or null.
    Missing,
    Value(String),
    /// An object or array, which cannot be compared.
    Compound,
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let obj = value.as_object()?;
    if let Some(v) = obj.get(path) {
        return Some(v);
    }
    let (head, rest) = path.split_once('.')?;
    lookup(obj.get(head)?, rest)
}

/// Records plus the backend's total hit count (which may exceed `records.len()`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub records: Vec<Record>,
    pub total: u64,
}

/// Half-open evaluation window `(start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Access to the search backend.
#[async_trait]
pub trait SearchGateway: Send + Sync {
    /// Run a search request body against `index`.
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResult, QueryError>;

    /// Count documents matching a query body against `index`.
    async fn count(&self, index: &str, body: &Value) -> Result<u64, QueryError>;
}

// ---------------------------------------------------------------------------
// Query construction
// ---------------------------------------------------------------------------

fn range_filter(rule: &RuleDefinition, window: &TimeWindow) -> Value {
    json!({
        "bool": {
            "filter": [
                rule.query.clone(),
                {
                    "range": {
                        rule.timestamp_field.clone(): {
                            "gt": window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
                            "lte": window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
                            "format": "strict_date_optional_time"
                        }
                    }
                }
            ]
        }
    })
}

/// Search body for `rule` over `window`, oldest documents first.
pub fn build_search_body(rule: &RuleDefinition, window: &TimeWindow) -> Value {
    let mut body = json!({
        "query": range_filter(rule, window),
        "sort": [ { rule.timestamp_field.clone(): { "order": "asc" } } ],
        "size": rule.max_hits,
        "track_total_hits": true
    });
    if let Some(fields) = rule.source_fields() {
        body["_source"] = json!(fields);
    }
    body
}

/// Count body for `rule` over `window`.
pub fn build_count_body(rule: &RuleDefinition, window: &TimeWindow) -> Value {
    json!({ "query": range_filter(rule, window) })
}
