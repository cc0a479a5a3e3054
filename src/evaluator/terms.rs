//! Blacklist and whitelist: per-document membership of one field value.
//!
//! Stateless. Offending documents are grouped by value so that each distinct
//! value yields its own match (and its own fingerprint).

use std::collections::{HashMap, HashSet};

use serde_json::json;

use super::{record_label, MatchEvent, NULL_VALUE};
use crate::error::EvaluationError;
use crate::rules::RuleDefinition;
use crate::search::{Record, Scalar, SearchResult, TimeWindow};

pub enum Membership<'a> {
    /// Match values in the set.
    Blacklist(&'a HashSet<String>),
    /// Match values outside the set.
    Whitelist {
        values: &'a HashSet<String>,
        ignore_null: bool,
    },
}

impl Membership<'_> {
    /// The offending value for a document, if it offends.
    fn offending(&self, value: Scalar) -> Option<String> {
        match (self, value) {
            (Membership::Blacklist(set), Scalar::Value(v)) => set.contains(&v).then_some(v),
            (Membership::Blacklist(_), _) => None,
            (Membership::Whitelist { values, .. }, Scalar::Value(v)) => {
                (!values.contains(&v)).then_some(v)
            }
            (Membership::Whitelist { ignore_null, .. }, _) => {
                (!ignore_null).then(|| NULL_VALUE.to_string())
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Membership::Blacklist(_) => "blacklist",
            Membership::Whitelist { .. } => "whitelist",
        }
    }
}

pub fn evaluate(
    rule: &RuleDefinition,
    compare_key: &str,
    membership: Membership<'_>,
    window: &TimeWindow,
    result: &SearchResult,
    max_ids: usize,
) -> Result<Vec<MatchEvent>, EvaluationError> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Record>> = HashMap::new();

    for record in &result.records {
        let value = record.scalar(compare_key);
        if value == Scalar::Compound {
            return Err(EvaluationError::UnsupportedValue {
                record: record_label(record),
                field: compare_key.to_string(),
            });
        }
        if let Some(v) = membership.offending(value) {
            groups
                .entry(v.clone())
                .or_insert_with(|| {
                    order.push(v);
                    Vec::new()
                })
                .push(record);
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|value| {
            let docs = groups.remove(&value)?;
            Some(
                MatchEvent::new(rule, *window, Some(value.clone()))
                    .with_records(docs.iter().copied(), max_ids)
                    .with_count(docs.len() as u64)
                    .with_details(json!({
                        "list": membership.label(),
                        "compare_key": compare_key,
                        "value": value,
                    })),
            )
        })
        .collect())
}
