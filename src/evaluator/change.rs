//! Change: `compare_key` differs from the last value seen for the same
//! `query_key`.

use std::collections::HashMap;

use serde_json::json;

use super::{record_label, MatchEvent};
use crate::error::EvaluationError;
use crate::rules::RuleDefinition;
use crate::search::{Record, Scalar, SearchResult, TimeWindow};

/// Last observed value per group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeState {
    last: HashMap<String, String>,
}

impl ChangeState {
    pub fn last_value(&self, group: &str) -> Option<&str> {
        self.last.get(group).map(String::as_str)
    }

    pub fn groups(&self) -> usize {
        self.last.len()
    }
}

pub struct ChangeKeys<'a> {
    pub query_key: &'a str,
    pub compare_key: &'a str,
    pub ignore_null: bool,
}

/// Read `field`, or `None` when a missing value should be skipped.
fn read(
    record: &Record,
    field: &str,
    ignore_null: bool,
) -> Result<Option<String>, EvaluationError> {
    match record.scalar(field) {
        Scalar::Value(v) => Ok(Some(v)),
        Scalar::Missing if ignore_null => Ok(None),
        Scalar::Missing => Err(EvaluationError::MissingField {
            record: record_label(record),
            field: field.to_string(),
        }),
        Scalar::Compound => Err(EvaluationError::UnsupportedValue {
            record: record_label(record),
            field: field.to_string(),
        }),
    }
}

pub fn evaluate(
    rule: &RuleDefinition,
    keys: &ChangeKeys<'_>,
    window: &TimeWindow,
    result: &SearchResult,
    mut state: ChangeState,
    max_ids: usize,
) -> Result<(Vec<MatchEvent>, ChangeState), EvaluationError> {
    let mut matches = Vec::new();

    for record in &result.records {
        let Some(group) = read(record, keys.query_key, keys.ignore_null)? else {
            continue;
        };
        let Some(value) = read(record, keys.compare_key, keys.ignore_null)? else {
            continue;
        };

        if let Some(previous) = state.last.get(&group) {
            if *previous != value {
                matches.push(
                    MatchEvent::new(rule, *window, Some(group.clone()))
                        .with_records(std::iter::once(record), max_ids)
                        .with_count(1)
                        .with_details(json!({
                            "query_key": keys.query_key,
                            "compare_key": keys.compare_key,
                            "group": group,
                            "old_value": previous,
                            "new_value": value,
                        })),
                );
            }
        }
        state.last.insert(group, value);
    }

    Ok((matches, state))
}
