//! Cardinality: distinct values of a field within `timeframe` fall outside
//! `[min, max]`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{chrono_span, record_label, MatchEvent};
use crate::error::EvaluationError;
use crate::rules::RuleDefinition;
use crate::search::{Scalar, SearchResult, TimeWindow};

/// Distinct values with the time each was last seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardinalityState {
    seen: HashMap<String, DateTime<Utc>>,
    observing_since: Option<DateTime<Utc>>,
}

impl CardinalityState {
    pub fn distinct(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub timeframe: Duration,
    pub max: Option<u64>,
    pub min: Option<u64>,
}

pub fn evaluate(
    rule: &RuleDefinition,
    field: &str,
    bounds: &Bounds,
    window: &TimeWindow,
    result: &SearchResult,
    mut state: CardinalityState,
    max_ids: usize,
) -> Result<(Vec<MatchEvent>, CardinalityState), EvaluationError> {
    let since = *state.observing_since.get_or_insert(window.start);

    for record in &result.records {
        let value = match record.scalar(field) {
            Scalar::Value(v) => v,
            Scalar::Missing => continue,
            Scalar::Compound => {
                return Err(EvaluationError::UnsupportedValue {
                    record: record_label(record),
                    field: field.to_string(),
                })
            }
        };
        let at = record.timestamp.unwrap_or(window.end);
        let slot = state.seen.entry(value).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    let horizon = window.end - chrono_span(bounds.timeframe);
    state.seen.retain(|_, last| *last > horizon);

    let distinct = state.seen.len() as u64;
    let over = bounds.max.is_some_and(|max| distinct > max);
    // A minimum only means something once a full timeframe has been observed.
    let under = bounds.min.is_some_and(|min| distinct < min)
        && window.end - since >= chrono_span(bounds.timeframe);

    if !over && !under {
        return Ok((Vec::new(), state));
    }

    let event = MatchEvent::new(rule, *window, None)
        .with_records(&result.records, max_ids)
        .with_count(result.total.max(result.records.len() as u64))
        .with_details(json!({
            "field": field,
            "cardinality": distinct,
            "max_cardinality": bounds.max,
            "min_cardinality": bounds.min,
            "bound": if over { "max" } else { "min" },
        }));
    Ok((vec![event], state))
}
