//! Frequency: at least `num_events` documents within `timeframe`.
//!
//! Each tick contributes one bucket (its window and hit count). Buckets that
//! fall entirely outside the trailing `timeframe` are evicted, so the sum
//! slides across ticks when `timeframe` is longer than `run_every`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{chrono_span, MatchEvent};
use crate::rules::RuleDefinition;
use crate::search::{SearchResult, TimeWindow};

#[derive(Debug, Clone, PartialEq)]
struct Bucket {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    count: u64,
    ids: Vec<String>,
}

/// Sliding per-window counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrequencyState {
    buckets: VecDeque<Bucket>,
}

impl FrequencyState {
    /// Documents counted within the current span.
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

pub fn evaluate(
    rule: &RuleDefinition,
    num_events: u64,
    timeframe: Duration,
    window: &TimeWindow,
    result: &SearchResult,
    mut state: FrequencyState,
    max_ids: usize,
) -> (Vec<MatchEvent>, FrequencyState) {
    let count = result.total.max(result.records.len() as u64);
    state.buckets.push_back(Bucket {
        start: window.start,
        end: window.end,
        count,
        ids: result
            .records
            .iter()
            .take(max_ids)
            .map(|r| r.id.clone())
            .collect(),
    });

    let horizon = window.end - chrono_span(timeframe);
    while state.buckets.front().is_some_and(|b| b.end <= horizon) {
        state.buckets.pop_front();
    }

    let total = state.count();
    if total < num_events {
        return (Vec::new(), state);
    }

    let span_start = state
        .buckets
        .front()
        .map(|b| b.start)
        .unwrap_or(window.start);
    let ids: Vec<String> = state
        .buckets
        .iter()
        .flat_map(|b| b.ids.iter().cloned())
        .collect();

    let event = MatchEvent::new(rule, TimeWindow::new(span_start, window.end), None)
        .with_records(&result.records, max_ids)
        .with_ids(ids, max_ids)
        .with_count(total)
        .with_details(json!({
            "num_events": num_events,
            "count": total,
            "timeframe_secs": timeframe.as_secs(),
        }));

    // Counting restarts once the threshold has been reported.
    state.buckets.clear();
    (vec![event], state)
}
