//! Spike: the current window count moved by more than `spike_height` times
//! relative to the previous window.

use serde_json::json;

use super::MatchEvent;
use crate::rules::{RuleDefinition, SpikeDirection};
use crate::search::{SearchResult, TimeWindow};

/// Count and length of the last evaluated window, the reference for the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpikeState {
    reference: Option<Reference>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reference {
    count: u64,
    length_ms: i64,
}

impl SpikeState {
    /// A state whose previous window held `count` documents over `window`.
    pub fn with_reference(count: u64, window: &TimeWindow) -> Self {
        Self {
            reference: Some(Reference {
                count,
                length_ms: window.length().num_milliseconds(),
            }),
        }
    }

    pub fn is_warm(&self) -> bool {
        self.reference.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpikeParams {
    pub height: f64,
    pub direction: SpikeDirection,
    pub threshold_ref: Option<u64>,
    pub threshold_cur: Option<u64>,
}

pub fn evaluate(
    rule: &RuleDefinition,
    params: &SpikeParams,
    window: &TimeWindow,
    result: &SearchResult,
    state: &SpikeState,
    max_ids: usize,
) -> (Vec<MatchEvent>, SpikeState) {
    let current = result.total.max(result.records.len() as u64);
    let next = SpikeState::with_reference(current, window);

    let Some(reference) = state.reference else {
        return (Vec::new(), next);
    };

    // Scale the reference to the current window length.
    let length_ms = window.length().num_milliseconds();
    let scaled_ref = if reference.length_ms > 0 && length_ms > 0 {
        reference.count as f64 * length_ms as f64 / reference.length_ms as f64
    } else {
        reference.count as f64
    };

    if params.threshold_ref.is_some_and(|min| reference.count < min)
        || params.threshold_cur.is_some_and(|min| current < min)
    {
        return (Vec::new(), next);
    }

    let cur = current as f64;
    let up = scaled_ref > 0.0 && cur / scaled_ref > params.height;
    let down = scaled_ref > 0.0 && (cur == 0.0 || scaled_ref / cur > params.height);

    let fired = match params.direction {
        SpikeDirection::Up => up.then_some("up"),
        SpikeDirection::Down => down.then_some("down"),
        SpikeDirection::Both => {
            if up {
                Some("up")
            } else if down {
                Some("down")
            } else {
                None
            }
        }
    };

    let Some(direction) = fired else {
        return (Vec::new(), next);
    };

    let ratio = if scaled_ref > 0.0 { cur / scaled_ref } else { 0.0 };
    let event = MatchEvent::new(rule, *window, None)
        .with_records(&result.records, max_ids)
        .with_count(current)
        .with_details(json!({
            "direction": direction,
            "reference_count": reference.count,
            "current_count": current,
            "ratio": ratio,
            "spike_height": params.height,
        }));
    (vec![event], next)
}
