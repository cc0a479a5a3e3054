//! Rule evaluators: one matching algorithm per [`RuleKind`].
//!
//! Every evaluator is a pure function of the rule, the window that was
//! queried, the query result and the state carried over from the previous
//! tick. It returns the matches for this window together with the state to
//! carry forward. The caller decides whether to commit that state; an
//! abandoned or failed cycle simply drops it.

pub mod cardinality;
pub mod change;
pub mod flatline;
pub mod frequency;
pub mod spike;
pub mod terms;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::EvaluationError;
use crate::rules::{RuleDefinition, RuleKind};
use crate::search::{Record, SearchResult, TimeWindow};

pub use self::cardinality::CardinalityState;
pub use self::change::ChangeState;
pub use self::flatline::FlatlineState;
pub use self::frequency::FrequencyState;
pub use self::spike::SpikeState;

/// Placeholder key used when a whitelist value is absent and nulls count.
pub const NULL_VALUE: &str = "<null>";

// ---------------------------------------------------------------------------
// EvaluationState
// ---------------------------------------------------------------------------

/// State carried between ticks of one rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EvaluationState {
    /// Nothing observed yet, or a stateless kind.
    #[default]
    Empty,
    Frequency(FrequencyState),
    Spike(SpikeState),
    Flatline(FlatlineState),
    Change(ChangeState),
    Cardinality(CardinalityState),
}

impl EvaluationState {
    /// Whether this state can be handed to an evaluator of `kind`.
    pub fn fits(&self, kind: &RuleKind) -> bool {
        matches!(
            (self, kind),
            (EvaluationState::Empty, _)
                | (EvaluationState::Frequency(_), RuleKind::Frequency { .. })
                | (EvaluationState::Spike(_), RuleKind::Spike { .. })
                | (EvaluationState::Flatline(_), RuleKind::Flatline { .. })
                | (EvaluationState::Change(_), RuleKind::Change { .. })
                | (EvaluationState::Cardinality(_), RuleKind::Cardinality { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// MatchEvent
// ---------------------------------------------------------------------------

/// One detected occurrence of a rule's condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    pub rule_name: String,
    pub kind: &'static str,
    /// The value that distinguishes this match from others of the same rule.
    pub key: Option<String>,
    pub matched_ids: Vec<String>,
    /// Matched documents, capped like `matched_ids`.
    #[serde(skip)]
    pub records: Vec<Record>,
    pub window: TimeWindow,
    pub match_time: DateTime<Utc>,
    /// Number of documents behind the match, before capping.
    pub match_count: u64,
    pub details: Value,
    pub fingerprint: String,
}

impl MatchEvent {
    pub fn new(rule: &RuleDefinition, window: TimeWindow, key: Option<String>) -> Self {
        Self {
            fingerprint: fingerprint(&rule.name, key.as_deref()),
            rule_name: rule.name.clone(),
            kind: rule.kind.as_str(),
            key,
            matched_ids: Vec::new(),
            records: Vec::new(),
            match_time: window.end,
            window,
            match_count: 0,
            details: Value::Null,
        }
    }

    /// Attach matched documents, keeping the first `cap` in arrival order.
    pub fn with_records<'a>(
        mut self,
        records: impl IntoIterator<Item = &'a Record>,
        cap: usize,
    ) -> Self {
        self.records = records.into_iter().take(cap).cloned().collect();
        self.matched_ids = self.records.iter().map(|r| r.id.clone()).collect();
        self
    }

    /// Attach identifiers without documents, keeping the first `cap`.
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = String>, cap: usize) -> Self {
        self.matched_ids = ids.into_iter().take(cap).collect();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.match_count = count;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Deterministic dedup key for a rule and its matched key value.
pub fn fingerprint(rule_name: &str, key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_name.as_bytes());
    hasher.update([0u8]);
    if let Some(key) = key {
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Dispatch by kind
// ---------------------------------------------------------------------------

/// Run the evaluator for `rule.kind` over one window.
///
/// `max_ids` caps the identifiers and documents carried by each match.
pub fn evaluate(
    rule: &RuleDefinition,
    window: &TimeWindow,
    result: &SearchResult,
    state: &EvaluationState,
    max_ids: usize,
) -> Result<(Vec<MatchEvent>, EvaluationState), EvaluationError> {
    if !state.fits(&rule.kind) {
        return Err(EvaluationError::StateMismatch);
    }

    match &rule.kind {
        RuleKind::Frequency {
            num_events,
            timeframe,
        } => {
            let prior = match state {
                EvaluationState::Frequency(s) => s.clone(),
                _ => FrequencyState::default(),
            };
            let (matches, next) =
                frequency::evaluate(rule, *num_events, *timeframe, window, result, prior, max_ids);
            Ok((matches, EvaluationState::Frequency(next)))
        }
        RuleKind::Spike {
            spike_height,
            direction,
            threshold_ref,
            threshold_cur,
        } => {
            let prior = match state {
                EvaluationState::Spike(s) => s.clone(),
                _ => SpikeState::default(),
            };
            let params = spike::SpikeParams {
                height: *spike_height,
                direction: *direction,
                threshold_ref: *threshold_ref,
                threshold_cur: *threshold_cur,
            };
            let (matches, next) = spike::evaluate(rule, &params, window, result, &prior, max_ids);
            Ok((matches, EvaluationState::Spike(next)))
        }
        RuleKind::Flatline { timeframe } => {
            let prior = match state {
                EvaluationState::Flatline(s) => s.clone(),
                _ => FlatlineState::default(),
            };
            let (matches, next) = flatline::evaluate(rule, *timeframe, window, result, &prior);
            Ok((matches, EvaluationState::Flatline(next)))
        }
        RuleKind::Blacklist {
            compare_key,
            values,
        } => {
            let matches = terms::evaluate(
                rule,
                compare_key,
                terms::Membership::Blacklist(values),
                window,
                result,
                max_ids,
            )?;
            Ok((matches, EvaluationState::Empty))
        }
        RuleKind::Whitelist {
            compare_key,
            values,
            ignore_null,
        } => {
            let matches = terms::evaluate(
                rule,
                compare_key,
                terms::Membership::Whitelist {
                    values,
                    ignore_null: *ignore_null,
                },
                window,
                result,
                max_ids,
            )?;
            Ok((matches, EvaluationState::Empty))
        }
        RuleKind::Change {
            query_key,
            compare_key,
            ignore_null,
        } => {
            let prior = match state {
                EvaluationState::Change(s) => s.clone(),
                _ => ChangeState::default(),
            };
            let keys = change::ChangeKeys {
                query_key,
                compare_key,
                ignore_null: *ignore_null,
            };
            let (matches, next) = change::evaluate(rule, &keys, window, result, prior, max_ids)?;
            Ok((matches, EvaluationState::Change(next)))
        }
        RuleKind::Cardinality {
            field,
            timeframe,
            max,
            min,
        } => {
            let prior = match state {
                EvaluationState::Cardinality(s) => s.clone(),
                _ => CardinalityState::default(),
            };
            let bounds = cardinality::Bounds {
                timeframe: *timeframe,
                max: *max,
                min: *min,
            };
            let (matches, next) =
                cardinality::evaluate(rule, field, &bounds, window, result, prior, max_ids)?;
            Ok((matches, EvaluationState::Cardinality(next)))
        }
    }
}

/// Identifier to attach to an evaluation error about `record`.
pub(crate) fn record_label(record: &Record) -> String {
    if record.index.is_empty() {
        record.id.clone()
    } else {
        format!("{}/{}", record.index, record.id)
    }
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn chrono_span(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------
