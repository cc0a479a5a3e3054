//! Flatline: no documents at all for a continuous `timeframe`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{chrono_span, MatchEvent};
use crate::rules::RuleDefinition;
use crate::search::{SearchResult, TimeWindow};

/// Start of the current silent span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatlineState {
    silent_since: Option<DateTime<Utc>>,
}

impl FlatlineState {
    pub fn silent_since(&self) -> Option<DateTime<Utc>> {
        self.silent_since
    }
}

pub fn evaluate(
    rule: &RuleDefinition,
    timeframe: Duration,
    window: &TimeWindow,
    result: &SearchResult,
    state: &FlatlineState,
) -> (Vec<MatchEvent>, FlatlineState) {
    if result.total > 0 || !result.records.is_empty() {
        return (
            Vec::new(),
            FlatlineState {
                silent_since: Some(window.end),
            },
        );
    }

    let since = state.silent_since.unwrap_or(window.start);
    if window.end - since < chrono_span(timeframe) {
        return (
            Vec::new(),
            FlatlineState {
                silent_since: Some(since),
            },
        );
    }

    let event = MatchEvent::new(rule, TimeWindow::new(since, window.end), None)
        .with_count(0)
        .with_details(json!({
            "silent_since": since.to_rfc3339(),
            "timeframe_secs": timeframe.as_secs(),
        }));

    // The next alert needs another full timeframe of silence.
    (
        vec![event],
        FlatlineState {
            silent_since: Some(window.end),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::fixtures::*;
    use crate::rules::RuleKind;

    const TEN_MIN: Duration = Duration::from_secs(600);

    #[test]
    fn test_fires_once_after_timeframe_of_silence() {
        let rule = rule(RuleKind::Flatline { timeframe: TEN_MIN });
        let empty = count_only(0);

        let (m1, s1) = evaluate(&rule, TEN_MIN, &window(0, 5), &empty, &FlatlineState::default());
        assert!(m1.is_empty());

        let (m2, s2) = evaluate(&rule, TEN_MIN, &window(5, 10), &empty, &s1);
        assert_eq!(m2.len(), 1);
        assert_eq!(m2[0].window, window(0, 10));

        let (m3, _) = evaluate(&rule, TEN_MIN, &window(10, 15), &empty, &s2);
        assert!(m3.is_empty());
    }

    #[test]
    fn test_any_document_resets() {
        let rule = rule(RuleKind::Flatline { timeframe: TEN_MIN });
        let fresh = FlatlineState::default();
        let (_, s1) = evaluate(&rule, TEN_MIN, &window(0, 5), &count_only(0), &fresh);
        let (m2, s2) = evaluate(&rule, TEN_MIN, &window(5, 10), &count_only(1), &s1);
        assert!(m2.is_empty());
        assert_eq!(s2.silent_since(), Some(window(5, 10).end));

        let (m3, _) = evaluate(&rule, TEN_MIN, &window(10, 15), &count_only(0), &s2);
        assert!(m3.is_empty());
    }

    #[test]
    fn test_single_long_window_fires() {
        let rule = rule(RuleKind::Flatline { timeframe: TEN_MIN });
        let fresh = FlatlineState::default();
        let (matches, _) = evaluate(&rule, TEN_MIN, &window(0, 10), &count_only(0), &fresh);
        assert_eq!(matches.len(), 1);
    }
}
