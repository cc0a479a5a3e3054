//! The per-rule slot loop and a single evaluation cycle.
//!
//! A cycle has two phases. The query phase (search, retries, evaluation) can
//! be abandoned at any suspension point when the slot is cancelled; nothing
//! it computed is kept. The commit phase (dedup, dispatch, status) checks for
//! cancellation between matches and while a dispatch is in flight. A match
//! cut off mid-dispatch gives back the silence it claimed, so no dedup entry
//! outlives an alert that was never delivered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::Services;
use crate::dedup::SilenceEntry;
use crate::error::{CycleError, QueryError};
use crate::evaluator::{self, chrono_span, EvaluationState, MatchEvent};
use crate::rules::RuleDefinition;
use crate::search::{build_count_body, build_search_body, SearchResult, TimeWindow};
use crate::status::{CycleOutcome, CycleReport, StatusRegistry};

/// Shared handles a slot needs.
#[derive(Clone)]
pub(crate) struct SlotContext {
    pub services: Arc<super::SharedServices>,
    pub status: Arc<StatusRegistry>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
}

/// What a finished cycle hands back to its slot.
struct CycleCommit {
    /// `None` keeps the prior evaluation state.
    state: Option<EvaluationState>,
    /// `None` keeps the prior window end, so the same window is retried.
    window_end: Option<DateTime<Utc>>,
    report: CycleReport,
}

/// Upper bound of a window evaluated at `now`.
fn window_end_at(now: DateTime<Utc>, rule: &RuleDefinition) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_span(rule.buffer_time))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run one rule until cancelled or its definition channel closes.
pub(crate) async fn run_slot(
    ctx: SlotContext,
    mut rule_rx: watch::Receiver<Arc<RuleDefinition>>,
    first_delay: Duration,
) {
    let mut rule = rule_rx.borrow_and_update().clone();
    let mut state = EvaluationState::Empty;
    let mut last_end = window_end_at(ctx.clock.now(), &rule);

    let mut ticker = interval_at(Instant::now() + first_delay, rule.run_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(rule = %rule.name, first_delay_ms = first_delay.as_millis() as u64, "rule slot started");

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            changed = rule_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = rule_rx.borrow_and_update().clone();
                if !state.fits(&next.kind) {
                    info!(
                        rule = %next.name,
                        kind = %next.kind,
                        "rule kind changed, evaluation state reset"
                    );
                    state = EvaluationState::Empty;
                }
                if next.run_every != rule.run_every {
                    ticker = interval_at(Instant::now() + next.run_every, next.run_every);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
                debug!(rule = %next.name, "rule definition updated");
                rule = next;
            }
            _ = ticker.tick() => {
                let Some(commit) = run_cycle(&ctx, &rule, &state, last_end).await else {
                    info!(rule = %rule.name, "cycle abandoned on cancellation");
                    break;
                };
                if let Some(next) = commit.state {
                    state = next;
                }
                if let Some(end) = commit.window_end {
                    last_end = end;
                }
                ctx.status.update(&rule.name, commit.report);
            }
        }
    }

    debug!(rule = %rule.name, "rule slot stopped");
}

/// Run one cycle. `None` means the cycle was abandoned and must leave no trace.
async fn run_cycle(
    ctx: &SlotContext,
    rule: &RuleDefinition,
    state: &EvaluationState,
    last_end: DateTime<Utc>,
) -> Option<CycleCommit> {
    let services = ctx.services.current();
    let settings = &services.settings;
    let ran_at = ctx.clock.now();

    let end = window_end_at(ran_at, rule);
    let floor = end
        .checked_sub_signed(chrono_span(settings.max_catch_up()))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let window = TimeWindow::new(last_end.max(floor), end);
    if window.is_empty() {
        debug!(rule = %rule.name, "empty window, nothing to evaluate");
        return Some(CycleCommit {
            state: None,
            window_end: None,
            report: CycleReport::new(ran_at),
        });
    }

    // -- query phase ------------------------------------------------------

    let mut attempt = 1;
    let result = loop {
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => return None,
            r = query(services.as_ref(), rule, &window) => r,
        };
        match outcome {
            Ok(r) => break r,
            Err(e) if attempt >= settings.max_query_attempts => {
                let err = CycleError::Query {
                    attempts: attempt,
                    source: e,
                };
                warn!(rule = %rule.name, error = %err, "query failed, window will be retried");
                return Some(CycleCommit {
                    state: None,
                    window_end: None,
                    report: CycleReport::failed(ran_at, err.to_string()),
                });
            }
            Err(e) => {
                let delay = settings.query_backoff(attempt);
                debug!(
                    rule = %rule.name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "query failed, backing off"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    };

    let (matches, next_state) =
        match evaluator::evaluate(rule, &window, &result, state, settings.max_matched_ids) {
            Ok(v) => v,
            Err(e) => {
                let err = CycleError::from(e);
                warn!(rule = %rule.name, error = %err, "evaluation failed, skipping window");
                let mut report = CycleReport::failed(ran_at, err.to_string());
                report.window_end = Some(window.end);
                return Some(CycleCommit {
                    state: None,
                    window_end: Some(window.end),
                    report,
                });
            }
        };

    if ctx.cancel.is_cancelled() {
        return None;
    }

    // -- commit phase -----------------------------------------------------

    let mut report = CycleReport::new(ran_at);
    report.window_end = Some(window.end);
    report.matches = matches.len() as u64;

    for event in &matches {
        if ctx.cancel.is_cancelled() {
            info!(rule = %rule.name, "stopping commit on cancellation");
            return None;
        }
        report.matched_ids.extend(event.matched_ids.iter().cloned());
        if deliver(&services, rule, event, ran_at, &ctx.cancel, &mut report).await
            == Delivery::Abandoned
        {
            return None;
        }
    }
    report.matched_ids.truncate(settings.max_matched_ids);

    report.outcome = if report.matches == 0 {
        CycleOutcome::NoMatch
    } else if report.alerts_sent > 0 {
        CycleOutcome::Matched
    } else if report.suppressed == report.matches {
        CycleOutcome::Suppressed
    } else {
        CycleOutcome::Error
    };

    if report.matches > 0 {
        info!(
            rule = %rule.name,
            matches = report.matches,
            sent = report.alerts_sent,
            suppressed = report.suppressed,
            "cycle produced matches"
        );
    }

    Some(CycleCommit {
        state: Some(next_state),
        window_end: Some(window.end),
        report,
    })
}

async fn query(
    services: &Services,
    rule: &RuleDefinition,
    window: &TimeWindow,
) -> Result<SearchResult, QueryError> {
    if rule.use_count_query {
        let total = services
            .gateway
            .count(&rule.index, &build_count_body(rule, window))
            .await?;
        Ok(SearchResult {
            records: Vec::new(),
            total,
        })
    } else {
        services
            .gateway
            .search(&rule.index, &build_search_body(rule, window))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Done,
    /// Cancelled while dispatching; any claimed silence was released.
    Abandoned,
}

/// Dedup then dispatch one match, folding the result into `report`.
async fn deliver(
    services: &Services,
    rule: &RuleDefinition,
    event: &MatchEvent,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
    report: &mut CycleReport,
) -> Delivery {
    let mut claimed = None;

    if !rule.realert.is_zero() {
        let entry = SilenceEntry {
            fingerprint: event.fingerprint.clone(),
            rule_name: rule.name.clone(),
            expires_at: event
                .match_time
                .checked_add_signed(chrono_span(rule.realert))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            created_at: now,
        };
        match services.dedup.check_and_set(&entry, event.match_time).await {
            Ok(true) => claimed = Some(entry),
            Ok(false) => {
                debug!(
                    rule = %rule.name,
                    fingerprint = %event.fingerprint,
                    "match suppressed by silence"
                );
                report.suppressed += 1;
                return Delivery::Done;
            }
            Err(e) => {
                // Deliver anyway rather than lose a real alert.
                warn!(
                    rule = %rule.name,
                    error = %e,
                    "dedup store unavailable, dispatching without silence"
                );
                report.errors.push(e.to_string());
            }
        }
    }

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        o = services.dispatcher.dispatch(event, rule) => Some(o),
    };
    let Some(outcome) = outcome else {
        if let Some(entry) = claimed {
            if let Err(e) = services.dedup.release(&entry).await {
                warn!(
                    rule = %rule.name,
                    error = %e,
                    "failed to release silence of abandoned dispatch"
                );
            }
        }
        info!(
            rule = %rule.name,
            fingerprint = %event.fingerprint,
            "dispatch abandoned on cancellation"
        );
        return Delivery::Abandoned;
    };

    if outcome.delivered() {
        report.alerts_sent += 1;
    }
    if let Some(summary) = outcome.error_summary() {
        report.errors.push(summary);
    }

    if !outcome.delivered() {
        if let Some(entry) = claimed {
            if let Err(e) = services.dedup.release(&entry).await {
                warn!(
                    rule = %rule.name,
                    error = %e,
                    "failed to release silence after failed dispatch"
                );
                report.errors.push(e.to_string());
            }
        }
    }
    Delivery::Done
}
