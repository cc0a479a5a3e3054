//! Per-rule runtime status, read by the admin API and `/metrics`.
//!
//! Each rule's entry is written only by the scheduler slot that owns the
//! rule, one whole [`CycleReport`] at a time. Readers take a cloned
//! point-in-time snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use prometheus::{GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// How the last cycle of a rule ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    NoMatch,
    Matched,
    /// Every match was silenced by an earlier alert.
    Suppressed,
    Error,
}

/// Everything one cycle changes, applied in a single write.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub ran_at: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    pub outcome: CycleOutcome,
    pub matches: u64,
    pub alerts_sent: u64,
    pub suppressed: u64,
    pub errors: Vec<String>,
    pub matched_ids: Vec<String>,
}

impl CycleReport {
    pub fn new(ran_at: DateTime<Utc>) -> Self {
        Self {
            ran_at,
            window_end: None,
            outcome: CycleOutcome::NoMatch,
            matches: 0,
            alerts_sent: 0,
            suppressed: 0,
            errors: Vec::new(),
            matched_ids: Vec::new(),
        }
    }

    /// A cycle that failed before evaluation produced anything.
    pub fn failed(ran_at: DateTime<Utc>, error: String) -> Self {
        Self {
            outcome: CycleOutcome::Error,
            errors: vec![error],
            ..Self::new(ran_at)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleRuntimeStatus {
    pub rule: String,
    pub kind: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_window_end: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    pub last_error: Option<String>,
    pub runs_total: u64,
    pub matches_total: u64,
    pub alerts_sent_total: u64,
    pub suppressed_total: u64,
    pub errors_total: u64,
    /// Identifiers behind the most recent match, capped.
    pub matched_ids: Vec<String>,
}

impl RuleRuntimeStatus {
    fn new(rule: &str, kind: &str) -> Self {
        Self {
            rule: rule.to_string(),
            kind: kind.to_string(),
            last_run: None,
            last_window_end: None,
            last_outcome: None,
            last_error: None,
            runs_total: 0,
            matches_total: 0,
            alerts_sent_total: 0,
            suppressed_total: 0,
            errors_total: 0,
            matched_ids: Vec::new(),
        }
    }
}

pub struct StatusRegistry {
    entries: RwLock<BTreeMap<String, RuleRuntimeStatus>>,
    max_ids: AtomicUsize,
}

impl StatusRegistry {
    pub fn new(max_ids: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_ids: AtomicUsize::new(max_ids),
        }
    }

    /// Cap on the identifiers kept per rule.
    pub fn max_ids(&self) -> usize {
        self.max_ids.load(Ordering::Relaxed)
    }

    /// Change the cap. Applies from the next update on.
    pub fn set_max_ids(&self, max_ids: usize) {
        self.max_ids.store(max_ids, Ordering::Relaxed);
    }

    /// Start tracking a rule. An existing entry is kept, with its kind updated.
    pub fn register(&self, rule: &str, kind: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(rule.to_string())
            .and_modify(|s| s.kind = kind.to_string())
            .or_insert_with(|| RuleRuntimeStatus::new(rule, kind));
    }

    pub fn remove(&self, rule: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rule);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Apply one cycle's report. Returns `false` for an unregistered rule.
    pub fn update(&self, rule: &str, report: CycleReport) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(status) = entries.get_mut(rule) else {
            return false;
        };

        status.last_run = Some(report.ran_at);
        if report.window_end.is_some() {
            status.last_window_end = report.window_end;
        }
        status.last_outcome = Some(report.outcome);
        status.last_error = if report.errors.is_empty() {
            None
        } else {
            Some(report.errors.join("; "))
        };
        status.runs_total += 1;
        status.matches_total += report.matches;
        status.alerts_sent_total += report.alerts_sent;
        status.suppressed_total += report.suppressed;
        status.errors_total += report.errors.len() as u64;
        if report.matches > 0 {
            status.matched_ids = report.matched_ids;
            status.matched_ids.truncate(self.max_ids());
        }
        true
    }

    pub fn get(&self, rule: &str) -> Option<RuleRuntimeStatus> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(rule)
            .cloned()
    }

    /// Point-in-time copy of every entry, ordered by rule name.
    pub fn snapshot(&self) -> Vec<RuleRuntimeStatus> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Prometheus text exposition of the current snapshot.
    ///
    /// A fresh registry is filled from the snapshot on every call, so the
    /// output never carries series for rules that are no longer scheduled.
    pub fn render_prometheus(&self) -> prometheus::Result<String> {
        let registry = Registry::new();
        let rule = &["rule"];

        let last_run = GaugeVec::new(
            Opts::new(
                "elastic_alert_rule_last_run_timestamp_seconds",
                "Unix time of the last evaluation cycle.",
            ),
            rule,
        )?;
        let matches = IntCounterVec::new(
            Opts::new("elastic_alert_rule_matches_total", "Matches produced by the rule."),
            rule,
        )?;
        let sent = IntCounterVec::new(
            Opts::new(
                "elastic_alert_rule_alerts_sent_total",
                "Alerts delivered to at least one destination.",
            ),
            rule,
        )?;
        let suppressed = IntCounterVec::new(
            Opts::new(
                "elastic_alert_rule_suppressed_total",
                "Matches suppressed by an active silence.",
            ),
            rule,
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "elastic_alert_rule_errors_total",
                "Errors recorded during evaluation cycles.",
            ),
            rule,
        )?;
        let matched = IntGaugeVec::new(
            Opts::new(
                "elastic_alert_rule_matched",
                "Identifiers behind the most recent match.",
            ),
            &["rule", "ids"],
        )?;

        registry.register(Box::new(last_run.clone()))?;
        registry.register(Box::new(matches.clone()))?;
        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(suppressed.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(matched.clone()))?;

        for s in self.snapshot() {
            let labels = [s.rule.as_str()];
            let last = s
                .last_run
                .map(|t| t.timestamp_millis() as f64 / 1000.0)
                .unwrap_or(0.0);
            last_run.with_label_values(&labels).set(last);
            matches.with_label_values(&labels).inc_by(s.matches_total);
            sent.with_label_values(&labels).inc_by(s.alerts_sent_total);
            suppressed.with_label_values(&labels).inc_by(s.suppressed_total);
            errors.with_label_values(&labels).inc_by(s.errors_total);

            let ids = s.matched_ids.join(",");
            matched
                .with_label_values(&[s.rule.as_str(), ids.as_str()])
                .set(s.matched_ids.len() as i64);
        }

        let mut out = String::new();
        TextEncoder::new().encode_utf8(&registry.gather(), &mut out)?;
        Ok(out)
    }
}
