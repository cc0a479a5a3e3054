//! End-to-end scheduler behaviour under tokio's paused clock.
//!
//! The search backend, dedup store and destination are in-process doubles;
//! everything between them (slots, evaluators, dedup, dispatch, status) is
//! the real code.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use elasticalert::config::SchedulerConfig;
use elasticalert::dedup::{DedupStore, MemoryDedupStore, SilenceEntry};
use elasticalert::dispatch::{AlertDispatcher, AlertMessage, Destination};
use elasticalert::error::{DedupError, DispatchError, QueryError};
use elasticalert::rules::{
    loader, DestinationCatalog, RuleDefinition, RuleKind, RuleSet, SpikeDirection,
};
use elasticalert::scheduler::{Scheduler, Services, SharedServices, TokioClock};
use elasticalert::search::{Record, SearchGateway, SearchResult};
use elasticalert::status::{CycleOutcome, StatusRegistry};

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

/// Per-index scripted responses. Once an index's script is exhausted, its
/// fallback response repeats.
#[derive(Default)]
struct ScriptedGateway {
    scripts: Mutex<HashMap<String, VecDeque<SearchResult>>>,
    fallback: Mutex<HashMap<String, SearchResult>>,
    latency: Duration,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn script(&self, index: &str, results: Vec<SearchResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(index.to_string(), results.into());
    }

    fn always(&self, index: &str, result: SearchResult) {
        self.fallback.lock().unwrap().insert(index.to_string(), result);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().values().sum()
    }

    fn max_in_flight(&self, index: &str) -> usize {
        self.max_in_flight.lock().unwrap().get(index).copied().unwrap_or(0)
    }

    fn next(&self, index: &str) -> SearchResult {
        if let Some(r) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(index)
            .and_then(VecDeque::pop_front)
        {
            return r;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

/// Decrements the in-flight counter even when the query future is dropped.
struct InFlight<'a> {
    gateway: &'a ScriptedGateway,
    index: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.gateway.in_flight.lock().unwrap().get_mut(&self.index) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl SearchGateway for ScriptedGateway {
    async fn search(&self, index: &str, _body: &Value) -> Result<SearchResult, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let n = in_flight.entry(index.to_string()).or_default();
            *n += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            let m = max.entry(index.to_string()).or_default();
            *m = (*m).max(*n);
        }
        let _guard = InFlight {
            gateway: self,
            index: index.to_string(),
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.next(index))
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64, QueryError> {
        self.search(index, body).await.map(|r| r.total)
    }
}

/// Memory dedup store that counts writes.
#[derive(Default)]
struct CountingDedup {
    inner: MemoryDedupStore,
    writes: AtomicUsize,
}

#[async_trait]
impl DedupStore for CountingDedup {
    async fn get(&self, fingerprint: &str) -> Result<Option<SilenceEntry>, DedupError> {
        self.inner.get(fingerprint).await
    }

    async fn set(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(entry).await
    }

    async fn check_and_set(
        &self,
        entry: &SilenceEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, DedupError> {
        let written = self.inner.check_and_set(entry, now).await?;
        if written {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn release(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        self.inner.release(entry).await
    }

    async fn list(&self) -> Result<Vec<SilenceEntry>, DedupError> {
        self.inner.list().await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DedupError> {
        self.inner.purge_expired(now).await
    }
}

/// Destination that keeps every alert it receives.
struct Capture {
    sent: Mutex<Vec<AlertMessage>>,
}

impl Capture {
    fn sent(&self) -> Vec<AlertMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Destination for Capture {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &AlertMessage) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Fails the first `failures` searches, then serves `result`. Records the
/// window bounds of every request.
struct FlakyGateway {
    failures: usize,
    result: SearchResult,
    calls: AtomicUsize,
    windows: Mutex<Vec<(String, String)>>,
}

impl FlakyGateway {
    fn new(failures: usize, result: SearchResult) -> Self {
        Self {
            failures,
            result,
            calls: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    fn windows(&self) -> Vec<(String, String)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchGateway for FlakyGateway {
    async fn search(&self, _index: &str, body: &Value) -> Result<SearchResult, QueryError> {
        let range = &body["query"]["bool"]["filter"][1]["range"]["@timestamp"];
        self.windows.lock().unwrap().push((
            range["gt"].as_str().unwrap_or_default().to_string(),
            range["lte"].as_str().unwrap_or_default().to_string(),
        ));
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(QueryError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self.result.clone())
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64, QueryError> {
        self.search(index, body).await.map(|r| r.total)
    }
}

/// Dedup store whose backend is down.
struct DownDedup;

fn down() -> DedupError {
    DedupError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl DedupStore for DownDedup {
    async fn get(&self, _: &str) -> Result<Option<SilenceEntry>, DedupError> {
        Err(down())
    }

    async fn set(&self, _: &SilenceEntry) -> Result<(), DedupError> {
        Err(down())
    }

    async fn check_and_set(&self, _: &SilenceEntry, _: DateTime<Utc>) -> Result<bool, DedupError> {
        Err(down())
    }

    async fn release(&self, _: &SilenceEntry) -> Result<(), DedupError> {
        Err(down())
    }

    async fn list(&self) -> Result<Vec<SilenceEntry>, DedupError> {
        Err(down())
    }

    async fn purge_expired(&self, _: DateTime<Utc>) -> Result<usize, DedupError> {
        Err(down())
    }
}

/// Destination that rejects every alert.
#[derive(Default)]
struct Refusing {
    calls: AtomicUsize,
}

#[async_trait]
impl Destination for Refusing {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, _alert: &AlertMessage) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::Status {
            destination: "log".to_string(),
            status: 500,
        })
    }
}

/// Destination that takes `delay` to accept an alert.
struct Slow {
    delay: Duration,
    sent: AtomicUsize,
}

#[async_trait]
impl Destination for Slow {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, _alert: &AlertMessage) -> Result<(), DispatchError> {
        tokio::time::sleep(self.delay).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    scheduler: Scheduler,
    gateway: Arc<ScriptedGateway>,
    dedup: Arc<CountingDedup>,
    capture: Arc<Capture>,
    status: Arc<StatusRegistry>,
}

fn settings() -> SchedulerConfig {
    SchedulerConfig {
        jitter_ms: 0,
        ..SchedulerConfig::default()
    }
}

/// A scheduler over arbitrary doubles, with one-shot delivery.
fn build_scheduler(
    gateway: Arc<dyn SearchGateway>,
    dedup: Arc<dyn DedupStore>,
    destination: Arc<dyn Destination>,
    settings: SchedulerConfig,
) -> (Scheduler, Arc<StatusRegistry>) {
    let mut dispatcher = AlertDispatcher::new(1, Duration::ZERO);
    dispatcher.register(destination);

    let services = Arc::new(SharedServices::new(Services {
        gateway,
        dedup,
        dispatcher: Arc::new(dispatcher),
        settings,
    }));
    let status = Arc::new(StatusRegistry::new(30));
    let clock = Arc::new(TokioClock::starting_at(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    (Scheduler::new(services, status.clone(), clock), status)
}

fn harness(gateway: ScriptedGateway) -> Harness {
    let gateway = Arc::new(gateway);
    let dedup = Arc::new(CountingDedup::default());
    let capture = Arc::new(Capture {
        sent: Mutex::new(Vec::new()),
    });
    let (scheduler, status) =
        build_scheduler(gateway.clone(), dedup.clone(), capture.clone(), settings());

    Harness {
        scheduler,
        gateway,
        dedup,
        capture,
        status,
    }
}

fn rule(name: &str, kind: RuleKind, run_every: Duration) -> RuleDefinition {
    RuleDefinition {
        name: name.to_string(),
        index: name.to_string(),
        timestamp_field: "@timestamp".to_string(),
        query: json!({ "match_all": {} }),
        kind,
        run_every,
        buffer_time: Duration::ZERO,
        realert: Duration::ZERO,
        destinations: vec!["log".to_string()],
        include: Vec::new(),
        alert_subject: None,
        alert_text: None,
        max_hits: 500,
        use_count_query: false,
        source: PathBuf::from(format!("{name}.toml")),
    }
}

fn records(prefix: &str, n: usize) -> SearchResult {
    SearchResult {
        records: (0..n)
            .map(|i| Record {
                id: format!("{prefix}-{i}"),
                index: prefix.to_string(),
                timestamp: None,
                source: json!({ "n": i }),
            })
            .collect(),
        total: n as u64,
    }
}

fn count(total: u64) -> SearchResult {
    SearchResult {
        records: Vec::new(),
        total,
    }
}

const MINUTE: Duration = Duration::from_secs(60);

async fn advance(d: Duration) {
    tokio::time::sleep(d).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_slow_queries_never_overlap_within_a_rule() {
    let mut h = harness(ScriptedGateway::with_latency(Duration::from_millis(3_500)));
    let kind = |n| RuleKind::Frequency {
        num_events: n,
        timeframe: MINUTE,
    };
    let set: RuleSet = [
        rule("fast", kind(1_000), Duration::from_secs(1)),
        rule("other", kind(1_000), Duration::from_secs(1)),
    ]
    .into_iter()
    .collect();
    h.scheduler.start(&set);

    advance(Duration::from_secs(30)).await;

    assert!(h.gateway.calls.load(Ordering::SeqCst) >= 10);
    assert_eq!(h.gateway.max_in_flight("fast"), 1);
    assert_eq!(h.gateway.max_in_flight("other"), 1);
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_repeat_match_suppressed_within_cooldown_only() {
    let mut h = harness(ScriptedGateway::default());
    h.gateway.always("errors", records("err", 1));
    let mut r = rule(
        "errors",
        RuleKind::Frequency {
            num_events: 1,
            timeframe: MINUTE,
        },
        MINUTE,
    );
    r.realert = 5 * MINUTE;
    h.scheduler.start(&[r].into_iter().collect());

    // Ticks at 1..=6 minutes. The first claims a silence until minute 6.
    advance(6 * MINUTE + Duration::from_secs(30)).await;

    let s = h.status.get("errors").unwrap();
    assert_eq!(s.runs_total, 6);
    assert_eq!(s.matches_total, 6);
    assert_eq!(s.alerts_sent_total, 2);
    assert_eq!(s.suppressed_total, 4);
    assert_eq!(h.capture.sent().len(), 2);
    assert_eq!(h.dedup.writes.load(Ordering::SeqCst), 2);
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_keeps_state_of_untouched_rule() {
    let mut h = harness(ScriptedGateway::default());
    h.gateway.always("orders", records("ord", 1));
    let orders = rule(
        "orders",
        RuleKind::Frequency {
            num_events: 3,
            timeframe: 10 * MINUTE,
        },
        MINUTE,
    );
    let quiet = rule("quiet", RuleKind::Flatline { timeframe: 30 * MINUTE }, MINUTE);

    h.scheduler.start(&[orders.clone()].into_iter().collect());
    advance(2 * MINUTE + Duration::from_secs(30)).await;
    assert_eq!(h.status.get("orders").unwrap().matches_total, 0);

    let summary = h
        .scheduler
        .reload(&[orders.clone(), quiet.clone()].into_iter().collect());
    assert_eq!(summary.added, vec!["quiet".to_string()]);
    assert_eq!(summary.unchanged, 1);

    // Third document arrives; the two counted before the reload still count.
    advance(MINUTE).await;
    let s = h.status.get("orders").unwrap();
    assert_eq!(s.runs_total, 3);
    assert_eq!(s.matches_total, 1);
    assert_eq!(h.capture.sent()[0].matched_ids.len(), 3);

    let summary = h.scheduler.reload(&[orders].into_iter().collect());
    assert_eq!(summary.removed, vec!["quiet".to_string()]);
    assert!(h.status.get("quiet").is_none());
    assert_eq!(h.scheduler.scheduled(), vec!["orders".to_string()]);
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_rule_does_not_block_valid_ones() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(
            dir.path().join(format!("{name}.toml")),
            format!(
                "name = \"{name}\"\nindex = \"logs-*\"\nrun_every = {{ minutes = 1 }}\n\
                 [kind]\ntype = \"flatline\"\ntimeframe = {{ minutes = 10 }}\n"
            ),
        )
        .unwrap();
    }
    std::fs::write(
        dir.path().join("bad.toml"),
        "name = \"bad\"\nindex = \"logs-*\"\nrun_every = { minutes = 1 }\n\
         [kind]\ntype = \"spike\"\n",
    )
    .unwrap();

    let catalog = DestinationCatalog {
        known: ["log".to_string()].into_iter().collect(),
        defaults: vec!["log".to_string()],
    };
    let outcome = loader::load(&[dir.path().to_path_buf()], &catalog);
    assert_eq!(outcome.errors.len(), 1);

    let mut h = harness(ScriptedGateway::default());
    h.scheduler.start(&outcome.rules);
    assert_eq!(h.scheduler.scheduled().len(), 3);

    advance(MINUTE + Duration::from_secs(1)).await;
    for s in h.status.snapshot() {
        assert_eq!(s.runs_total, 1, "rule {} did not run", s.rule);
    }
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_in_flight_cycles_without_side_effects() {
    let mut h = harness(ScriptedGateway::with_latency(Duration::from_secs(10)));
    let mut rules = Vec::new();
    for name in ["r1", "r2", "r3"] {
        h.gateway.always(name, records(name, 5));
        let mut r = rule(
            name,
            RuleKind::Frequency {
                num_events: 1,
                timeframe: MINUTE,
            },
            MINUTE,
        );
        r.realert = 10 * MINUTE;
        rules.push(r);
    }
    h.scheduler.start(&rules.into_iter().collect());

    advance(MINUTE + Duration::from_secs(1)).await;
    assert_eq!(h.gateway.in_flight(), 3);

    let summary = h.scheduler.stop(Duration::from_secs(5)).await;
    assert_eq!(summary.drained, 3);
    assert_eq!(summary.aborted, 0);
    assert_eq!(h.gateway.in_flight(), 0);
    assert_eq!(h.dedup.writes.load(Ordering::SeqCst), 0);
    assert!(h.capture.sent().is_empty());
    assert!(h.status.snapshot().is_empty());
    assert!(!h.scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_flatline_fires_once_on_second_tick() {
    let mut h = harness(ScriptedGateway::default());
    let r = rule("ingest", RuleKind::Flatline { timeframe: 10 * MINUTE }, 5 * MINUTE);
    h.scheduler.start(&[r].into_iter().collect());

    advance(5 * MINUTE + Duration::from_secs(30)).await;
    assert_eq!(h.status.get("ingest").unwrap().matches_total, 0);

    advance(5 * MINUTE).await;
    assert_eq!(h.status.get("ingest").unwrap().matches_total, 1);

    advance(5 * MINUTE).await;
    let s = h.status.get("ingest").unwrap();
    assert_eq!(s.runs_total, 3);
    assert_eq!(s.matches_total, 1);
    assert_eq!(h.capture.sent().len(), 1);
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_frequency_match_caps_identifiers() {
    let mut h = harness(ScriptedGateway::default());
    h.gateway.script("few", vec![records("few", 7)]);
    h.gateway.script("many", vec![records("many", 45)]);
    let kind = RuleKind::Frequency {
        num_events: 5,
        timeframe: 10 * MINUTE,
    };
    let set: RuleSet = [
        rule("few", kind.clone(), 5 * MINUTE),
        rule("many", kind, 5 * MINUTE),
    ]
    .into_iter()
    .collect();
    h.scheduler.start(&set);

    advance(5 * MINUTE + Duration::from_secs(1)).await;

    let sent = h.capture.sent();
    assert_eq!(sent.len(), 2);
    let few = sent.iter().find(|m| m.rule == "few").unwrap();
    assert_eq!(few.match_count, 7);
    assert_eq!(few.matched_ids.len(), 7);
    let many = sent.iter().find(|m| m.rule == "many").unwrap();
    assert_eq!(many.match_count, 45);
    assert_eq!(many.matched_ids.len(), 30);
    assert_eq!(h.status.get("many").unwrap().matched_ids.len(), 30);
    h.scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_spike_fires_above_multiplier_only() {
    let mut h = harness(ScriptedGateway::default());
    h.gateway.script("surge", vec![count(10), count(35)]);
    h.gateway.script("bump", vec![count(10), count(25)]);
    let kind = RuleKind::Spike {
        spike_height: 3.0,
        direction: SpikeDirection::Up,
        threshold_ref: None,
        threshold_cur: None,
    };
    let set: RuleSet = [
        rule("surge", kind.clone(), 5 * MINUTE),
        rule("bump", kind, 5 * MINUTE),
    ]
    .into_iter()
    .collect();
    h.scheduler.start(&set);

    advance(10 * MINUTE + Duration::from_secs(1)).await;

    assert_eq!(h.status.get("surge").unwrap().matches_total, 1);
    assert_eq!(h.status.get("bump").unwrap().matches_total, 0);
    let sent = h.capture.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].details["direction"], "up");
    h.scheduler.stop(Duration::from_secs(5)).await;
}

fn every_minute(name: &str, realert: Duration) -> RuleDefinition {
    let mut r = rule(
        name,
        RuleKind::Frequency {
            num_events: 1,
            timeframe: MINUTE,
        },
        MINUTE,
    );
    r.realert = realert;
    r
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_dispatch_releases_claimed_silence() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.always("slow", records("slow", 1));
    let dedup = Arc::new(CountingDedup::default());
    let slow = Arc::new(Slow {
        delay: Duration::from_secs(60),
        sent: AtomicUsize::new(0),
    });
    let (mut scheduler, _status) =
        build_scheduler(gateway, dedup.clone(), slow.clone(), settings());
    scheduler.start(&[every_minute("slow", 10 * MINUTE)].into_iter().collect());

    // The first tick claims a silence and is now stuck in delivery.
    advance(MINUTE + Duration::from_secs(1)).await;
    assert_eq!(dedup.writes.load(Ordering::SeqCst), 1);

    let summary = scheduler.stop(Duration::from_secs(5)).await;
    assert_eq!(summary.aborted, 0);
    assert_eq!(summary.drained, 1);
    assert!(dedup.list().await.unwrap().is_empty());
    assert_eq!(slow.sent.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_query_retries_same_window() {
    let gateway = Arc::new(FlakyGateway::new(3, records("retry", 1)));
    let capture = Arc::new(Capture {
        sent: Mutex::new(Vec::new()),
    });
    let (mut scheduler, status) = build_scheduler(
        gateway.clone(),
        Arc::new(CountingDedup::default()),
        capture.clone(),
        settings(),
    );
    scheduler.start(&[every_minute("retry", Duration::ZERO)].into_iter().collect());

    // Three attempts fail on the first tick.
    advance(MINUTE + Duration::from_secs(5)).await;
    let s = status.get("retry").unwrap();
    assert_eq!(s.last_outcome, Some(CycleOutcome::Error));
    assert_eq!(s.errors_total, 1);
    assert!(s.last_window_end.is_none());
    assert!(capture.sent().is_empty());

    advance(MINUTE).await;
    let windows = gateway.windows();
    assert_eq!(windows.len(), 4);
    let start = "2024-01-01T00:00:00.000Z";
    assert!(windows.iter().all(|(gt, _)| gt == start));
    assert_eq!(windows[3].1, "2024-01-01T00:02:00.000Z");

    let s = status.get("retry").unwrap();
    assert_eq!(s.matches_total, 1);
    assert_eq!(
        s.last_window_end,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap())
    );
    assert_eq!(capture.sent().len(), 1);
    scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_dedup_outage_still_dispatches() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.always("noisy", records("noisy", 1));
    let capture = Arc::new(Capture {
        sent: Mutex::new(Vec::new()),
    });
    let (mut scheduler, status) =
        build_scheduler(gateway, Arc::new(DownDedup), capture.clone(), settings());
    scheduler.start(&[every_minute("noisy", 10 * MINUTE)].into_iter().collect());

    advance(MINUTE + Duration::from_secs(1)).await;
    let s = status.get("noisy").unwrap();
    assert_eq!(s.alerts_sent_total, 1);
    assert_eq!(s.errors_total, 1);
    assert!(s.last_error.unwrap().contains("dedup store unavailable"));

    // Without a silence the next match goes out too.
    advance(MINUTE).await;
    assert_eq!(capture.sent().len(), 2);
    assert_eq!(status.get("noisy").unwrap().suppressed_total, 0);
    scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_dispatch_releases_silence_for_next_tick() {
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.always("paging", records("paging", 1));
    let dedup = Arc::new(CountingDedup::default());
    let refusing = Arc::new(Refusing::default());
    let (mut scheduler, status) =
        build_scheduler(gateway, dedup.clone(), refusing.clone(), settings());
    scheduler.start(&[every_minute("paging", 10 * MINUTE)].into_iter().collect());

    advance(2 * MINUTE + Duration::from_secs(1)).await;
    assert_eq!(refusing.calls.load(Ordering::SeqCst), 2);
    assert_eq!(dedup.writes.load(Ordering::SeqCst), 2);
    assert!(dedup.list().await.unwrap().is_empty());

    let s = status.get("paging").unwrap();
    assert_eq!(s.alerts_sent_total, 0);
    assert_eq!(s.suppressed_total, 0);
    assert_eq!(s.errors_total, 2);
    assert_eq!(s.last_outcome, Some(CycleOutcome::Error));
    scheduler.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_oversized_catch_up_does_not_kill_slot() {
    let gateway = Arc::new(ScriptedGateway::default());
    let (mut scheduler, status) = build_scheduler(
        gateway.clone(),
        Arc::new(CountingDedup::default()),
        Arc::new(Capture {
            sent: Mutex::new(Vec::new()),
        }),
        SchedulerConfig {
            max_catch_up_secs: u64::MAX,
            ..settings()
        },
    );
    let r = rule("ingest", RuleKind::Flatline { timeframe: 10 * MINUTE }, MINUTE);
    scheduler.start(&[r].into_iter().collect());

    advance(3 * MINUTE + Duration::from_secs(1)).await;
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    assert_eq!(status.get("ingest").unwrap().runs_total, 3);
    scheduler.stop(Duration::from_secs(5)).await;
}
