//! Rule scheduler: one independent periodic task ("slot") per rule.
//!
//! A slot owns its rule's evaluation state and runs cycles strictly one at a
//! time. The scheduler only creates, updates and tears down slots; it never
//! touches evaluation state itself.

pub mod clock;
mod engine;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::clock::Clock;
use self::engine::{run_slot, SlotContext};
use crate::config::SchedulerConfig;
use crate::dedup::DedupStore;
use crate::dispatch::AlertDispatcher;
use crate::rules::{RuleDefinition, RuleSet};
use crate::search::SearchGateway;
use crate::status::StatusRegistry;

pub use self::clock::{SystemClock, TokioClock};

/// External collaborators used by every cycle, plus the tuning knobs.
pub struct Services {
    pub gateway: Arc<dyn SearchGateway>,
    pub dedup: Arc<dyn DedupStore>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub settings: SchedulerConfig,
}

/// Replaceable [`Services`]. Each cycle reads the current value once at its
/// start, so a swap never changes collaborators mid-cycle.
pub struct SharedServices {
    inner: RwLock<Arc<Services>>,
}

impl SharedServices {
    pub fn new(services: Services) -> Self {
        Self {
            inner: RwLock::new(Arc::new(services)),
        }
    }

    pub fn current(&self) -> Arc<Services> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, services: Services) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(services);
    }
}

struct Slot {
    rule: Arc<RuleDefinition>,
    rule_tx: watch::Sender<Arc<RuleDefinition>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What a reload changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
}

/// How a stop ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StopSummary {
    pub drained: usize,
    pub aborted: usize,
}

pub struct Scheduler {
    services: Arc<SharedServices>,
    status: Arc<StatusRegistry>,
    clock: Arc<dyn Clock>,
    root: CancellationToken,
    slots: HashMap<String, Slot>,
    /// Slots of removed rules that may still be finishing a commit.
    retired: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(
        services: Arc<SharedServices>,
        status: Arc<StatusRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            services,
            status,
            clock,
            root: CancellationToken::new(),
            slots: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Names of the rules with a live slot, sorted.
    pub fn scheduled(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schedule every rule in `rules` with fresh state.
    pub fn start(&mut self, rules: &RuleSet) {
        for rule in rules.iter() {
            if !self.slots.contains_key(&rule.name) {
                self.spawn_slot(rule.clone());
            }
        }
        info!(rules = self.slots.len(), "scheduler started");
    }

    /// Apply a new rule generation to the running slots.
    ///
    /// Rules present in both generations keep their slot, timer and state.
    pub fn reload(&mut self, rules: &RuleSet) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        let gone: Vec<String> = self
            .slots
            .keys()
            .filter(|name| !rules.contains(name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(slot) = self.slots.remove(&name) {
                slot.cancel.cancel();
                self.retired.push((name.clone(), slot.handle));
                self.status.remove(&name);
                summary.removed.push(name);
            }
        }
        self.retired.retain(|(_, h)| !h.is_finished());

        for rule in rules.iter() {
            match self.slots.get_mut(&rule.name) {
                Some(slot) if *slot.rule == **rule => summary.unchanged += 1,
                Some(slot) => {
                    slot.rule = rule.clone();
                    // The receiver only goes away when the slot has exited.
                    let _ = slot.rule_tx.send(rule.clone());
                    self.status.register(&rule.name, rule.kind.as_str());
                    summary.updated.push(rule.name.clone());
                }
                None => {
                    self.spawn_slot(rule.clone());
                    summary.added.push(rule.name.clone());
                }
            }
        }

        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            updated = summary.updated.len(),
            unchanged = summary.unchanged,
            "rule set reloaded"
        );
        summary
    }

    /// Cancel every slot and wait up to `drain` for in-flight cycles.
    ///
    /// Slots still running after `drain` are aborted and logged. All
    /// evaluation state and runtime status is discarded.
    pub async fn stop(&mut self, drain: Duration) -> StopSummary {
        self.root.cancel();

        let mut handles: Vec<(String, JoinHandle<()>)> = self
            .slots
            .drain()
            .map(|(name, slot)| (name, slot.handle))
            .chain(self.retired.drain(..))
            .collect();

        let waiting = join_all(handles.iter_mut().map(|(_, h)| h));
        let mut summary = StopSummary::default();
        if tokio::time::timeout(drain, waiting).await.is_ok() {
            summary.drained = handles.len();
        } else {
            for (name, handle) in &handles {
                if handle.is_finished() {
                    summary.drained += 1;
                } else {
                    warn!(rule = %name, "slot did not drain in time, aborting");
                    handle.abort();
                    summary.aborted += 1;
                }
            }
        }

        self.root = CancellationToken::new();
        self.status.clear();
        info!(
            drained = summary.drained,
            aborted = summary.aborted,
            "scheduler stopped"
        );
        summary
    }

    fn spawn_slot(&mut self, rule: Arc<RuleDefinition>) {
        let jitter_ms = self.services.current().settings.jitter_ms;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        let cancel = self.root.child_token();
        let (rule_tx, rule_rx) = watch::channel(rule.clone());
        let ctx = SlotContext {
            services: self.services.clone(),
            status: self.status.clone(),
            clock: self.clock.clone(),
            cancel: cancel.clone(),
        };

        self.status.register(&rule.name, rule.kind.as_str());
        let handle = tokio::spawn(run_slot(ctx, rule_rx, rule.run_every + jitter));
        self.slots.insert(
            rule.name.clone(),
            Slot {
                rule,
                rule_tx,
                cancel,
                handle,
            },
        );
    }
}
