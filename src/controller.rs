//! Lifecycle controller.
//!
//! Owns the configuration, the rule store and the scheduler. Leadership
//! changes, reloads, config swaps and shutdown all arrive as
//! [`ControlMessage`]s in one inbox and are applied one at a time, so a
//! message is never handled while another is half-applied.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::leader::{LeaderState, LeadershipEvent};
use crate::rules::loader;
use crate::rules::store::RuleStore;
use crate::rules::DestinationCatalog;
use crate::scheduler::clock::Clock;
use crate::scheduler::{ReloadSummary, Scheduler, Services, SharedServices};
use crate::status::StatusRegistry;

/// Builds the external collaborators for a configuration.
pub type ServicesBuilder = Box<dyn Fn(&AppConfig) -> Result<Services> + Send + Sync>;

#[derive(Debug)]
pub enum ControlMessage {
    Leadership(LeadershipEvent),
    /// Re-read rule files from the configured paths.
    ReloadRules,
    /// Replace the configuration, then reload rules.
    SetConfig(Box<AppConfig>),
    Shutdown,
}

const INBOX_CAPACITY: usize = 64;

pub struct Controller {
    config: AppConfig,
    builder: ServicesBuilder,
    services: Arc<SharedServices>,
    rules: Arc<RuleStore>,
    status: Arc<StatusRegistry>,
    scheduler: Scheduler,
    identity: String,
    leading: bool,
    inbox: mpsc::Receiver<ControlMessage>,
    leader_tx: watch::Sender<LeaderState>,
}

/// Cloneable front door to a running [`Controller`].
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlMessage>,
    leader_rx: watch::Receiver<LeaderState>,
    rules: Arc<RuleStore>,
    status: Arc<StatusRegistry>,
}

impl Controller {
    /// Build services for `config` and load the first rule generation.
    ///
    /// Fails only when the services cannot be built at all.
    pub fn new(
        config: AppConfig,
        builder: ServicesBuilder,
        clock: Arc<dyn Clock>,
        identity: &str,
    ) -> Result<(Self, ControllerHandle)> {
        let services = Arc::new(SharedServices::new(builder(&config)?));
        let status = Arc::new(StatusRegistry::new(config.scheduler.max_matched_ids));
        let rules = Arc::new(RuleStore::new());
        let scheduler = Scheduler::new(services.clone(), status.clone(), clock);

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (leader_tx, leader_rx) = watch::channel(LeaderState::follower(identity));

        let controller = Self {
            config,
            builder,
            services,
            rules: rules.clone(),
            status: status.clone(),
            scheduler,
            identity: identity.to_string(),
            leading: false,
            inbox,
            leader_tx,
        };
        controller.load_rules();

        let handle = ControllerHandle {
            tx,
            leader_rx,
            rules,
            status,
        };
        Ok((controller, handle))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    /// Names of the rules currently scheduled.
    pub fn scheduled(&self) -> Vec<String> {
        self.scheduler.scheduled()
    }

    /// Process messages until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(identity = %self.identity, "controller running");
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                ControlMessage::Leadership(event) => self.on_leadership(event).await,
                ControlMessage::ReloadRules => {
                    self.reload_rules();
                }
                ControlMessage::SetConfig(config) => self.set_config(*config),
                ControlMessage::Shutdown => break,
            }
        }
        self.stop().await;
        info!("controller stopped");
    }

    /// Schedule the current rule generation. No-op when already running.
    pub fn start(&mut self) {
        if self.leading {
            return;
        }
        self.leading = true;
        self.scheduler.start(&self.rules.current());
    }

    /// Stop the scheduler, draining in-flight cycles. All evaluation state is
    /// discarded.
    pub async fn stop(&mut self) {
        if !self.leading {
            return;
        }
        self.leading = false;
        let drain = self.config.scheduler.drain_timeout();
        let summary = self.scheduler.stop(drain).await;
        if summary.aborted > 0 {
            warn!(aborted = summary.aborted, "cycles abandoned past the drain timeout");
        }
    }

    /// Reload rule files and apply the diff to a running scheduler.
    pub fn reload_rules(&mut self) -> Option<ReloadSummary> {
        self.load_rules();
        if self.leading {
            Some(self.scheduler.reload(&self.rules.current()))
        } else {
            None
        }
    }

    /// Swap in a new configuration. A configuration whose services cannot be
    /// built is rejected and the current one kept.
    pub fn set_config(&mut self, config: AppConfig) {
        match (self.builder)(&config) {
            Ok(services) => {
                self.services.replace(services);
                self.status.set_max_ids(config.scheduler.max_matched_ids);
                self.config = config;
                info!("configuration replaced");
                self.reload_rules();
            }
            Err(e) => error!(error = %e, "new configuration rejected, keeping the current one"),
        }
    }

    fn load_rules(&self) {
        let catalog = DestinationCatalog::from_config(&self.config);
        let outcome = loader::load(&self.config.rules.paths, &catalog);
        self.rules.swap(outcome.rules, outcome.errors);
    }

    async fn on_leadership(&mut self, event: LeadershipEvent) {
        match event {
            LeadershipEvent::Acquired => {
                info!(identity = %self.identity, "leadership acquired, starting scheduler");
                self.start();
                self.publish(true, Some(self.identity.clone()));
            }
            LeadershipEvent::Lost => {
                info!(identity = %self.identity, "leadership lost, stopping scheduler");
                self.stop().await;
                self.publish(false, None);
            }
            LeadershipEvent::Observed(holder) => {
                if self.leading && holder != self.identity {
                    self.stop().await;
                }
                self.publish(self.leading, Some(holder));
            }
        }
    }

    fn publish(&self, is_leader: bool, holder: Option<String>) {
        self.leader_tx.send_replace(LeaderState {
            identity: self.identity.clone(),
            is_leader,
            holder,
        });
    }
}

impl ControllerHandle {
    /// Queue a message. Returns `false` once the controller has exited.
    pub async fn send(&self, msg: ControlMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub async fn reload_rules(&self) -> bool {
        self.send(ControlMessage::ReloadRules).await
    }

    pub async fn set_config(&self, config: AppConfig) -> bool {
        self.send(ControlMessage::SetConfig(Box::new(config))).await
    }

    pub async fn shutdown(&self) -> bool {
        self.send(ControlMessage::Shutdown).await
    }

    pub fn leader_state(&self) -> LeaderState {
        self.leader_rx.borrow().clone()
    }

    /// Subscribe to leadership changes as published by the controller.
    pub fn watch_leader(&self) -> watch::Receiver<LeaderState> {
        self.leader_rx.clone()
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    /// Relay elector events into the controller until either side closes.
    pub async fn forward_leadership(&self, mut events: mpsc::Receiver<LeadershipEvent>) {
        while let Some(event) = events.recv().await {
            if !self.send(ControlMessage::Leadership(event)).await {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::dispatch::AlertDispatcher;
    use crate::error::QueryError;
    use crate::scheduler::TokioClock;
    use crate::search::{SearchGateway, SearchResult};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::path::Path;

    struct Empty;

    #[async_trait]
    impl SearchGateway for Empty {
        async fn search(&self, _: &str, _: &Value) -> Result<SearchResult, QueryError> {
            Ok(SearchResult::default())
        }
        async fn count(&self, _: &str, _: &Value) -> Result<u64, QueryError> {
            Ok(0)
        }
    }

    fn builder() -> ServicesBuilder {
        Box::new(|config: &AppConfig| {
            Ok(Services {
                gateway: Arc::new(Empty),
                dedup: Arc::new(MemoryDedupStore::new()),
                dispatcher: Arc::new(AlertDispatcher::from_config(&config.alert)?),
                settings: SchedulerConfig {
                    jitter_ms: 0,
                    ..config.scheduler.clone()
                },
            })
        })
    }

    fn write_rule(dir: &Path, name: &str) {
        std::fs::write(
            dir.join(format!("{name}.toml")),
            format!(
                "name = \"{name}\"\nindex = \"logs-*\"\nrun_every = {{ minutes = 5 }}\n\
                 [kind]\ntype = \"flatline\"\ntimeframe = {{ minutes = 10 }}\n"
            ),
        )
        .unwrap();
    }

    fn controller(dir: &Path) -> (Controller, ControllerHandle) {
        let mut config = AppConfig::default();
        config.rules.paths = vec![dir.to_path_buf()];
        let clock = Arc::new(TokioClock::starting_at(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        Controller::new(config, builder(), clock, "me").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_rule_excluded_from_schedule() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a");
        write_rule(dir.path(), "b");
        std::fs::write(
            dir.path().join("broken.toml"),
            "name = \"broken\"\nindex = \"x\"\nrun_every = { minutes = 1 }\n\
             [kind]\ntype = \"spike\"\ntimeframe = { minutes = 1 }\n",
        )
        .unwrap();

        let (mut ctl, handle) = controller(dir.path());
        ctl.start();
        assert_eq!(ctl.scheduled(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(handle.rules().errors().len(), 1);
        assert_eq!(handle.status().snapshot().len(), 2);
        ctl.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_only_applies_while_leading() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a");
        let (mut ctl, handle) = controller(dir.path());

        write_rule(dir.path(), "b");
        assert!(ctl.reload_rules().is_none());
        assert_eq!(handle.rules().current().len(), 2);
        assert!(ctl.scheduled().is_empty());

        ctl.start();
        write_rule(dir.path(), "c");
        let summary = ctl.reload_rules().unwrap();
        assert_eq!(summary.added, vec!["c".to_string()]);
        assert_eq!(summary.unchanged, 2);
        ctl.stop().await;
        assert!(ctl.scheduled().is_empty());
        assert!(handle.status().snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_config_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a");
        let (mut ctl, _handle) = controller(dir.path());

        let mut bad = AppConfig::default();
        bad.alert.destinations.push(crate::config::DestinationConfig {
            name: "hook".to_string(),
            kind: crate::config::DestinationKind::Webhook {
                url: "http://127.0.0.1:1".to_string(),
                headers: [("bad header".to_string(), "x".to_string())].into_iter().collect(),
                timeout_secs: 1,
            },
        });
        ctl.set_config(bad);
        assert_eq!(ctl.config().rules.paths, vec![dir.path().to_path_buf()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_config_updates_id_cap() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a");
        let (mut ctl, handle) = controller(dir.path());
        assert_eq!(handle.status().max_ids(), 30);

        let mut next = ctl.config().clone();
        next.scheduler.max_matched_ids = 5;
        ctl.set_config(next);
        assert_eq!(ctl.config().scheduler.max_matched_ids, 5);
        assert_eq!(handle.status().max_ids(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_messages_drive_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "a");
        let (ctl, handle) = controller(dir.path());
        let mut leader = handle.watch_leader();
        let task = tokio::spawn(ctl.run());

        let (tx, rx) = mpsc::channel(4);
        let forwarder = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.forward_leadership(rx).await })
        };

        tx.send(LeadershipEvent::Acquired).await.unwrap();
        leader.changed().await.unwrap();
        assert!(handle.leader_state().is_leader);
        assert_eq!(handle.status().snapshot().len(), 1);

        tx.send(LeadershipEvent::Lost).await.unwrap();
        leader.changed().await.unwrap();
        assert!(!handle.leader_state().is_leader);
        assert!(handle.status().snapshot().is_empty());

        tx.send(LeadershipEvent::Observed("other".to_string())).await.unwrap();
        leader.changed().await.unwrap();
        assert_eq!(handle.leader_state().holder.as_deref(), Some("other"));

        assert!(handle.shutdown().await);
        task.await.unwrap();
        drop(tx);
        forwarder.await.unwrap();
    }
}
