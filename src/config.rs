//! TOML application configuration for the alerting daemon.
//!
//! Every section carries `#[serde(default)]` so a partial file (or no file at
//! all) yields a runnable configuration. Rule definitions live in their own
//! files and are loaded by [`crate::rules::loader`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ELASTIC_ALERT_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/elastic-alert/config.toml";

/// Matched document ids are surfaced as a telemetry label. A search document
/// id is at most 512 bytes, so 30 of them stay under a 16 KiB label budget.
pub const DEFAULT_MAX_MATCHED_IDS: usize = 30;

/// Largest accepted `scheduler.max_catch_up_secs` (30 days).
pub const MAX_CATCH_UP_SECS: u64 = 30 * 24 * 3_600;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded application configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration source, in order:
    /// 1. An explicit path (from the command line).
    /// 2. The path in the `ELASTIC_ALERT_CONFIG` environment variable.
    /// 3. `/etc/elastic-alert/config.toml`.
    /// 4. Compiled-in defaults.
    ///
    /// An explicit path that fails to load is an error; the fallbacks only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok((cfg, Some(path))),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ELASTIC_ALERT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok((cfg, Some(system_path.to_path_buf()))),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok((Self::default(), None))
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.search.addresses.is_empty() {
            bail!("search.addresses must list at least one address");
        }
        if self.scheduler.max_matched_ids == 0 {
            bail!("scheduler.max_matched_ids must be greater than zero");
        }
        if !(1..=MAX_CATCH_UP_SECS).contains(&self.scheduler.max_catch_up_secs) {
            bail!("scheduler.max_catch_up_secs must be in 1..={MAX_CATCH_UP_SECS}");
        }
        if self.scheduler.max_query_attempts == 0 {
            bail!("scheduler.max_query_attempts must be greater than zero");
        }
        if self.alert.max_attempts == 0 {
            bail!("alert.max_attempts must be greater than zero");
        }
        if self.leader_election.enabled {
            let le = &self.leader_election;
            if le.renew_deadline_secs >= le.lease_duration_secs {
                bail!("leader_election.renew_deadline_secs must be less than lease_duration_secs");
            }
            if le.retry_period_secs == 0 || le.retry_period_secs >= le.renew_deadline_secs {
                bail!("leader_election.retry_period_secs must be in 1..renew_deadline_secs");
            }
        }
        let mut seen = std::collections::HashSet::new();
        for dest in &self.alert.destinations {
            if !seen.insert(dest.name.as_str()) {
                bail!("alert destination '{}' is defined more than once", dest.name);
            }
            let url = match &dest.kind {
                DestinationKind::Webhook { url, .. }
                | DestinationKind::Alertmanager { url, .. } => url,
                DestinationKind::Log => continue,
            };
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("alert destination '{}' has a non-http url", dest.name);
            }
        }
        Ok(())
    }

    /// Names of every destination a rule may reference.
    pub fn destination_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.alert.destinations.iter().map(|d| d.name.clone()).collect();
        if !names.iter().any(|n| n == LOG_DESTINATION) {
            names.push(LOG_DESTINATION.to_string());
        }
        names
    }
}

// ---------------------------------------------------------------------------
// Server / exporter
// ---------------------------------------------------------------------------

/// Admin HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9099".to_string(),
        }
    }
}

/// Prometheus text exposition of rule status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub enabled: bool,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Leader election
// ---------------------------------------------------------------------------

/// Lease-based leader election between replicas sharing one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    /// Replica identity; falls back to `HOSTNAME`, then a random id.
    pub identity: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
    /// Pause after losing leadership before contending again.
    pub rejoin_delay_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: "elastic-alert".to_string(),
            identity: None,
            lease_duration_secs: 60,
            renew_deadline_secs: 15,
            retry_period_secs: 5,
            rejoin_delay_secs: 180,
        }
    }
}

impl LeaderElectionConfig {
    pub fn resolve_identity(&self) -> String {
        if let Some(id) = self.identity.as_ref().filter(|s| !s.is_empty()) {
            return id.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => host,
            _ => format!("elastic-alert-{}", uuid::Uuid::new_v4()),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage / search / dedup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database shared by replicas (silences, leases).
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/elastic-alert.db"),
        }
    }
}

/// Search backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub addresses: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
    /// Fail startup when no address answers.
    pub verify_on_start: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["http://localhost:9200".to_string()],
            username: None,
            password: None,
            timeout_secs: 30,
            accept_invalid_certs: false,
            verify_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupBackend {
    /// Shared SQLite table, visible to every replica on the same volume.
    Sqlite,
    /// Process-local map; silences are lost on failover.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub backend: DedupBackend,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            backend: DedupBackend::Sqlite,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound of the random delay added to each rule's first tick.
    pub jitter_ms: u64,
    pub max_query_attempts: u32,
    pub query_backoff_ms: u64,
    pub max_query_backoff_ms: u64,
    /// How long `stop` waits for in-flight cycles before aborting them.
    pub drain_timeout_secs: u64,
    /// Oldest window start a single query may reach back to.
    pub max_catch_up_secs: u64,
    pub max_matched_ids: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_ms: 2_000,
            max_query_attempts: 3,
            query_backoff_ms: 500,
            max_query_backoff_ms: 10_000,
            drain_timeout_secs: 30,
            max_catch_up_secs: 3_600,
            max_matched_ids: DEFAULT_MAX_MATCHED_IDS,
        }
    }
}

impl SchedulerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn max_catch_up(&self) -> Duration {
        Duration::from_secs(self.max_catch_up_secs)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn query_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .query_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_query_backoff_ms);
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Alert destinations
// ---------------------------------------------------------------------------

/// Name of the built-in destination that writes alerts to the log.
pub const LOG_DESTINATION: &str = "log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Used by rules that do not name any destination.
    pub default_destinations: Vec<String>,
    pub destinations: Vec<DestinationConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            default_destinations: vec![LOG_DESTINATION.to_string()],
            destinations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationKind {
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
    Alertmanager {
        /// Base URL; alerts go to `<url>/api/v2/alerts`.
        url: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default = "default_resolve_timeout")]
        resolve_timeout_secs: u64,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
    Log,
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_resolve_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Rules / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule files, or directories scanned for `*.toml`.
    pub paths: Vec<PathBuf>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("rules")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
