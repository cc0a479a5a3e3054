//! Leadership signal.
//!
//! An elector runs in the background and reports transitions as
//! [`LeadershipEvent`]s. The lifecycle controller is the only consumer; the
//! scheduler itself never polls leadership.

pub mod lease;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::lease::LeaseElector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This process became leader.
    Acquired,
    /// This process stopped being leader.
    Lost,
    /// Another process holds leadership.
    Observed(String),
}

/// Leadership as seen by this process, published to the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderState {
    pub identity: String,
    pub is_leader: bool,
    /// Last known holder, which is `identity` while leading.
    pub holder: Option<String>,
}

impl LeaderState {
    pub fn follower(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            is_leader: false,
            holder: None,
        }
    }
}

#[async_trait]
pub trait LeaderElector: Send + Sync {
    fn identity(&self) -> &str;

    /// Contend for leadership until `shutdown`, reporting on `events`.
    async fn run(&self, events: mpsc::Sender<LeadershipEvent>, shutdown: CancellationToken);
}

/// Always the leader; used when leader election is disabled.
pub struct StandaloneElector {
    identity: String,
}

impl StandaloneElector {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
        }
    }
}

#[async_trait]
impl LeaderElector for StandaloneElector {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn run(&self, events: mpsc::Sender<LeadershipEvent>, shutdown: CancellationToken) {
        info!(identity = %self.identity, "leader election disabled, running as leader");
        if events.send(LeadershipEvent::Acquired).await.is_err() {
            return;
        }
        shutdown.cancelled().await;
    }
}
