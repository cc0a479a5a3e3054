//! Lease-based leader election over the shared SQLite database.
//!
//! One row per lease name. A candidate claims or renews it with a single
//! conditional upsert that only succeeds when it already holds the lease or
//! the current lease has expired.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LeaderElector, LeadershipEvent};
use crate::config::LeaderElectionConfig;
use crate::scheduler::clock::Clock;
use crate::storage::{to_millis, Pool};

pub struct LeaseElector {
    pool: Pool,
    name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    rejoin_delay: Duration,
    clock: Arc<dyn Clock>,
}

/// Sleep for `d` unless `shutdown` fires first. Returns `false` on shutdown.
async fn pause(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

impl LeaseElector {
    pub fn new(pool: Pool, config: &LeaderElectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            name: config.lease_name.clone(),
            identity: config.resolve_identity(),
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs),
            rejoin_delay: Duration::from_secs(config.rejoin_delay_secs),
            clock,
        }
    }

    /// Override the identity (tests run several candidates in one process).
    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }

    /// Claim or renew the lease. Returns the holder after the attempt.
    pub async fn try_acquire(&self) -> anyhow::Result<String> {
        let pool = self.pool.clone();
        let name = self.name.clone();
        let identity = self.identity.clone();
        let now = self.clock.now();
        let expires = now
            + chrono::Duration::from_std(self.lease_duration).unwrap_or(chrono::Duration::zero());

        tokio::task::spawn_blocking(move || acquire_blocking(&pool, &name, &identity, now, expires))
            .await?
    }

    /// Give the lease up if this process holds it.
    pub async fn release(&self) -> anyhow::Result<()> {
        let pool = self.pool.clone();
        let name = self.name.clone();
        let identity = self.identity.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            conn.execute(
                "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
                params![name, identity],
            )?;
            Ok(())
        })
        .await?
    }

    /// Contend until leadership is acquired. `false` on shutdown.
    async fn acquire(
        &self,
        events: &mpsc::Sender<LeadershipEvent>,
        shutdown: &CancellationToken,
    ) -> bool {
        let mut observed: Option<String> = None;
        loop {
            match self.try_acquire().await {
                Ok(holder) if holder == self.identity => return true,
                Ok(holder) => {
                    if observed.as_deref() != Some(holder.as_str()) {
                        debug!(lease = %self.name, holder = %holder, "lease held elsewhere");
                        observed = Some(holder.clone());
                        if events.send(LeadershipEvent::Observed(holder)).await.is_err() {
                            return false;
                        }
                    }
                }
                Err(e) => warn!(lease = %self.name, error = %e, "lease acquisition attempt failed"),
            }
            if !pause(self.retry_period, shutdown).await {
                return false;
            }
        }
    }

    /// Renew until leadership is lost. `false` on shutdown.
    async fn hold(&self, shutdown: &CancellationToken) -> bool {
        let mut last_renewed = Instant::now();
        loop {
            if !pause(self.retry_period, shutdown).await {
                return false;
            }
            match self.try_acquire().await {
                Ok(holder) if holder == self.identity => last_renewed = Instant::now(),
                Ok(holder) => {
                    warn!(lease = %self.name, holder = %holder, "lease taken over");
                    return true;
                }
                Err(e) => {
                    warn!(lease = %self.name, error = %e, "lease renewal failed");
                    if last_renewed.elapsed() >= self.renew_deadline {
                        warn!(lease = %self.name, "renew deadline exceeded");
                        return true;
                    }
                }
            }
        }
    }
}

fn acquire_blocking(
    pool: &Pool,
    name: &str,
    identity: &str,
    now: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> anyhow::Result<String> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO leases (name, holder, acquired_at_ms, renewed_at_ms, expires_at_ms)
         VALUES (?1, ?2, ?3, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            acquired_at_ms = CASE WHEN leases.holder = excluded.holder
                                  THEN leases.acquired_at_ms
                                  ELSE excluded.acquired_at_ms END,
            holder = excluded.holder,
            renewed_at_ms = excluded.renewed_at_ms,
            expires_at_ms = excluded.expires_at_ms
         WHERE leases.holder = excluded.holder OR leases.expires_at_ms <= ?3",
        params![name, identity, to_millis(now), to_millis(expires)],
    )?;
    let holder: String = conn.query_row(
        "SELECT holder FROM leases WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(holder)
}

#[async_trait]
impl LeaderElector for LeaseElector {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn run(&self, events: mpsc::Sender<LeadershipEvent>, shutdown: CancellationToken) {
        info!(lease = %self.name, identity = %self.identity, "joining leader election");
        loop {
            if !self.acquire(&events, &shutdown).await {
                break;
            }
            info!(lease = %self.name, identity = %self.identity, "acquired leadership");
            if events.send(LeadershipEvent::Acquired).await.is_err() {
                break;
            }

            if !self.hold(&shutdown).await {
                if let Err(e) = self.release().await {
                    warn!(lease = %self.name, error = %e, "failed to release lease on shutdown");
                }
                break;
            }

            info!(
                lease = %self.name,
                rejoin_in_secs = self.rejoin_delay.as_secs(),
                "lost leadership"
            );
            if events.send(LeadershipEvent::Lost).await.is_err() {
                break;
            }
            if !pause(self.rejoin_delay, &shutdown).await {
                break;
            }
        }
        debug!(lease = %self.name, "left leader election");
    }
}
