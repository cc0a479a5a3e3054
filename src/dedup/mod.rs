//! Shared dedup cache: "fingerprint F is silenced until T".
//!
//! The store is the only state shared across rule tasks. Callers never lock
//! around it; [`DedupStore::check_and_set`] is the single atomic operation
//! used on the dispatch path.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DedupError;

pub use self::memory::MemoryDedupStore;
pub use self::sqlite::SqliteDedupStore;

/// One silence: alerts for `fingerprint` must not be re-sent before `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SilenceEntry {
    pub fingerprint: String,
    pub rule_name: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SilenceEntry {
    /// Live entries suppress dispatch at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// The stored entry for `fingerprint`, expired or not.
    async fn get(&self, fingerprint: &str) -> Result<Option<SilenceEntry>, DedupError>;

    /// Unconditionally write `entry`.
    async fn set(&self, entry: &SilenceEntry) -> Result<(), DedupError>;

    /// Write `entry` unless a live silence exists at `now`.
    ///
    /// Returns `true` when the entry was written (the caller owns the alert),
    /// `false` when an existing silence suppresses it.
    async fn check_and_set(&self, entry: &SilenceEntry, now: DateTime<Utc>)
        -> Result<bool, DedupError>;

    /// Remove `entry` if it is still the one stored.
    async fn release(&self, entry: &SilenceEntry) -> Result<(), DedupError>;

    /// Every stored entry, ordered by expiry.
    async fn list(&self) -> Result<Vec<SilenceEntry>, DedupError>;

    /// Drop entries that are no longer live at `now`; returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DedupError>;
}
