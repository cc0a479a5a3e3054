//! Process-local dedup store. Silences do not survive a restart and are not
//! visible to other replicas.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DedupStore, SilenceEntry};
use crate::error::DedupError;

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, SilenceEntry>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<SilenceEntry>, DedupError> {
        Ok(self.entries.lock().await.get(fingerprint).cloned())
    }

    async fn set(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        self.entries
            .lock()
            .await
            .insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    async fn check_and_set(
        &self,
        entry: &SilenceEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, DedupError> {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&entry.fingerprint)
            .is_some_and(|existing| existing.is_live(now))
        {
            return Ok(false);
        }
        entries.insert(entry.fingerprint.clone(), entry.clone());
        Ok(true)
    }

    async fn release(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        let mut entries = self.entries.lock().await;
        if entries.get(&entry.fingerprint) == Some(entry) {
            entries.remove(&entry.fingerprint);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SilenceEntry>, DedupError> {
        let mut all: Vec<SilenceEntry> = self.entries.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(all)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DedupError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}
