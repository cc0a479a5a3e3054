//! Dedup store backed by the shared SQLite database.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{DedupStore, SilenceEntry};
use crate::error::DedupError;
use crate::storage::{to_millis, Pool};

#[derive(Clone)]
pub struct SqliteDedupStore {
    pool: Pool,
}

impl SqliteDedupStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Run `f` on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DedupError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, DedupError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| DedupError::Unavailable(e.to_string()))?
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SilenceEntry> {
    Ok(SilenceEntry {
        fingerprint: row.get(0)?,
        rule_name: row.get(1)?,
        expires_at: from_millis(row.get(2)?),
        created_at: from_millis(row.get(3)?),
    })
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<SilenceEntry>, DedupError> {
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT fingerprint, rule_name, expires_at_ms, created_at_ms
                     FROM silences WHERE fingerprint = ?1",
                    params![fingerprint],
                    entry_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn set(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO silences (fingerprint, rule_name, expires_at_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    rule_name = excluded.rule_name,
                    expires_at_ms = excluded.expires_at_ms,
                    created_at_ms = excluded.created_at_ms",
                params![
                    entry.fingerprint,
                    entry.rule_name,
                    to_millis(entry.expires_at),
                    to_millis(entry.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn check_and_set(
        &self,
        entry: &SilenceEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, DedupError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            // The conflict update only applies over an expired silence, so a
            // changed row means this caller now owns the fingerprint.
            let changed = conn.execute(
                "INSERT INTO silences (fingerprint, rule_name, expires_at_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    rule_name = excluded.rule_name,
                    expires_at_ms = excluded.expires_at_ms,
                    created_at_ms = excluded.created_at_ms
                 WHERE silences.expires_at_ms <= ?5",
                params![
                    entry.fingerprint,
                    entry.rule_name,
                    to_millis(entry.expires_at),
                    to_millis(entry.created_at),
                    to_millis(now)
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, entry: &SilenceEntry) -> Result<(), DedupError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM silences
                 WHERE fingerprint = ?1 AND expires_at_ms = ?2 AND created_at_ms = ?3",
                params![
                    entry.fingerprint,
                    to_millis(entry.expires_at),
                    to_millis(entry.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<SilenceEntry>, DedupError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fingerprint, rule_name, expires_at_ms, created_at_ms
                 FROM silences ORDER BY expires_at_ms ASC",
            )?;
            let rows = stmt.query_map([], entry_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DedupError> {
        let now_ms = to_millis(now);
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM silences WHERE expires_at_ms <= ?1",
                params![now_ms],
            )?)
        })
        .await
    }
}
