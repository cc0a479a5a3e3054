//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS silences (
            fingerprint TEXT PRIMARY KEY,
            rule_name TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at_ms INTEGER NOT NULL,
            renewed_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_silences_expires ON silences(expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_silences_rule ON silences(rule_name);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}
