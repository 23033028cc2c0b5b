//! Schema history of the per-user sync state database.
//!
//! Each step runs in its own transaction together with the bump of SQLite's
//! `user_version`, so a crash mid-upgrade leaves the file at the last
//! completed step.

use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use super::DbError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "sync job history",
        sql: r#"
        CREATE TABLE IF NOT EXISTS sync_jobs (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'running', 'done', 'failed')),
            started_at TEXT NOT NULL,
            finished_at TEXT,
            new_messages INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_jobs_account ON sync_jobs(account_id, started_at);
        "#,
    },
    Step {
        version: 2,
        name: "downloaded remote items",
        sql: r#"
        CREATE TABLE IF NOT EXISTS sync_items (
            account_id TEXT NOT NULL,
            folder TEXT NOT NULL DEFAULT '',
            uid TEXT NOT NULL,
            synced_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            PRIMARY KEY (account_id, folder, uid)
        );
        "#,
    },
    Step {
        version: 3,
        name: "archived content checksums",
        sql: r#"
        CREATE TABLE IF NOT EXISTS sync_checksums (
            account_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            PRIMARY KEY (account_id, checksum)
        );
        "#,
    },
];

pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

pub fn schema_version(conn: &Connection) -> Result<u32, DbError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Applies every step newer than the file's `user_version`. Returns the
/// version the database is at afterwards.
pub fn migrate(conn: &mut Connection) -> Result<u32, DbError> {
    let current = schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(DbError::SchemaTooNew {
            found: current,
            supported: latest,
        });
    }

    for step in STEPS.iter().filter(|step| step.version > current) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(step.sql)
            .map_err(|source| DbError::Migration {
                version: step.version,
                name: step.name,
                source,
            })?;
        tx.pragma_update(None, "user_version", step.version)?;
        tx.commit()?;
        debug!(version = step.version, step = step.name, "sync state migrated");
    }

    Ok(latest)
}
