use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use self::models::{format_timestamp, JobStatus, SyncJob};
use crate::connectors::SyncLedger;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("sync job not found: {0}")]
    JobNotFound(String),

    #[error("sync state schema step {version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sync state schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;

pub const STATE_DB_FILE: &str = "sync.sqlite";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const JOB_COLUMNS: &str = "id, account_id, status, started_at, finished_at, new_messages, error";

/// Per-user sync state: which remote items were downloaded, and the history of
/// sync attempts. WAL mode lets status readers use their own connection while a
/// sync task writes.
///
/// Statements run on the calling thread. Sync tasks make their per-item
/// ledger writes inline (single-row upserts), so the busy timeout caps how long
/// one can hold an async worker; job outcomes are written from
/// `spawn_blocking`.
pub struct StateDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl StateDb {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn from_connection(mut conn: Connection, path: PathBuf) -> Result<Self, DbError> {
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path_for_user(root: &Path, user: &str) -> PathBuf {
        root.join(user).join(STATE_DB_FILE)
    }

    pub fn open_for_user(root: &Path, user: &str) -> Result<Self, DbError> {
        Self::open(&Self::path_for_user(root, user))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_job(&self, account_id: &str) -> Result<SyncJob, DbError> {
        let job = SyncJob {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            new_messages: 0,
            error: None,
        };

        self.conn().execute(
            "INSERT INTO sync_jobs (id, account_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                job.id,
                job.account_id,
                job.status.to_string(),
                format_timestamp(&job.started_at),
            ],
        )?;
        Ok(job)
    }

    /// Moves a pending job to `running`.
    pub fn start_job(&self, job_id: &str) -> Result<(), DbError> {
        let changed = self.conn().execute(
            "UPDATE sync_jobs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![job_id],
        )?;
        if changed == 0 {
            return Err(DbError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Live counter while a job runs. Finished jobs are not touched.
    pub fn record_progress(&self, job_id: &str, new_messages: i64) -> Result<(), DbError> {
        self.conn().execute(
            "UPDATE sync_jobs SET new_messages = ?2 WHERE id = ?1 AND finished_at IS NULL",
            params![job_id, new_messages],
        )?;
        Ok(())
    }

    /// Writes the terminal state. Returns false if the job had already finished.
    pub fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        new_messages: i64,
        error: Option<&str>,
    ) -> Result<bool, DbError> {
        if !status.is_terminal() {
            return Err(DbError::Config(format!(
                "cannot finish job {job_id} with non-terminal status {status}"
            )));
        }

        let changed = self.conn().execute(
            r#"
            UPDATE sync_jobs
            SET status = ?2, finished_at = ?3, new_messages = ?4, error = ?5
            WHERE id = ?1 AND finished_at IS NULL
            "#,
            params![
                job_id,
                status.to_string(),
                format_timestamp(&Utc::now()),
                new_messages,
                error,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>, DbError> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?1"),
                params![job_id],
                SyncJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// The most recent attempt for an account; its outcome is the account's
    /// visible status.
    pub fn last_job(&self, account_id: &str) -> Result<Option<SyncJob>, DbError> {
        Ok(self.list_jobs(account_id, 1)?.into_iter().next())
    }

    pub fn list_jobs(&self, account_id: &str, limit: usize) -> Result<Vec<SyncJob>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE account_id = ?1 \
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![account_id, limit], SyncJob::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Jobs left `pending`/`running` by a process that died mid-sync.
    pub fn fail_abandoned_jobs(&self, reason: &str) -> Result<usize, DbError> {
        let changed = self.conn().execute(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', finished_at = ?1, error = ?2
            WHERE finished_at IS NULL
            "#,
            params![format_timestamp(&Utc::now()), reason],
        )?;
        Ok(changed)
    }

    pub fn is_synced(&self, account_id: &str, folder: &str, uid: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM sync_items WHERE account_id = ?1 AND folder = ?2 AND uid = ?3",
                params![account_id, folder, uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_synced(&self, account_id: &str, folder: &str, uid: &str) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO sync_items (account_id, folder, uid) VALUES (?1, ?2, ?3)",
            params![account_id, folder, uid],
        )?;
        Ok(())
    }

    pub fn synced_uids(&self, account_id: &str, folder: &str) -> Result<HashSet<String>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT uid FROM sync_items WHERE account_id = ?1 AND folder = ?2")?;
        let rows = stmt.query_map(params![account_id, folder], |row| row.get::<_, String>(0))?;
        let mut uids = HashSet::new();
        for row in rows {
            uids.insert(row?);
        }
        Ok(uids)
    }

    pub fn has_checksum(&self, account_id: &str, checksum: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM sync_checksums WHERE account_id = ?1 AND checksum = ?2",
                params![account_id, checksum],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_checksum(&self, account_id: &str, checksum: &str) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO sync_checksums (account_id, checksum) VALUES (?1, ?2)",
            params![account_id, checksum],
        )?;
        Ok(())
    }
}

impl SyncLedger for StateDb {
    fn is_synced(&self, account_id: &str, folder: &str, remote_id: &str) -> Result<bool, DbError> {
        StateDb::is_synced(self, account_id, folder, remote_id)
    }

    fn mark_synced(&self, account_id: &str, folder: &str, remote_id: &str) -> Result<(), DbError> {
        StateDb::mark_synced(self, account_id, folder, remote_id)
    }

    fn synced_ids(&self, account_id: &str, folder: &str) -> Result<HashSet<String>, DbError> {
        self.synced_uids(account_id, folder)
    }

    fn has_checksum(&self, account_id: &str, checksum: &str) -> Result<bool, DbError> {
        StateDb::has_checksum(self, account_id, checksum)
    }

    fn record_checksum(&self, account_id: &str, checksum: &str) -> Result<(), DbError> {
        StateDb::record_checksum(self, account_id, checksum)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::models::JobStatus;
    use super::StateDb;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("mailarc-db-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp test root");
        root
    }

    #[test]
    fn job_lifecycle_pending_running_done() {
        let db = StateDb::open_in_memory().expect("open db");
        let job = db.create_job("acct-1").expect("create job");
        assert_eq!(job.status, JobStatus::Pending);

        db.start_job(&job.id).expect("start job");
        assert_eq!(
            db.get_job(&job.id).expect("get").expect("exists").status,
            JobStatus::Running
        );

        db.record_progress(&job.id, 3).expect("progress");
        assert!(db
            .finish_job(&job.id, JobStatus::Done, 4, None)
            .expect("finish"));

        let finished = db.last_job("acct-1").expect("last").expect("exists");
        assert_eq!(finished.status, JobStatus::Done);
        assert_eq!(finished.new_messages, 4);
        assert!(finished.finished_at.is_some());
    }

    #[test]
    fn finished_jobs_are_immutable() {
        let db = StateDb::open_in_memory().expect("open db");
        let job = db.create_job("acct-1").expect("create job");
        db.start_job(&job.id).expect("start");
        assert!(db
            .finish_job(&job.id, JobStatus::Failed, 1, Some("login rejected"))
            .expect("finish"));

        assert!(!db
            .finish_job(&job.id, JobStatus::Done, 9, None)
            .expect("second finish"));
        db.record_progress(&job.id, 50).expect("late progress");

        let stored = db.get_job(&job.id).expect("get").expect("exists");
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.new_messages, 1);
        assert_eq!(stored.error.as_deref(), Some("login rejected"));
    }

    #[test]
    fn last_job_is_the_most_recent_attempt() {
        let db = StateDb::open_in_memory().expect("open db");
        let first = db.create_job("acct-1").expect("first");
        let second = db.create_job("acct-1").expect("second");
        db.create_job("acct-2").expect("other account");

        assert_eq!(db.last_job("acct-1").expect("last").expect("exists").id, second.id);
        assert_eq!(db.list_jobs("acct-1", 10).expect("list").len(), 2);
        assert_ne!(first.id, second.id);
        assert!(db.last_job("acct-missing").expect("last").is_none());
    }

    #[test]
    fn start_job_rejects_unknown_or_started_jobs() {
        let db = StateDb::open_in_memory().expect("open db");
        assert!(db.start_job("nope").is_err());

        let job = db.create_job("acct").expect("create");
        db.start_job(&job.id).expect("start");
        assert!(db.start_job(&job.id).is_err());
    }

    #[test]
    fn synced_marks_are_idempotent_and_scoped() {
        let db = StateDb::open_in_memory().expect("open db");
        db.mark_synced("acct", "INBOX", "1").expect("mark");
        db.mark_synced("acct", "INBOX", "1").expect("mark again");
        db.mark_synced("acct", "Sent", "1").expect("mark other folder");

        assert!(db.is_synced("acct", "INBOX", "1").expect("check"));
        assert!(!db.is_synced("acct", "INBOX", "2").expect("check"));
        assert!(!db.is_synced("other", "INBOX", "1").expect("check"));
        assert_eq!(db.synced_uids("acct", "INBOX").expect("uids").len(), 1);
    }

    #[test]
    fn abandoned_jobs_are_failed_on_recovery() {
        let db = StateDb::open_in_memory().expect("open db");
        let job = db.create_job("acct").expect("create");
        db.start_job(&job.id).expect("start");

        assert_eq!(db.fail_abandoned_jobs("interrupted").expect("recover"), 1);
        let stored = db.get_job(&job.id).expect("get").expect("exists");
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn state_survives_reopen_on_disk() {
        let root = temp_root();
        {
            let db = StateDb::open_for_user(&root, "u1").expect("open");
            db.mark_synced("acct", "inbox", "abc").expect("mark");
            db.record_checksum("acct", "0123456789abcdef").expect("checksum");
        }
        let db = StateDb::open_for_user(&root, "u1").expect("reopen");
        assert!(db.path().ends_with("u1/sync.sqlite"));
        assert!(db.is_synced("acct", "inbox", "abc").expect("check"));
        assert!(db.has_checksum("acct", "0123456789abcdef").expect("checksum"));

        let _ = std::fs::remove_dir_all(root);
    }
}
