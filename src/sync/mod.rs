//! Sync orchestration: one background task per account sync or archive
//! import, job bookkeeping in the state DB, and index refresh afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{BlobStore, FsBlobStore, MessageWriter};
use crate::config::{
    AccountConfig, AccountSource, ConfigError, FolderSelection, JsonAccountStore, Protocol,
};
use crate::connectors::{ConnectorRegistry, MailConnector, SyncContext, SyncReport};
use crate::db::models::{JobStatus, SyncJob};
use crate::db::{DbError, StateDb};
use crate::importer::readpst::count_eml_files;
use crate::importer::{
    sanitize_title, stream_upload, ImportError, ImportJob, ImportJobs, ImportPhase, ImportSummary,
    Importer, JOB_RETENTION,
};
use crate::indexer::{BuildReport, IndexCatalog, IndexError, IndexStats, SearchIndex};
use crate::search::{search_multi, SearchResults};

pub mod registry;

pub use registry::{RunningGuard, RunningSync, RunningSyncs};

pub const CANCELLED_ERROR: &str = "sync cancelled";
pub const PANICKED_ERROR: &str = "sync task panicked";
const ABORTED_ERROR: &str = "sync task aborted";
const ABANDONED_ERROR: &str = "interrupted: process exited during sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync already running for account {account_id}")]
    AlreadyRunning { account_id: String },

    #[error("no sync running for account {account_id}")]
    NotRunning { account_id: String },

    #[error("account {account_id} uses {protocol}, which cannot be synced")]
    UnsupportedProtocol {
        account_id: String,
        protocol: Protocol,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] DbError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Result of one finished sync task.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub job_id: String,
    pub account_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub report: SyncReport,
}

pub struct SyncHandle {
    pub job_id: String,
    pub account_id: String,
    task: JoinHandle<SyncOutcome>,
}

impl SyncHandle {
    pub async fn wait(self) -> Result<SyncOutcome, SyncError> {
        self.task
            .await
            .map_err(|err| SyncError::Task(err.to_string()))
    }
}

pub struct ImportHandle {
    pub job_id: String,
    pub account_id: String,
    pub filename: String,
    task: JoinHandle<()>,
}

impl ImportHandle {
    pub async fn wait(self) -> Result<(), SyncError> {
        self.task
            .await
            .map_err(|err| SyncError::Task(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub protocol: Protocol,
    pub email: String,
    pub enabled: bool,
    pub syncing: bool,
    pub progress: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
    pub new_messages: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct SyncService {
    root: PathBuf,
    store: Arc<dyn BlobStore>,
    accounts: Arc<dyn AccountSource>,
    connectors: Arc<ConnectorRegistry>,
    running: Arc<RunningSyncs>,
    importer: Importer,
    imports: Arc<ImportJobs>,
    indexes: Arc<IndexCatalog>,
}

impl SyncService {
    pub fn new(root: impl Into<PathBuf>, accounts: Arc<dyn AccountSource>) -> Self {
        let root = root.into();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(root.clone()));
        Self {
            indexes: Arc::new(IndexCatalog::new(Arc::clone(&store), root.clone())),
            root,
            store,
            accounts,
            connectors: Arc::new(ConnectorRegistry::with_defaults()),
            running: Arc::new(RunningSyncs::new()),
            importer: Importer::new(),
            imports: Arc::new(ImportJobs::new()),
        }
    }

    /// Service over `{root}/{user}/accounts.json` account files.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let accounts = Arc::new(JsonAccountStore::new(root.clone()));
        Self::new(root, accounts)
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = Arc::new(connectors);
        self
    }

    pub fn with_importer(mut self, importer: Importer) -> Self {
        self.importer = importer;
        self
    }

    pub fn running(&self) -> &Arc<RunningSyncs> {
        &self.running
    }

    fn state_db(&self, user: &str) -> Result<StateDb, SyncError> {
        Ok(StateDb::open_for_user(&self.root, user)?)
    }

    /// Starts a sync in the background and returns once its job is recorded.
    pub fn sync_account(&self, user: &str, account_id: &str) -> Result<SyncHandle, SyncError> {
        let account = self.accounts.get(user, account_id)?;
        let connector = self.connectors.by_protocol(account.protocol).ok_or_else(|| {
            SyncError::UnsupportedProtocol {
                account_id: account.id.clone(),
                protocol: account.protocol,
            }
        })?;
        let guard = self
            .running
            .try_start(&account.id)
            .ok_or_else(|| SyncError::AlreadyRunning {
                account_id: account.id.clone(),
            })?;

        let db = Arc::new(self.state_db(user)?);
        let job = db.create_job(&account.id)?;
        info!(account = %account.id, job = %job.id, protocol = %account.protocol, "sync started");

        let job_id = job.id.clone();
        let account_id = account.id.clone();
        let prefix = account.archive_prefix(user);
        let run = {
            let service = self.clone();
            let db = Arc::clone(&db);
            let user = user.to_string();
            tokio::spawn(async move {
                service
                    .run_sync(&user, account, connector, db, job, guard)
                    .await
            })
        };

        let service = self.clone();
        let task_job_id = job_id.clone();
        let task_account_id = account_id.clone();
        let task = tokio::spawn(async move {
            match run.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    service
                        .fail_dead_sync(db, task_job_id, task_account_id, &prefix, err)
                        .await
                }
            }
        });

        Ok(SyncHandle {
            job_id,
            account_id,
            task,
        })
    }

    async fn run_sync(
        &self,
        user: &str,
        account: AccountConfig,
        connector: Arc<dyn MailConnector>,
        db: Arc<StateDb>,
        job: SyncJob,
        guard: RunningGuard,
    ) -> SyncOutcome {
        if let Err(err) = db.start_job(&job.id) {
            warn!(job = %job.id, error = %err, "could not mark job running");
        }

        let prefix = account.archive_prefix(user);
        let writer = MessageWriter::new(Arc::clone(&self.store), prefix.clone());
        let progress = |message: String| guard.set_progress(message);
        let stored = |count: usize| {
            let count = i64::try_from(count).unwrap_or(i64::MAX);
            if let Err(err) = db.record_progress(&job.id, count) {
                debug!(job = %job.id, error = %err, "could not record live message count");
            }
        };
        let ctx = SyncContext {
            account: &account,
            writer: &writer,
            ledger: db.as_ref(),
            cancel: guard.cancel_token(),
            progress: &progress,
            stored: &stored,
        };

        let mut report = SyncReport::default();
        let result = connector.sync(&ctx, &mut report).await;

        let (status, error) = match result {
            Ok(()) if report.cancelled => (JobStatus::Failed, Some(CANCELLED_ERROR.to_string())),
            Ok(()) => (JobStatus::Done, None),
            Err(err) => (JobStatus::Failed, Some(err.to_string())),
        };
        let new_messages = i64::try_from(report.new_messages).unwrap_or(i64::MAX);
        record_outcome(Arc::clone(&db), &job.id, status, new_messages, error.as_deref()).await;

        match &error {
            None => info!(
                account = %account.id,
                new_messages = report.new_messages,
                skipped = report.skipped,
                folders = report.folders,
                item_errors = report.errors.len(),
                "sync finished"
            ),
            Some(reason) => warn!(
                account = %account.id,
                new_messages = report.new_messages,
                error = %reason,
                "sync failed"
            ),
        }

        guard.set_progress("indexing");
        if let Err(err) = self.rebuild_index(&prefix).await {
            warn!(account = %account.id, error = %err, "post-sync index rebuild failed");
        }
        drop(guard);

        SyncOutcome {
            job_id: job.id,
            account_id: account.id,
            status,
            error,
            report,
        }
    }

    /// Terminal record for a sync task that died before writing its own. The
    /// running slot was already released when the task unwound.
    async fn fail_dead_sync(
        &self,
        db: Arc<StateDb>,
        job_id: String,
        account_id: String,
        prefix: &str,
        err: JoinError,
    ) -> SyncOutcome {
        let reason = if err.is_panic() {
            PANICKED_ERROR
        } else {
            ABORTED_ERROR
        };
        error!(account = %account_id, job = %job_id, error = %err, "sync task died");

        let new_messages = match db.get_job(&job_id) {
            Ok(Some(job)) => job.new_messages,
            _ => 0,
        };
        record_outcome(db, &job_id, JobStatus::Failed, new_messages, Some(reason)).await;
        if let Err(err) = self.rebuild_index(prefix).await {
            warn!(account = %account_id, error = %err, "post-sync index rebuild failed");
        }

        SyncOutcome {
            job_id,
            account_id,
            status: JobStatus::Failed,
            error: Some(reason.to_string()),
            report: SyncReport {
                new_messages: usize::try_from(new_messages).unwrap_or(0),
                ..SyncReport::default()
            },
        }
    }

    /// Starts every enabled, syncable account. Accounts that cannot start are
    /// logged and left out.
    pub fn sync_all(&self, user: &str) -> Result<Vec<SyncHandle>, SyncError> {
        let mut handles = Vec::new();
        for account in self.accounts.list(user)? {
            if !account.enabled || account.protocol == Protocol::Pst {
                continue;
            }
            match self.sync_account(user, &account.id) {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(account = %account.id, error = %err, "could not start sync"),
            }
        }
        Ok(handles)
    }

    pub fn stop_sync(&self, account_id: &str) -> Result<(), SyncError> {
        if self.running.cancel(account_id) {
            info!(account = %account_id, "sync cancellation requested");
            return Ok(());
        }
        Err(SyncError::NotRunning {
            account_id: account_id.to_string(),
        })
    }

    pub fn sync_status(&self, user: &str, account_id: &str) -> Result<AccountStatus, SyncError> {
        let account = self.accounts.get(user, account_id)?;
        let db = self.state_db(user)?;
        self.compose_status(&db, &account)
    }

    pub fn status_all(&self, user: &str) -> Result<Vec<AccountStatus>, SyncError> {
        let db = self.state_db(user)?;
        self.accounts
            .list(user)?
            .iter()
            .map(|account| self.compose_status(&db, account))
            .collect()
    }

    fn compose_status(
        &self,
        db: &StateDb,
        account: &AccountConfig,
    ) -> Result<AccountStatus, SyncError> {
        let running = self.running.get(&account.id);
        let last = db.last_job(&account.id)?;
        Ok(AccountStatus {
            account_id: account.id.clone(),
            protocol: account.protocol,
            email: account.email.clone(),
            enabled: account.enabled,
            syncing: running.is_some(),
            progress: running.as_ref().map(|r| r.progress.clone()),
            started_at: running.as_ref().map(|r| r.started_at),
            last_sync: last.as_ref().map(|job| job.finished_at.unwrap_or(job.started_at)),
            last_status: last.as_ref().map(|job| job.status),
            new_messages: last.as_ref().map(|job| job.new_messages),
            last_error: last.and_then(|job| job.error),
        })
    }

    /// Marks jobs a previous process left unfinished as failed.
    pub fn recover_interrupted(&self, user: &str) -> Result<usize, SyncError> {
        let recovered = self.state_db(user)?.fail_abandoned_jobs(ABANDONED_ERROR)?;
        if recovered > 0 {
            warn!(user = %user, jobs = recovered, "marked interrupted sync jobs as failed");
        }
        Ok(recovered)
    }

    /// Streams an uploaded archive to disk, registers a PST account for it and
    /// extracts it in the background. Progress is visible through
    /// [`SyncService::import_status`].
    pub async fn import_pst<R>(
        &self,
        user: &str,
        reader: R,
        size: u64,
        filename: &str,
    ) -> Result<ImportHandle, SyncError>
    where
        R: AsyncRead + Unpin,
    {
        let title = sanitize_title(filename);
        let job_id = Uuid::new_v4().to_string();
        let mut job = ImportJob::new(job_id.clone(), user, filename);
        job.total = size;
        self.imports.insert(job);

        let imports = Arc::clone(&self.imports);
        let progress_id = job_id.clone();
        let progress = move |phase: ImportPhase, current: u64, total: u64| {
            imports.set_progress(&progress_id, phase, current, total);
        };
        let temp = match stream_upload(reader, size, &progress).await {
            Ok(temp) => temp,
            Err(err) => {
                self.abandon_import(&job_id, &err.to_string());
                return Err(err.into());
            }
        };

        let account = AccountConfig {
            id: Uuid::new_v4().to_string(),
            protocol: Protocol::Pst,
            email: title,
            host: String::new(),
            port: 0,
            username: None,
            password: String::new(),
            ssl: false,
            folders: FolderSelection::All,
            enabled: false,
        };
        if let Err(err) = self.accounts.register(user, account.clone()) {
            self.abandon_import(&job_id, &err.to_string());
            return Err(err.into());
        }
        self.imports.update(&job_id, |job| job.account_id = Some(account.id.clone()));
        info!(account = %account.id, job = %job_id, file = %filename, "archive uploaded");

        let service = self.clone();
        let user = user.to_string();
        let account_id = account.id.clone();
        let task_job_id = job_id.clone();
        let task = tokio::spawn(async move {
            service.run_import(&user, account, temp, &task_job_id).await;
            service.imports.schedule_cleanup(&task_job_id, JOB_RETENTION);
        });

        Ok(ImportHandle {
            job_id,
            account_id,
            filename: filename.to_string(),
            task,
        })
    }

    fn abandon_import(&self, job_id: &str, reason: &str) {
        error!(job = %job_id, error = %reason, "archive import failed");
        self.imports.fail(job_id, reason);
        self.imports.schedule_cleanup(job_id, JOB_RETENTION);
    }

    async fn run_import(&self, user: &str, account: AccountConfig, archive: TempPath, job_id: &str) {
        let guard = self.running.try_start(&account.id);
        let db = match self.state_db(user) {
            Ok(db) => Some(Arc::new(db)),
            Err(err) => {
                warn!(error = %err, "import proceeds without a job record");
                None
            }
        };
        let sync_job = db.as_ref().and_then(|db| {
            let job = db.create_job(&account.id).ok()?;
            db.start_job(&job.id).ok()?;
            Some(job)
        });

        let prefix = account.archive_prefix(user);
        let dest = self.root.join(&prefix);
        let importer = self.importer.clone();
        let imports = Arc::clone(&self.imports);
        let progress_id = job_id.to_string();
        // on failure, whatever a decoder left behind is counted from disk
        let extraction = tokio::task::spawn_blocking(move || {
            let progress = move |phase: ImportPhase, current: u64, total: u64| {
                imports.set_progress(&progress_id, phase, current, total);
            };
            let result = importer.import(&archive, &dest, &progress);
            drop(archive);
            result.map_err(|err| (err, count_eml_files(&dest)))
        })
        .await
        .unwrap_or_else(|err| Err((ImportError::Panicked(err.to_string()), 0)));

        let outcome: Result<ImportSummary, (String, u64)> = match extraction {
            Ok(summary) => {
                self.imports.set_progress(
                    job_id,
                    ImportPhase::Indexing,
                    summary.extracted,
                    summary.extracted,
                );
                if let Some(guard) = &guard {
                    guard.set_progress("indexing");
                }
                match self.rebuild_index(&prefix).await {
                    Ok(_) => Ok(summary),
                    Err(err) => Err((format!("index: {err}"), summary.extracted)),
                }
            }
            Err((err, left_behind)) => {
                if left_behind > 0 {
                    if let Err(err) = self.rebuild_index(&prefix).await {
                        warn!(
                            account = %account.id,
                            error = %err,
                            "index rebuild after failed import"
                        );
                    }
                }
                Err((err.to_string(), left_behind))
            }
        };

        match &outcome {
            Ok(summary) => {
                self.imports
                    .set_progress(job_id, ImportPhase::Done, summary.extracted, summary.extracted);
                info!(
                    account = %account.id,
                    extracted = summary.extracted,
                    errors = summary.errors,
                    "archive import finished"
                );
            }
            Err((reason, left_behind)) => {
                self.imports.fail(job_id, reason.clone());
                error!(
                    account = %account.id,
                    error = %reason,
                    left_behind,
                    "archive import failed"
                );
            }
        }

        if let (Some(db), Some(job)) = (db, &sync_job) {
            let (status, extracted, error) = match &outcome {
                Ok(summary) => (JobStatus::Done, summary.extracted, None),
                Err((reason, left_behind)) => {
                    (JobStatus::Failed, *left_behind, Some(reason.as_str()))
                }
            };
            let extracted = i64::try_from(extracted).unwrap_or(i64::MAX);
            record_outcome(db, &job.id, status, extracted, error).await;
        }
    }

    /// Job state for the user's import, if it is still retained.
    pub fn import_status(&self, user: &str, job_id: &str) -> Option<ImportJob> {
        self.imports.get(job_id).filter(|job| job.user == user)
    }

    async fn rebuild_index(&self, prefix: &str) -> Result<BuildReport, SyncError> {
        let index = self.indexes.get(prefix);
        tokio::task::spawn_blocking(move || index.rebuild())
            .await
            .map_err(|err| SyncError::Task(err.to_string()))?
            .map_err(SyncError::from)
    }

    /// The account's index, built first if it has never been built.
    async fn ready_index(&self, prefix: &str) -> Result<Arc<SearchIndex>, SyncError> {
        let index = self.indexes.get(prefix);
        if index.stats().indexed_at.is_none() {
            self.rebuild_index(prefix).await?;
        }
        Ok(index)
    }

    pub async fn reindex(&self, user: &str, account_id: &str) -> Result<BuildReport, SyncError> {
        let account = self.accounts.get(user, account_id)?;
        self.rebuild_index(&account.archive_prefix(user)).await
    }

    pub async fn stats(&self, user: &str, account_id: &str) -> Result<IndexStats, SyncError> {
        let account = self.accounts.get(user, account_id)?;
        Ok(self.ready_index(&account.archive_prefix(user)).await?.stats())
    }

    /// One account's results, or all of the user's accounts merged and
    /// deduplicated when `account_id` is `None`.
    pub async fn search(
        &self,
        user: &str,
        account_id: Option<&str>,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<SearchResults, SyncError> {
        let accounts = match account_id {
            Some(id) => vec![self.accounts.get(user, id)?],
            None => self.accounts.list(user)?,
        };

        let mut indexes = Vec::with_capacity(accounts.len());
        for account in accounts {
            let index = self.ready_index(&account.archive_prefix(user)).await?;
            indexes.push((account.id, index));
        }
        Ok(search_multi(&indexes, query, offset, limit))
    }
}

/// Writes a job's terminal state from a blocking thread.
async fn record_outcome(
    db: Arc<StateDb>,
    job_id: &str,
    status: JobStatus,
    new_messages: i64,
    error: Option<&str>,
) {
    let id = job_id.to_string();
    let error = error.map(str::to_string);
    let written = tokio::task::spawn_blocking(move || {
        db.finish_job(&id, status, new_messages, error.as_deref())
    })
    .await;
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => error!(job = %job_id, error = %err, "could not record job outcome"),
        Err(err) => error!(job = %job_id, error = %err, "job outcome writer failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{SyncError, SyncService, CANCELLED_ERROR, PANICKED_ERROR};
    use crate::config::{AccountConfig, AccountSource, ConfigError, FolderSelection, Protocol};
    use crate::connectors::{
        store_message, ConnectorError, ConnectorRegistry, MailConnector, SyncContext, SyncReport,
    };
    use crate::db::models::JobStatus;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("mailarc-sync-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }

    struct StaticAccounts(Vec<AccountConfig>);

    impl AccountSource for StaticAccounts {
        fn list(&self, _user: &str) -> Result<Vec<AccountConfig>, ConfigError> {
            Ok(self.0.clone())
        }

        fn register(&self, _user: &str, account: AccountConfig) -> Result<(), ConfigError> {
            Err(ConfigError::DuplicateAccount(account.id))
        }
    }

    fn account(id: &str, protocol: Protocol, enabled: bool) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            protocol,
            email: format!("{id}@example.com"),
            host: "localhost".to_string(),
            port: 1,
            username: None,
            password: "pw".to_string(),
            ssl: false,
            folders: FolderSelection::All,
            enabled,
        }
    }

    /// Writes two messages, then waits for cancellation or a short delay.
    struct ScriptedConnector {
        hold: Duration,
    }

    #[async_trait]
    impl MailConnector for ScriptedConnector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn protocol(&self) -> Protocol {
            Protocol::Imap
        }

        async fn sync(
            &self,
            ctx: &SyncContext<'_>,
            report: &mut SyncReport,
        ) -> Result<(), ConnectorError> {
            for uid in ["1", "2"] {
                let raw = format!("Subject: scripted {uid}\r\n\r\nbody {uid}\r\n");
                let outcome = store_message(ctx, "INBOX", "inbox", uid, raw.as_bytes());
                ctx.fold(report, uid, outcome)?;
            }
            ctx.report_progress("waiting");
            tokio::select! {
                _ = ctx.cancel.cancelled() => report.cancelled = true,
                _ = tokio::time::sleep(self.hold) => {}
            }
            report.folders = 1;
            Ok(())
        }
    }

    /// Writes one message, then dies.
    struct PanickingConnector;

    #[async_trait]
    impl MailConnector for PanickingConnector {
        fn name(&self) -> &str {
            "panicking"
        }

        fn protocol(&self) -> Protocol {
            Protocol::Pop3
        }

        async fn sync(
            &self,
            ctx: &SyncContext<'_>,
            report: &mut SyncReport,
        ) -> Result<(), ConnectorError> {
            let raw = b"Subject: before the crash\r\n\r\nbody\r\n";
            let outcome = store_message(ctx, "INBOX", "inbox", "1", raw);
            ctx.fold(report, "1", outcome)?;
            panic!("capacity overflow");
        }
    }

    fn service(root: &PathBuf, hold: Duration, accounts: Vec<AccountConfig>) -> SyncService {
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(ScriptedConnector { hold }));
        SyncService::new(root.clone(), Arc::new(StaticAccounts(accounts)))
            .with_connectors(connectors)
    }

    #[tokio::test]
    async fn sync_records_job_and_refreshes_index() {
        let root = temp_root();
        let svc = service(&root, Duration::from_millis(1), vec![account("a1", Protocol::Imap, true)]);

        let outcome = svc
            .sync_account("u1", "a1")
            .expect("start")
            .wait()
            .await
            .expect("finish");
        assert_eq!(outcome.status, JobStatus::Done);
        assert_eq!(outcome.report.new_messages, 2);

        let status = svc.sync_status("u1", "a1").expect("status");
        assert!(!status.syncing);
        assert_eq!(status.last_status, Some(JobStatus::Done));
        assert_eq!(status.new_messages, Some(2));
        assert!(status.last_error.is_none());

        let results = svc.search("u1", Some("a1"), "scripted", 0, 0).await.expect("search");
        assert_eq!(results.total, 2);

        let again = svc
            .sync_account("u1", "a1")
            .expect("start again")
            .wait()
            .await
            .expect("finish again");
        assert_eq!(again.report.new_messages, 0);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn second_start_conflicts_and_stop_cancels() {
        let root = temp_root();
        let svc = service(&root, Duration::from_secs(30), vec![account("a1", Protocol::Imap, true)]);

        let handle = svc.sync_account("u1", "a1").expect("start");
        assert!(matches!(
            svc.sync_account("u1", "a1"),
            Err(SyncError::AlreadyRunning { .. })
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = svc.sync_status("u1", "a1").expect("status");
        assert!(status.syncing);
        assert!(status.started_at.is_some());
        assert_eq!(status.progress.as_deref(), Some("waiting"));
        assert_eq!(status.last_status, Some(JobStatus::Running));
        assert_eq!(status.new_messages, Some(2));

        svc.stop_sync("a1").expect("stop");
        let outcome = handle.wait().await.expect("finish");
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED_ERROR));
        assert_eq!(outcome.report.new_messages, 2);

        assert!(matches!(svc.stop_sync("a1"), Err(SyncError::NotRunning { .. })));
        let status = svc.sync_status("u1", "a1").expect("status");
        assert!(!status.syncing);
        assert_eq!(status.last_error.as_deref(), Some(CANCELLED_ERROR));
        assert_eq!(status.new_messages, Some(2));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn a_panicking_sync_still_finishes_its_job() {
        let root = temp_root();
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(PanickingConnector));
        let accounts = StaticAccounts(vec![account("p1", Protocol::Pop3, true)]);
        let svc = SyncService::new(root.clone(), Arc::new(accounts)).with_connectors(connectors);

        let outcome = svc
            .sync_account("u1", "p1")
            .expect("start")
            .wait()
            .await
            .expect("outcome despite the panic");
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some(PANICKED_ERROR));
        assert_eq!(outcome.report.new_messages, 1);

        let status = svc.sync_status("u1", "p1").expect("status");
        assert!(!status.syncing);
        assert_eq!(status.last_status, Some(JobStatus::Failed));
        assert_eq!(status.last_error.as_deref(), Some(PANICKED_ERROR));
        assert_eq!(status.new_messages, Some(1));

        let found = svc.search("u1", Some("p1"), "crash", 0, 0).await.expect("search");
        assert_eq!(found.total, 1);
        assert!(svc.sync_account("u1", "p1").is_ok(), "running slot released");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn sync_all_skips_disabled_pst_and_unsupported_accounts() {
        let root = temp_root();
        let svc = service(
            &root,
            Duration::from_millis(1),
            vec![
                account("on", Protocol::Imap, true),
                account("off", Protocol::Imap, false),
                account("pst", Protocol::Pst, true),
                account("pop", Protocol::Pop3, true),
            ],
        );

        let handles = svc.sync_all("u1").expect("sync all");
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].account_id, "on");
        for handle in handles {
            handle.wait().await.expect("finish");
        }

        assert!(matches!(
            svc.sync_account("u1", "pst"),
            Err(SyncError::UnsupportedProtocol { .. })
        ));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn interrupted_jobs_are_failed_on_recovery() {
        let root = temp_root();
        let svc = service(&root, Duration::from_millis(1), vec![account("a1", Protocol::Imap, true)]);

        let db = svc.state_db("u1").expect("db");
        db.create_job("a1").expect("job");
        assert_eq!(svc.recover_interrupted("u1").expect("recover"), 1);

        let status = svc.sync_status("u1", "a1").expect("status");
        assert_eq!(status.last_status, Some(JobStatus::Failed));
        assert!(status.last_error.is_some());

        let _ = std::fs::remove_dir_all(root);
    }
}
