use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How long a finished import stays queryable.
pub const JOB_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImportPhase {
    Uploading,
    Extracting,
    Indexing,
    Done,
    Error,
}

impl ImportPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl Display for ImportPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uploading => "uploading",
            Self::Extracting => "extracting",
            Self::Indexing => "indexing",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportJob {
    pub id: String,
    pub user: String,
    pub account_id: Option<String>,
    pub filename: String,
    pub phase: ImportPhase,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(id: impl Into<String>, user: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            account_id: None,
            filename: filename.into(),
            phase: ImportPhase::Uploading,
            current: 0,
            total: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// In-flight and recently finished imports. Nothing here is persisted.
#[derive(Debug, Default)]
pub struct ImportJobs {
    jobs: RwLock<HashMap<String, ImportJob>>,
}

impl ImportJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: ImportJob) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.id.clone(), job);
        }
    }

    /// Applies `change` to the job if it is still tracked.
    pub fn update(&self, id: &str, change: impl FnOnce(&mut ImportJob)) -> bool {
        let Ok(mut jobs) = self.jobs.write() else {
            return false;
        };
        match jobs.get_mut(id) {
            Some(job) => {
                change(job);
                job.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Late progress for a job that already ended is dropped.
    pub fn set_progress(&self, id: &str, phase: ImportPhase, current: u64, total: u64) {
        self.update(id, |job| {
            if job.phase.is_finished() {
                return;
            }
            job.phase = phase;
            job.current = current;
            job.total = total;
        });
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(id, |job| {
            job.phase = ImportPhase::Error;
            job.error = Some(error);
        });
    }

    pub fn get(&self, id: &str) -> Option<ImportJob> {
        self.jobs.read().ok()?.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<ImportJob> {
        self.jobs.write().ok()?.remove(id)
    }

    /// Forgets the job once `after` has elapsed. Needs a tokio runtime.
    pub fn schedule_cleanup(self: &Arc<Self>, id: &str, after: Duration) {
        let jobs = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if jobs.remove(&id).is_some() {
                debug!(job_id = %id, "import job expired");
            }
        });
    }
}
