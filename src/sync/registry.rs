//! Accounts with a sync in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

struct Entry {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    progress: Arc<Mutex<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSync {
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub progress: String,
}

/// At most one entry per account. Held entries are released by dropping the
/// [`RunningGuard`] handed out by [`RunningSyncs::try_start`].
#[derive(Default)]
pub struct RunningSyncs {
    entries: RwLock<HashMap<String, Entry>>,
}

impl RunningSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the account. `None` if a sync for it is already running.
    pub fn try_start(self: &Arc<Self>, account_id: &str) -> Option<RunningGuard> {
        let mut entries = self.write();
        if entries.contains_key(account_id) {
            return None;
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(Mutex::new("starting".to_string()));
        entries.insert(
            account_id.to_string(),
            Entry {
                cancel: cancel.clone(),
                started_at: Utc::now(),
                progress: Arc::clone(&progress),
            },
        );

        Some(RunningGuard {
            registry: Arc::clone(self),
            account_id: account_id.to_string(),
            cancel,
            progress,
        })
    }

    /// Signals the running sync to stop. False if nothing was running.
    pub fn cancel(&self, account_id: &str) -> bool {
        match self.read().get(account_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, account_id: &str) -> Option<RunningSync> {
        self.read().get(account_id).map(|entry| RunningSync {
            account_id: account_id.to_string(),
            started_at: entry.started_at,
            progress: entry
                .progress
                .lock()
                .map(|progress| progress.clone())
                .unwrap_or_default(),
        })
    }

    pub fn snapshot(&self) -> Vec<RunningSync> {
        let ids: Vec<String> = self.read().keys().cloned().collect();
        let mut running: Vec<RunningSync> = ids.iter().filter_map(|id| self.get(id)).collect();
        running.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        running
    }

    fn finish(&self, account_id: &str) {
        self.write().remove(account_id);
    }
}

/// Ownership of one account's running slot.
pub struct RunningGuard {
    registry: Arc<RunningSyncs>,
    account_id: String,
    cancel: CancellationToken,
    progress: Arc<Mutex<String>>,
}

impl RunningGuard {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_progress(&self, message: impl Into<String>) {
        if let Ok(mut progress) = self.progress.lock() {
            *progress = message.into();
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.account_id);
    }
}
