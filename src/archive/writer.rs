use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::{join_key, message_file_name, ArchiveError, BlobStore};
use crate::checksum::checksum;
use crate::mail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMessage {
    pub key: String,
    pub checksum: String,
    /// False when an identical file already existed and nothing was written.
    pub created: bool,
}

/// Writes raw messages into one account's part of the archive.
#[derive(Clone)]
pub struct MessageWriter {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl MessageWriter {
    pub fn new(store: Arc<dyn BlobStore>, account_prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: account_prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Stores `raw` as `{folder_slug}/{checksum}-{remote_id}.eml`. An existing
    /// file under the same name is left untouched.
    pub fn save(
        &self,
        folder_slug: &str,
        remote_id: &str,
        raw: &[u8],
    ) -> Result<SavedMessage, ArchiveError> {
        if raw.is_empty() {
            return Err(ArchiveError::EmptyMessage);
        }

        let checksum = checksum(raw);
        let key = join_key(&[
            &self.prefix,
            folder_slug,
            &message_file_name(&checksum, remote_id, "eml"),
        ]);

        if self.store.exists(&key)? {
            return Ok(SavedMessage {
                key,
                checksum,
                created: false,
            });
        }

        self.store.write(&key, raw)?;

        if let Some(date) = mail::message_date(raw) {
            let when = SystemTime::from(date);
            if let Err(err) = self.store.set_modified(&key, when) {
                debug!(key = %key, error = %err, "could not set message mtime");
            }
        }

        Ok(SavedMessage {
            key,
            checksum,
            created: true,
        })
    }
}
