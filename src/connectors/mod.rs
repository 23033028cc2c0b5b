use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::archive::{ArchiveError, MessageWriter};
use crate::checksum::checksum;
use crate::config::{AccountConfig, Protocol};
use crate::db::DbError;

pub mod imap;
pub mod pop3;
pub mod transport;

pub use imap::ImapConnector;
pub use pop3::Pop3Connector;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tls: {0}")]
    Tls(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("connection closed by server")]
    Closed,

    #[error("network: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server rejected {command}: {response}")]
    Rejected {
        command: &'static str,
        response: String,
    },

    #[error("protocol: {0}")]
    Protocol(String),

    /// The response stream can no longer be parsed, e.g. an oversized line or
    /// literal was announced.
    #[error("protocol framing: {0}")]
    Framing(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    State(#[from] DbError),
}

impl ConnectorError {
    /// Errors after which the connection cannot be trusted for further
    /// commands. Everything else is scoped to one item or folder.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Tls(_)
                | Self::Timeout { .. }
                | Self::Closed
                | Self::Io(_)
                | Self::Framing(_)
                | Self::Auth(_)
        )
    }
}

/// Remembers which remote items were already downloaded.
pub trait SyncLedger: Send + Sync {
    fn is_synced(&self, account_id: &str, folder: &str, remote_id: &str) -> Result<bool, DbError>;

    fn mark_synced(&self, account_id: &str, folder: &str, remote_id: &str) -> Result<(), DbError>;

    fn synced_ids(&self, account_id: &str, folder: &str) -> Result<HashSet<String>, DbError>;

    fn has_checksum(&self, account_id: &str, checksum: &str) -> Result<bool, DbError>;

    fn record_checksum(&self, account_id: &str, checksum: &str) -> Result<(), DbError>;
}

/// Everything one sync run needs besides the connection itself.
pub struct SyncContext<'a> {
    pub account: &'a AccountConfig,
    pub writer: &'a MessageWriter,
    pub ledger: &'a dyn SyncLedger,
    pub cancel: &'a CancellationToken,
    pub progress: &'a (dyn Fn(String) + Send + Sync),
    /// Receives the running new-message count each time it grows.
    pub stored: &'a (dyn Fn(usize) + Send + Sync),
}

impl SyncContext<'_> {
    pub fn report_progress(&self, message: impl Into<String>) {
        (self.progress)(message.into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// [`SyncReport::fold`], passing a grown new-message count on to `stored`.
    pub fn fold(
        &self,
        report: &mut SyncReport,
        item: &str,
        result: Result<ItemOutcome, ConnectorError>,
    ) -> Result<(), ConnectorError> {
        let before = report.new_messages;
        report.fold(item, result)?;
        if report.new_messages > before {
            (self.stored)(report.new_messages);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Written,
    AlreadySynced,
    /// Same bytes are already in this account's archive.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub new_messages: usize,
    pub skipped: usize,
    pub folders: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl SyncReport {
    /// Folds one item's result into the counters. Item-level failures are
    /// logged and kept; only connection-fatal errors are handed back.
    pub fn fold(
        &mut self,
        item: &str,
        result: Result<ItemOutcome, ConnectorError>,
    ) -> Result<(), ConnectorError> {
        match result {
            Ok(ItemOutcome::Written) => self.new_messages += 1,
            Ok(ItemOutcome::AlreadySynced | ItemOutcome::Duplicate) => self.skipped += 1,
            Err(err) if err.is_connection_fatal() => return Err(err),
            Err(err) => {
                warn!(item = %item, error = %err, "skipping message");
                self.errors.push(format!("{item}: {err}"));
            }
        }
        Ok(())
    }
}

/// Writes a fetched message and marks it synced, strictly in that order.
pub fn store_message(
    ctx: &SyncContext<'_>,
    folder: &str,
    folder_slug: &str,
    remote_id: &str,
    raw: &[u8],
) -> Result<ItemOutcome, ConnectorError> {
    let account_id = ctx.account.id.as_str();
    if raw.is_empty() {
        return Err(ConnectorError::Protocol("server returned an empty message".to_string()));
    }

    if ctx.ledger.has_checksum(account_id, &checksum(raw))? {
        ctx.ledger.mark_synced(account_id, folder, remote_id)?;
        return Ok(ItemOutcome::Duplicate);
    }

    let saved = ctx.writer.save(folder_slug, remote_id, raw)?;
    ctx.ledger.record_checksum(account_id, &saved.checksum)?;
    ctx.ledger.mark_synced(account_id, folder, remote_id)?;

    Ok(if saved.created {
        ItemOutcome::Written
    } else {
        ItemOutcome::Duplicate
    })
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    fn name(&self) -> &str;

    fn protocol(&self) -> Protocol;

    /// Pulls new messages into the archive. Counters in `report` stay valid
    /// when an error ends the run early.
    async fn sync(
        &self,
        ctx: &SyncContext<'_>,
        report: &mut SyncReport,
    ) -> Result<(), ConnectorError>;
}

pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn MailConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ImapConnector::new()));
        registry.register(Arc::new(Pop3Connector::new()));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn MailConnector>) {
        self.connectors
            .retain(|existing| existing.protocol() != connector.protocol());
        self.connectors.push(connector);
    }

    pub fn by_protocol(&self, protocol: Protocol) -> Option<Arc<dyn MailConnector>> {
        self.connectors
            .iter()
            .find(|connector| connector.protocol() == protocol)
            .cloned()
    }

}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
