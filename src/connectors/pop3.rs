use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::transport::{self, LineStream};
use super::{store_message, ConnectorError, ItemOutcome, MailConnector, SyncContext, SyncReport};
use crate::checksum::checksum;
use crate::config::Protocol;

/// POP3 has no folders; everything lands in the inbox.
pub const POP3_FOLDER: &str = "inbox";

#[derive(Debug, Default)]
pub struct Pop3Connector;

impl Pop3Connector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailConnector for Pop3Connector {
    fn name(&self) -> &str {
        "pop3"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Pop3
    }

    async fn sync(
        &self,
        ctx: &SyncContext<'_>,
        report: &mut SyncReport,
    ) -> Result<(), ConnectorError> {
        let account = ctx.account;
        let port = account.effective_port();
        ctx.report_progress(format!("connecting to {}:{port}", account.host));

        let stream = transport::connect(&account.host, port, account.ssl).await?;
        let mut session = Pop3Session::new(LineStream::new(stream));
        let result = sync_maildrop(&mut session, ctx, report).await;
        session.quit().await;
        result
    }
}

/// Downloads every message not seen before. Messages are identified by a
/// checksum of their content since POP3 message numbers are not stable.
/// Nothing is ever deleted from the server.
pub async fn sync_maildrop<S>(
    session: &mut Pop3Session<S>,
    ctx: &SyncContext<'_>,
    report: &mut SyncReport,
) -> Result<(), ConnectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let account = ctx.account;
    session.read_greeting().await?;
    session.login(account.login_name(), &account.password).await?;

    let (count, size) = session.stat().await?;
    info!(account = %account.id, count, size, "pop3 maildrop opened");

    for number in 1..=count {
        if ctx.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if number % 50 == 1 {
            ctx.report_progress(format!("message {number}/{count}"));
        }

        let outcome = match session.retr(number).await {
            Ok(raw) => {
                let hash = checksum(&raw);
                match ctx.ledger.is_synced(&account.id, POP3_FOLDER, &hash) {
                    Ok(true) => Ok(ItemOutcome::AlreadySynced),
                    Ok(false) => store_message(ctx, POP3_FOLDER, POP3_FOLDER, &hash, &raw),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err),
        };
        ctx.fold(report, &format!("message {number}"), outcome)?;
    }
    report.folders = 1;

    Ok(())
}

pub struct Pop3Session<S> {
    conn: LineStream<S>,
}

impl<S> Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(conn: LineStream<S>) -> Self {
        Self { conn }
    }

    async fn expect_ok(&mut self, command: &'static str) -> Result<String, ConnectorError> {
        let line = self.conn.read_line().await?;
        match line.strip_prefix("+OK") {
            Some(rest) => Ok(rest.trim().to_string()),
            None => Err(ConnectorError::Rejected {
                command,
                response: line,
            }),
        }
    }

    pub async fn read_greeting(&mut self) -> Result<(), ConnectorError> {
        self.expect_ok("greeting").await.map(|_| ())
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), ConnectorError> {
        self.conn.write_line(&format!("USER {user}")).await?;
        self.expect_ok("USER").await.map_err(into_auth)?;
        self.conn.write_line(&format!("PASS {password}")).await?;
        self.expect_ok("PASS").await.map_err(into_auth)?;
        Ok(())
    }

    pub async fn stat(&mut self) -> Result<(u32, u64), ConnectorError> {
        self.conn.write_line("STAT").await?;
        let reply = self.expect_ok("STAT").await?;
        let mut fields = reply.split_whitespace();
        let count = fields.next().and_then(|v| v.parse().ok());
        let size = fields.next().and_then(|v| v.parse().ok());
        match (count, size) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(ConnectorError::Protocol(format!("malformed STAT reply: {reply}"))),
        }
    }

    /// Retrieves one message, undoing dot-stuffing and restoring CRLF line
    /// endings.
    pub async fn retr(&mut self, number: u32) -> Result<Vec<u8>, ConnectorError> {
        self.conn.write_line(&format!("RETR {number}")).await?;
        self.expect_ok("RETR").await?;

        let mut message = Vec::new();
        loop {
            let line = self.conn.read_line_bytes().await?;
            if line == b"." {
                break;
            }
            let unstuffed = match line.strip_prefix(b".") {
                Some(rest) if rest.starts_with(b".") => rest,
                _ => line.as_slice(),
            };
            message.extend_from_slice(unstuffed);
            message.extend_from_slice(b"\r\n");
        }
        Ok(message)
    }

    pub async fn quit(&mut self) {
        let result = async {
            self.conn.write_line("QUIT").await?;
            self.expect_ok("QUIT").await
        }
        .await;
        if let Err(err) = result {
            debug!(error = %err, "pop3 quit failed");
        }
    }
}

fn into_auth(err: ConnectorError) -> ConnectorError {
    match err {
        ConnectorError::Rejected { response, .. } => ConnectorError::Auth(response),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{sync_maildrop, Pop3Session};
    use crate::archive::{BlobStore, FsBlobStore, MessageWriter};
    use crate::config::Protocol;
    use crate::connectors::testing::{account, MemoryLedger};
    use crate::connectors::transport::LineStream;
    use crate::connectors::{ConnectorError, SyncContext, SyncReport};

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("mailarc-pop3-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }

    const MESSAGES: [&str; 2] = [
        "Subject: first\r\n\r\nhello\r\n..leading dot\r\n",
        "Subject: second\r\n\r\nbye\r\n",
    ];

    async fn fake_server(stream: DuplexStream, commands: Arc<Mutex<Vec<String>>>) {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        write.write_all(b"+OK pop3 ready\r\n").await.expect("greet");

        let mut raw = String::new();
        loop {
            raw.clear();
            if reader.read_line(&mut raw).await.expect("read") == 0 {
                return;
            }
            let command = raw.trim_end().to_string();
            commands.lock().expect("commands lock").push(command.clone());

            let reply = if command.starts_with("PASS") && command != "PASS pw" {
                "-ERR invalid password\r\n".to_string()
            } else if command == "STAT" {
                format!("+OK {} 120\r\n", MESSAGES.len())
            } else if let Some(number) = command.strip_prefix("RETR ") {
                let idx: usize = number.parse().expect("number");
                format!("+OK\r\n{}.\r\n", MESSAGES[idx - 1])
            } else {
                "+OK\r\n".to_string()
            };
            write.write_all(reply.as_bytes()).await.expect("write");
            if command == "QUIT" {
                return;
            }
        }
    }

    #[tokio::test]
    async fn retr_undoes_dot_stuffing() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"+OK 30 octets\r\nSubject: x\r\n\r\n..dot\r\n.\r\n")
            .await
            .expect("server write");
        let mut session = Pop3Session::new(LineStream::new(client));
        let raw = session.retr(1).await.expect("retr");
        assert_eq!(raw, b"Subject: x\r\n\r\n.dot\r\n");
    }

    #[tokio::test]
    async fn sync_downloads_once_and_never_deletes() {
        let root = temp_root();
        let store = Arc::new(FsBlobStore::new(&root));
        let writer = MessageWriter::new(store.clone(), "u/example.com/me");
        let ledger = MemoryLedger::default();
        let cancel = CancellationToken::new();
        let account = account(Protocol::Pop3);
        let progress = |_: String| {};
        let ctx = SyncContext {
            account: &account,
            writer: &writer,
            ledger: &ledger,
            cancel: &cancel,
            progress: &progress,
            stored: &|_| {},
        };

        for expected_new in [2usize, 0] {
            let commands = Arc::new(Mutex::new(Vec::new()));
            let (client, server) = tokio::io::duplex(64 * 1024);
            let server_task = tokio::spawn(fake_server(server, commands.clone()));

            let mut session = Pop3Session::new(LineStream::new(client));
            let mut report = SyncReport::default();
            sync_maildrop(&mut session, &ctx, &mut report)
                .await
                .expect("sync maildrop");
            session.quit().await;
            server_task.await.expect("server task");

            assert_eq!(report.new_messages, expected_new);
            assert_eq!(report.skipped, 2 - expected_new);
            let seen = commands.lock().expect("commands lock").clone();
            assert!(seen.iter().all(|c| !c.starts_with("DELE")));
            assert_eq!(seen.last().map(String::as_str), Some("QUIT"));
        }

        let keys = store.list("u").expect("list");
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|key| key.starts_with("u/example.com/me/inbox/")));
        let stored = keys
            .iter()
            .map(|key| store.read(key).expect("read"))
            .find(|raw| raw.starts_with(b"Subject: first"))
            .expect("first message stored");
        assert!(stored.ends_with(b"\r\n.leading dot\r\n"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn wrong_password_is_an_auth_error() {
        let root = temp_root();
        let writer = MessageWriter::new(Arc::new(FsBlobStore::new(&root)), "u/d/l");
        let ledger = MemoryLedger::default();
        let cancel = CancellationToken::new();
        let mut account = account(Protocol::Pop3);
        account.password = "nope".to_string();
        let progress = |_: String| {};
        let ctx = SyncContext {
            account: &account,
            writer: &writer,
            ledger: &ledger,
            cancel: &cancel,
            progress: &progress,
            stored: &|_| {},
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_server(server, Arc::new(Mutex::new(Vec::new()))));
        let mut session = Pop3Session::new(LineStream::new(client));
        let mut report = SyncReport::default();
        let err = sync_maildrop(&mut session, &ctx, &mut report)
            .await
            .expect_err("login must fail");
        assert!(matches!(err, ConnectorError::Auth(_)));

        let _ = std::fs::remove_dir_all(root);
    }
}
