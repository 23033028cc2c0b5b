//! Socket plumbing shared by the IMAP and POP3 drivers: plain or TLS connect
//! with a bounded handshake, and a buffered line reader whose every read and
//! write is bounded by a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::ConnectorError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const IO_TIMEOUT: Duration = Duration::from_secs(120);
pub const MAX_LINE_LEN: usize = 1024 * 1024;
/// Largest single literal (one message body) accepted from a server.
pub const MAX_LITERAL_LEN: usize = 256 * 1024 * 1024;

pub trait MailStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> MailStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn MailStream>;

pub async fn connect(host: &str, port: u16, use_tls: bool) -> Result<BoxedStream, ConnectorError> {
    debug!(host = %host, port, tls = use_tls, "opening mail connection");

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ConnectorError::Timeout {
            operation: "connect",
            seconds: CONNECT_TIMEOUT.as_secs(),
        })?
        .map_err(|source| ConnectorError::Connect {
            host: host.to_string(),
            port,
            source,
        })?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnectorError::Tls(format!("invalid server name '{host}': {e}")))?;
    let tls = timeout(CONNECT_TIMEOUT, tls_connector().connect(server_name, tcp))
        .await
        .map_err(|_| ConnectorError::Timeout {
            operation: "tls handshake",
            seconds: CONNECT_TIMEOUT.as_secs(),
        })?
        .map_err(|e| ConnectorError::Tls(e.to_string()))?;

    Ok(Box::new(tls))
}

fn tls_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn read_timeout(limit: Duration) -> ConnectorError {
    ConnectorError::Timeout {
        operation: "read",
        seconds: limit.as_secs(),
    }
}

/// Line-framed access to a mail server connection.
pub struct LineStream<S> {
    inner: BufReader<S>,
    io_timeout: Duration,
}

impl<S> LineStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_timeout(stream, IO_TIMEOUT)
    }

    pub fn with_timeout(stream: S, io_timeout: Duration) -> Self {
        Self {
            inner: BufReader::new(stream),
            io_timeout,
        }
    }

    /// One line with its CR/LF terminator removed, bytes untouched otherwise.
    /// Never buffers more than [`MAX_LINE_LEN`] bytes of a line.
    pub async fn read_line_bytes(&mut self) -> Result<Vec<u8>, ConnectorError> {
        let io_timeout = self.io_timeout;
        let mut line = Vec::new();
        let mut bounded = (&mut self.inner).take(MAX_LINE_LEN as u64 + 1);
        let read = timeout(io_timeout, bounded.read_until(b'\n', &mut line))
            .await
            .map_err(|_| read_timeout(io_timeout))??;
        if read == 0 {
            return Err(ConnectorError::Closed);
        }
        if line.len() > MAX_LINE_LEN {
            return Err(ConnectorError::Framing(format!(
                "response line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }
        Ok(line)
    }

    pub async fn read_line(&mut self) -> Result<String, ConnectorError> {
        let line = self.read_line_bytes().await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Exactly `len` bytes. The buffer grows with the bytes that actually arrive.
    pub async fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>, ConnectorError> {
        if len > MAX_LITERAL_LEN {
            return Err(ConnectorError::Framing(format!(
                "literal of {len} bytes exceeds {MAX_LITERAL_LEN} bytes"
            )));
        }

        let io_timeout = self.io_timeout;
        let mut buf = Vec::with_capacity(len.min(64 * 1024));
        let mut bounded = (&mut self.inner).take(len as u64);
        timeout(io_timeout, bounded.read_to_end(&mut buf))
            .await
            .map_err(|_| read_timeout(io_timeout))??;
        if buf.len() < len {
            return Err(ConnectorError::Closed);
        }
        Ok(buf)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ConnectorError> {
        let mut payload = Vec::with_capacity(line.len() + 2);
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\r\n");

        let stream = self.inner.get_mut();
        timeout(self.io_timeout, async {
            stream.write_all(&payload).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ConnectorError::Timeout {
            operation: "write",
            seconds: self.io_timeout.as_secs(),
        })??;
        Ok(())
    }
}
