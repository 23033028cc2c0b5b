//! Minimal IMAP4rev1 client for one-way archival.
//!
//! Only LOGIN, LIST, EXAMINE, UID SEARCH, UID FETCH and LOGOUT are ever sent.
//! Mailboxes are opened read-only so fetching never sets `\Seen`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::transport::{self, LineStream};
use super::{store_message, ConnectorError, MailConnector, SyncContext, SyncReport};
use crate::archive::folder_slug;
use crate::config::{FolderSelection, Protocol};

pub const FETCH_BATCH: usize = 50;

static UID_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").expect("compile UID regex"));

#[derive(Debug, Default)]
pub struct ImapConnector;

impl ImapConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    fn name(&self) -> &str {
        "imap"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Imap
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
        let mut session = ImapSession::new(LineStream::new(stream));
        let result = sync_mailbox(&mut session, ctx, report).await;
        session.logout().await;
        result
    }
}

/// Runs a full archival pass over an already connected session: greeting,
/// login, folder walk. The caller logs out.
pub async fn sync_mailbox<S>(
    session: &mut ImapSession<S>,
    ctx: &SyncContext<'_>,
    report: &mut SyncReport,
) -> Result<(), ConnectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let account = ctx.account;
    session.read_greeting().await?;
    session.login(account.login_name(), &account.password).await?;
    info!(account = %account.id, "imap login ok");

    let folders = match &account.folders {
        FolderSelection::All => {
            ctx.report_progress("listing folders");
            session.list_folders().await?
        }
        FolderSelection::Named(names) => names.clone(),
    };
    info!(account = %account.id, folders = folders.len(), "resolved imap folders");

    let total = folders.len();
    for (idx, folder) in folders.iter().enumerate() {
        if ctx.is_cancelled() {
            report.cancelled = true;
            break;
        }
        ctx.report_progress(format!("folder {}/{total}: {folder}", idx + 1));

        match sync_folder(session, ctx, folder, report).await {
            Ok(()) => report.folders += 1,
            Err(err) if err.is_connection_fatal() => return Err(err),
            Err(err) => {
                warn!(account = %account.id, folder = %folder, error = %err, "skipping folder");
                report.errors.push(format!("folder {folder}: {err}"));
            }
        }
        if report.cancelled {
            break;
        }
    }

    Ok(())
}

async fn sync_folder<S>(
    session: &mut ImapSession<S>,
    ctx: &SyncContext<'_>,
    folder: &str,
    report: &mut SyncReport,
) -> Result<(), ConnectorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let account_id = ctx.account.id.as_str();
    let slug = folder_slug(folder);

    session.examine(folder).await?;
    let uids = session.uid_search_all().await?;
    let synced = ctx.ledger.synced_ids(account_id, folder)?;
    let pending: Vec<u32> = uids
        .into_iter()
        .filter(|uid| !synced.contains(&uid.to_string()))
        .collect();
    debug!(folder = %folder, pending = pending.len(), "imap folder scanned");

    for batch in pending.chunks(FETCH_BATCH) {
        if ctx.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        let mut fetched = match session.uid_fetch(batch).await {
            Ok(messages) => messages,
            Err(err) if err.is_connection_fatal() => return Err(err),
            Err(err) => {
                warn!(folder = %folder, error = %err, "batch fetch failed, fetching one by one");
                BTreeMap::new()
            }
        };

        for uid in batch {
            if ctx.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }

            let raw = match fetched.remove(uid) {
                Some(raw) => Ok(raw),
                None => session.uid_fetch_one(*uid).await,
            };
            let uid_text = uid.to_string();
            let outcome = raw.and_then(|raw| store_message(ctx, folder, &slug, &uid_text, &raw));
            ctx.fold(report, &format!("{folder} uid {uid}"), outcome)?;
        }
    }

    Ok(())
}

/// One untagged response, with any literals it carried pulled out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub flags: Vec<String>,
    pub delimiter: Option<String>,
    pub name: String,
}

impl ListEntry {
    pub fn is_selectable(&self) -> bool {
        !self.flags.iter().any(|flag| {
            flag.eq_ignore_ascii_case("\\Noselect") || flag.eq_ignore_ascii_case("\\NonExistent")
        })
    }
}

pub struct ImapSession<S> {
    conn: LineStream<S>,
    next_tag: u32,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(conn: LineStream<S>) -> Self {
        Self { conn, next_tag: 1 }
    }

    pub async fn read_greeting(&mut self) -> Result<(), ConnectorError> {
        let line = self.conn.read_line().await?;
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("* OK") || upper.starts_with("* PREAUTH") {
            return Ok(());
        }
        Err(ConnectorError::Protocol(format!("unexpected greeting: {line}")))
    }

    /// Sends one tagged command and collects untagged responses until the
    /// tagged completion. `label` names the command in errors so arguments
    /// such as credentials never leak into messages.
    pub async fn command(
        &mut self,
        label: &'static str,
        command: &str,
    ) -> Result<Vec<ResponseLine>, ConnectorError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;
        self.conn.write_line(&format!("{tag} {command}")).await?;

        let tag_prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.conn.read_line().await?;
            if let Some(status) = line.strip_prefix(&tag_prefix) {
                if status.get(..2).is_some_and(|s| s.eq_ignore_ascii_case("OK")) {
                    return Ok(untagged);
                }
                return Err(ConnectorError::Rejected {
                    command: label,
                    response: status.to_string(),
                });
            }
            if line.starts_with('+') {
                continue;
            }
            untagged.push(self.finish_response(line).await?);
        }
    }

    /// Reads the literals announced at the end of `line` and the text that
    /// follows each of them.
    async fn finish_response(&mut self, mut line: String) -> Result<ResponseLine, ConnectorError> {
        let mut literals = Vec::new();
        while let Some(len) = literal_len(&line) {
            literals.push(self.conn.read_exact_bytes(len).await?);
            let rest = self.conn.read_line().await?;
            line.push_str(&rest);
        }
        Ok(ResponseLine {
            text: line,
            literals,
        })
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), ConnectorError> {
        let command = format!("LOGIN {} {}", quote(user), quote(password));
        match self.command("LOGIN", &command).await {
            Ok(_) => Ok(()),
            Err(ConnectorError::Rejected { response, .. }) => Err(ConnectorError::Auth(response)),
            Err(err) => Err(err),
        }
    }

    pub async fn list_folders(&mut self) -> Result<Vec<String>, ConnectorError> {
        let lines = self.command("LIST", r#"LIST "" "*""#).await?;
        let mut folders = Vec::new();
        for line in &lines {
            match parse_list_line(line) {
                Some(entry) if entry.is_selectable() => folders.push(entry.name),
                Some(entry) => debug!(folder = %entry.name, "skipping non-selectable folder"),
                None => debug!(line = %line.text, "skipping unparseable LIST line"),
            }
        }
        Ok(folders)
    }

    pub async fn examine(&mut self, folder: &str) -> Result<(), ConnectorError> {
        self.command("EXAMINE", &format!("EXAMINE {}", quote(folder)))
            .await
            .map(|_| ())
    }

    pub async fn uid_search_all(&mut self) -> Result<Vec<u32>, ConnectorError> {
        let lines = self.command("UID SEARCH", "UID SEARCH ALL").await?;
        let mut uids: Vec<u32> = lines
            .iter()
            .filter_map(|line| strip_prefix_ignore_case(&line.text, "* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|token| token.parse().ok())
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    pub async fn uid_fetch(&mut self, uids: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>, ConnectorError> {
        if uids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let lines = self
            .command("UID FETCH", &format!("UID FETCH {set} RFC822"))
            .await?;

        let mut messages = BTreeMap::new();
        for mut line in lines {
            if !line.text.to_ascii_uppercase().contains(" FETCH ") || line.literals.is_empty() {
                continue;
            }
            let Some(uid) = UID_ITEM
                .captures(&line.text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };
            messages.insert(uid, line.literals.swap_remove(0));
        }
        Ok(messages)
    }

    pub async fn uid_fetch_one(&mut self, uid: u32) -> Result<Vec<u8>, ConnectorError> {
        self.uid_fetch(&[uid])
            .await?
            .remove(&uid)
            .ok_or_else(|| ConnectorError::Protocol(format!("no message data for UID {uid}")))
    }

    /// Best effort; the connection is dropped afterwards either way.
    pub async fn logout(&mut self) {
        if let Err(err) = self.command("LOGOUT", "LOGOUT").await {
            debug!(error = %err, "imap logout failed");
        }
    }
}

pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Size announced by a trailing `{n}`. Sizes too large for `usize` come back
/// as `usize::MAX` so the transport refuses them.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    let digits = body[open + 1..].trim_end_matches('+');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.parse().unwrap_or(usize::MAX))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Parses `* LIST (flags) "delim" name`, where the name may be quoted, an
/// atom, or a literal.
pub fn parse_list_line(line: &ResponseLine) -> Option<ListEntry> {
    let rest = strip_prefix_ignore_case(&line.text, "* LIST ")?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let close = rest.find(')')?;
    let flags = rest[..close]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let rest = rest[close + 1..].trim_start();

    let (delimiter, rest) = if let Some(after) = strip_prefix_ignore_case(rest, "NIL") {
        (None, after)
    } else {
        let (delimiter, after) = read_quoted(rest)?;
        (Some(delimiter), after)
    };
    let rest = rest.trim();

    let name = if let Some(literal) = line.literals.first() {
        String::from_utf8_lossy(literal).into_owned()
    } else if rest.starts_with('"') {
        read_quoted(rest)?.0
    } else if !rest.is_empty() {
        rest.to_string()
    } else {
        return None;
    };

    Some(ListEntry {
        flags,
        delimiter,
        name,
    })
}

fn read_quoted(input: &str) -> Option<(String, &str)> {
    let mut chars = input.strip_prefix('"')?.char_indices();
    let mut value = String::new();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => value.push(chars.next()?.1),
            '"' => return Some((value, &input[idx + 2..])),
            other => value.push(other),
        }
    }
    None
}
