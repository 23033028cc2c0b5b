#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

pub const PASSWORD: &str = "s3cret";

pub fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("mailarc-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

pub fn message(subject: &str, date: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\nTo: bob@example.com\r\nSubject: {subject}\r\nDate: {date}\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

pub fn meeting() -> Vec<u8> {
    message(
        "Team Meeting",
        "Fri, 1 Mar 2024 09:00:00 +0000",
        "Agenda attached.",
    )
}

pub fn trampoline() -> Vec<u8> {
    message(
        "Weekend",
        "Sat, 2 Mar 2024 10:00:00 +0000",
        "We finally bought a Trampoline for the garden.",
    )
}

pub fn invoice() -> Vec<u8> {
    message(
        "Invoice 42",
        "Sun, 3 Mar 2024 11:00:00 +0000",
        "Amount due: 120 EUR.",
    )
}

pub fn imap_account(id: &str, email: &str, port: u16) -> Value {
    json!({
        "id": id,
        "protocol": "imap",
        "email": email,
        "host": "127.0.0.1",
        "port": port,
        "password": PASSWORD,
        "ssl": false,
    })
}

pub fn pop3_account(id: &str, email: &str, port: u16) -> Value {
    json!({
        "id": id,
        "protocol": "pop3",
        "email": email,
        "host": "127.0.0.1",
        "port": port,
        "password": PASSWORD,
        "ssl": false,
    })
}

pub fn write_accounts(root: &Path, user: &str, accounts: &[Value]) {
    let dir = root.join(user);
    std::fs::create_dir_all(&dir).expect("create user dir");
    std::fs::write(
        dir.join("accounts.json"),
        serde_json::to_vec_pretty(&json!({ "accounts": accounts })).expect("serialize accounts"),
    )
    .expect("write accounts");
}

pub fn eml_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(eml_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "eml") {
            found.push(path);
        }
    }
    found.sort();
    found
}

/// Commands the fake servers received, upper-cased, tags stripped.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

pub fn logged(commands: &CommandLog) -> Vec<String> {
    commands.lock().expect("command log").clone()
}

/// Mailbox served by [`spawn_imap`]: folder name to uid-keyed messages.
pub type Mailbox = BTreeMap<String, BTreeMap<u32, Vec<u8>>>;

pub async fn spawn_imap(mailbox: Mailbox) -> (u16, CommandLog) {
    serve_imap_on_port(mailbox, None).await
}

/// Like [`spawn_imap`], but every fetched literal announces `size` instead of
/// its real length.
pub async fn spawn_imap_announcing(mailbox: Mailbox, size: &'static str) -> (u16, CommandLog) {
    serve_imap_on_port(mailbox, Some(size)).await
}

async fn serve_imap_on_port(mailbox: Mailbox, announced: Option<&'static str>) -> (u16, CommandLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind imap");
    let port = listener.local_addr().expect("imap addr").port();
    let commands = CommandLog::default();
    let log = Arc::clone(&commands);
    let mailbox = Arc::new(mailbox);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_imap(
                stream,
                Arc::clone(&mailbox),
                Arc::clone(&log),
                announced,
            ));
        }
    });
    (port, commands)
}

async fn serve_imap(
    stream: TcpStream,
    mailbox: Arc<Mailbox>,
    log: CommandLog,
    announced: Option<&'static str>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    if write.write_all(b"* OK fake imap ready\r\n").await.is_err() {
        return;
    }

    let mut selected: Option<String> = None;
    let mut raw = String::new();
    loop {
        raw.clear();
        match reader.read_line(&mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Some((tag, rest)) = raw.trim_end().split_once(' ') else {
            return;
        };
        let upper = rest.to_ascii_uppercase();
        log.lock().expect("command log").push(upper.clone());

        let mut out = Vec::new();
        let mut status = format!("{tag} OK done\r\n");
        if upper.starts_with("LOGIN") {
            if !rest.contains(&format!("\"{PASSWORD}\"")) {
                status = format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n");
            }
        } else if upper.starts_with("LIST") {
            for folder in mailbox.keys() {
                out.extend_from_slice(
                    format!("* LIST (\\HasNoChildren) \"/\" \"{folder}\"\r\n").as_bytes(),
                );
            }
        } else if upper.starts_with("EXAMINE") {
            let name = rest[8..].trim().trim_matches('"').to_string();
            match mailbox.get(&name) {
                Some(messages) => {
                    out.extend_from_slice(format!("* {} EXISTS\r\n", messages.len()).as_bytes());
                    selected = Some(name);
                }
                None => status = format!("{tag} NO mailbox does not exist\r\n"),
            }
        } else if upper.starts_with("UID SEARCH") {
            let uids = selected
                .as_ref()
                .and_then(|name| mailbox.get(name))
                .map(|messages| {
                    messages
                        .keys()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            out.extend_from_slice(format!("* SEARCH {uids}\r\n").as_bytes());
        } else if upper.starts_with("UID FETCH") {
            let set = rest.split_whitespace().nth(2).unwrap_or_default();
            let messages = selected.as_ref().and_then(|name| mailbox.get(name));
            for (seq, uid) in set.split(',').filter_map(|uid| uid.parse::<u32>().ok()).enumerate() {
                let Some(body) = messages.and_then(|messages| messages.get(&uid)) else {
                    continue;
                };
                let size = announced.map_or_else(|| body.len().to_string(), str::to_string);
                out.extend_from_slice(
                    format!("* {} FETCH (UID {uid} RFC822 {{{size}}}\r\n", seq + 1).as_bytes(),
                );
                out.extend_from_slice(body);
                out.extend_from_slice(b")\r\n");
            }
        } else if upper.starts_with("LOGOUT") {
            out.extend_from_slice(b"* BYE logging out\r\n");
        }
        out.extend_from_slice(status.as_bytes());
        if write.write_all(&out).await.is_err() {
            return;
        }
        if upper.starts_with("LOGOUT") {
            return;
        }
    }
}

pub async fn spawn_pop3(messages: Vec<Vec<u8>>) -> (u16, CommandLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind pop3");
    let port = listener.local_addr().expect("pop3 addr").port();
    let commands = CommandLog::default();
    let log = Arc::clone(&commands);
    let messages = Arc::new(messages);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_pop3(stream, Arc::clone(&messages), Arc::clone(&log)));
        }
    });
    (port, commands)
}

async fn serve_pop3(stream: TcpStream, messages: Arc<Vec<Vec<u8>>>, log: CommandLog) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    if write.write_all(b"+OK fake pop3 ready\r\n").await.is_err() {
        return;
    }

    let mut raw = String::new();
    loop {
        raw.clear();
        match reader.read_line(&mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = raw.trim_end();
        let upper = line.to_ascii_uppercase();
        log.lock().expect("command log").push(upper.clone());

        let mut out = Vec::new();
        if upper.starts_with("USER") {
            out.extend_from_slice(b"+OK\r\n");
        } else if upper.starts_with("PASS") {
            if line[5..] == *PASSWORD {
                out.extend_from_slice(b"+OK logged in\r\n");
            } else {
                out.extend_from_slice(b"-ERR [AUTH] invalid credentials\r\n");
            }
        } else if upper.starts_with("STAT") {
            let size: usize = messages.iter().map(Vec::len).sum();
            out.extend_from_slice(format!("+OK {} {size}\r\n", messages.len()).as_bytes());
        } else if upper.starts_with("RETR") {
            let number: usize = line[5..].trim().parse().unwrap_or(0);
            match number.checked_sub(1).and_then(|idx| messages.get(idx)) {
                Some(body) => {
                    out.extend_from_slice(format!("+OK {} octets\r\n", body.len()).as_bytes());
                    let text = String::from_utf8_lossy(body);
                    for body_line in text.split_terminator("\r\n") {
                        if body_line.starts_with('.') {
                            out.push(b'.');
                        }
                        out.extend_from_slice(body_line.as_bytes());
                        out.extend_from_slice(b"\r\n");
                    }
                    out.extend_from_slice(b".\r\n");
                }
                None => out.extend_from_slice(b"-ERR no such message\r\n"),
            }
        } else if upper.starts_with("QUIT") {
            let _ = write.write_all(b"+OK bye\r\n").await;
            return;
        } else {
            out.extend_from_slice(b"-ERR unsupported\r\n");
        }
        if write.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Accepts connections and never says anything.
pub async fn spawn_silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind silent");
    let port = listener.local_addr().expect("silent addr").port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}
