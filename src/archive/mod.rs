//! Archive layout shared by the protocol clients, the PST importer and the
//! search index.
//!
//! Keys are forward-slash relative paths:
//! `{user}/{domain}/{local-part}/{folder-slug}/{checksum}-{remote-id}.eml`.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub mod store;
pub mod writer;

pub use store::{BlobStore, FsBlobStore};
pub use writer::{MessageWriter, SavedMessage};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk archive: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("invalid archive key '{0}'")]
    InvalidKey(String),

    #[error("refusing to store an empty message")]
    EmptyMessage,
}

pub const UNKNOWN_DOMAIN: &str = "unknown";
pub const MAX_SLUG_LEN: usize = 40;

static SLUG_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\s.\-]").expect("compile slug filter regex"));
static SLUG_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.\s_\-]+").expect("compile slug separator regex"));
static CHECKSUM_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{16})-").expect("compile checksum prefix regex"));

const WELL_KNOWN_FOLDERS: &[(&str, &str)] = &[
    ("inbox", "inbox"),
    ("[gmail]/sent mail", "gmail/sent"),
    ("[gmail]/sent", "gmail/sent"),
    ("[gmail]/gesendet", "gmail/sent"),
    ("[google mail]/sent mail", "gmail/sent"),
    ("[gmail]/drafts", "gmail/draft"),
    ("[gmail]/draft", "gmail/draft"),
    ("[gmail]/entwürfe", "gmail/draft"),
    ("[google mail]/drafts", "gmail/draft"),
    ("[gmail]/trash", "gmail/trash"),
    ("[gmail]/papierkorb", "gmail/trash"),
    ("[google mail]/trash", "gmail/trash"),
    ("[gmail]/spam", "gmail/spam"),
    ("[google mail]/spam", "gmail/spam"),
    ("[gmail]/all mail", "gmail/allmail"),
    ("[gmail]/alle nachrichten", "gmail/allmail"),
    ("[google mail]/all mail", "gmail/allmail"),
    ("[gmail]/marked", "gmail/marked"),
    ("[gmail]/markiert", "gmail/marked"),
    ("[gmail]/important", "gmail/important"),
    ("[gmail]/wichtig", "gmail/important"),
];

/// Splits an address into `(domain, local-part)`, both lower-cased.
pub fn split_email(email: &str) -> (String, String) {
    let email = email.trim().to_lowercase();
    match email.rsplit_once('@') {
        Some((local, domain)) if !domain.is_empty() && !local.is_empty() => {
            (domain.to_string(), local.to_string())
        }
        _ => (UNKNOWN_DOMAIN.to_string(), email),
    }
}

/// Archive prefix owned by one account: `{user}/{domain}/{local}`.
pub fn account_prefix(user: &str, email: &str) -> String {
    let (domain, local) = split_email(email);
    join_key(&[user, &domain, &local])
}

pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps a remote folder name to its storage slug. Case is only folded for the
/// lookup; callers keep the original name for protocol commands.
pub fn folder_slug(folder_name: &str) -> String {
    let key = folder_name.trim().to_lowercase();
    if let Some((_, mapped)) = WELL_KNOWN_FOLDERS.iter().find(|(name, _)| *name == key) {
        return (*mapped).to_string();
    }

    let normalized = folder_name.replace('\\', "/");
    let mut slugs: Vec<String> = normalized
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(slugify_part)
        .collect();

    match slugs.first_mut() {
        None => "other".to_string(),
        Some(first) => {
            if first == "gmail" || first == "google_mail" {
                *first = "gmail".to_string();
            }
            slugs.join("/")
        }
    }
}

fn slugify_part(name: &str) -> String {
    let name = name.replace(['[', ']'], "").trim().to_lowercase();
    let name = SLUG_UNSAFE.replace_all(&name, "");
    let name = SLUG_SEPARATORS.replace_all(&name, "_");
    let name = name.trim_matches('_');
    if name.is_empty() {
        return "other".to_string();
    }
    name.chars().take(MAX_SLUG_LEN).collect()
}

pub fn message_file_name(checksum: &str, remote_id: &str, extension: &str) -> String {
    format!("{checksum}-{remote_id}.{extension}")
}

/// Extracts the checksum prefix from a file name (or key). Files written by
/// other tools carry no checksum and yield `None`.
pub fn checksum_from_file_name(name: &str) -> Option<&str> {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    CHECKSUM_PREFIX
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
