//! Account configuration and where things live on disk.
//!
//! Accounts are read from `{root}/{user}/accounts.json`, a file owned by the
//! user. Accounts created by PST imports are registered separately in
//! `{root}/{user}/imports.json` so that file is never rewritten by us.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::archive;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid account file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    DuplicateAccount(String),

    #[error("{0}")]
    Invalid(String),
}

pub const ACCOUNTS_FILE: &str = "accounts.json";
pub const IMPORTS_FILE: &str = "imports.json";

pub fn default_root() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir()
        .ok_or_else(|| ConfigError::Invalid("failed to determine home directory".to_string()))?;
    Ok(home.join(".mailarc").join("users"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Pop3,
    Pst,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imap => write!(f, "imap"),
            Self::Pop3 => write!(f, "pop3"),
            Self::Pst => write!(f, "pst"),
        }
    }
}

/// Which remote folders an IMAP sync walks. Serialized as `"all"` or a list;
/// a comma-separated string is also accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FolderSelection {
    #[default]
    All,
    Named(Vec<String>),
}

impl FolderSelection {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Self::All;
        }
        Self::from_names(trimmed.split(','))
    }

    fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let names: Vec<String> = names
            .into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Named(names)
        }
    }
}

impl Serialize for FolderSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Named(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FolderSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            List(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self::parse(&text),
            Raw::List(names) => Self::from_names(names.iter().map(String::as_str)),
        })
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    pub id: String,
    pub protocol: Protocol,
    pub email: String,
    #[serde(default)]
    pub host: String,
    /// 0 selects the protocol default for the `ssl` setting.
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default)]
    pub folders: FolderSelection,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("email", &self.email)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .field("folders", &self.folders)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl AccountConfig {
    pub fn login_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }

    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match (self.protocol, self.ssl) {
            (Protocol::Imap, true) => 993,
            (Protocol::Imap, false) => 143,
            (Protocol::Pop3, true) => 995,
            (Protocol::Pop3, false) => 110,
            (Protocol::Pst, _) => 0,
        }
    }

    pub fn archive_prefix(&self, user: &str) -> String {
        archive::account_prefix(user, &self.email)
    }
}

/// Supplies account configuration for a user.
pub trait AccountSource: Send + Sync {
    fn list(&self, user: &str) -> Result<Vec<AccountConfig>, ConfigError>;

    fn get(&self, user: &str, account_id: &str) -> Result<AccountConfig, ConfigError> {
        self.list(user)?
            .into_iter()
            .find(|account| account.id == account_id)
            .ok_or_else(|| ConfigError::AccountNotFound(account_id.to_string()))
    }

    /// Records an account this crate created itself (PST imports).
    fn register(&self, user: &str, account: AccountConfig) -> Result<(), ConfigError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone)]
pub struct JsonAccountStore {
    root: PathBuf,
}

impl JsonAccountStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn user_dir(&self, user: &str) -> Result<PathBuf, ConfigError> {
        if user.is_empty() || user.contains(['/', '\\']) || user == "." || user == ".." {
            return Err(ConfigError::Invalid(format!("invalid user id '{user}'")));
        }
        Ok(self.root.join(user))
    }

    fn load(path: &Path) -> Result<AccountsFile, ConfigError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AccountsFile::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl AccountSource for JsonAccountStore {
    fn list(&self, user: &str) -> Result<Vec<AccountConfig>, ConfigError> {
        let dir = self.user_dir(user)?;
        let mut accounts = Self::load(&dir.join(ACCOUNTS_FILE))?.accounts;
        accounts.extend(Self::load(&dir.join(IMPORTS_FILE))?.accounts);
        Ok(accounts)
    }

    fn register(&self, user: &str, account: AccountConfig) -> Result<(), ConfigError> {
        if self.list(user)?.iter().any(|existing| existing.id == account.id) {
            return Err(ConfigError::DuplicateAccount(account.id));
        }

        let dir = self.user_dir(user)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(IMPORTS_FILE);
        let mut file = Self::load(&path)?;
        file.accounts.push(account);

        let json = serde_json::to_vec_pretty(&file).map_err(|source| ConfigError::Json {
            path: path.clone(),
            source,
        })?;
        let staging = dir.join(format!(".{IMPORTS_FILE}.tmp"));
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }
}
