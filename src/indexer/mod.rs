use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{checksum_from_file_name, ArchiveError, BlobStore};
use crate::mail::parse_email;
use crate::search::{fold_case, normalize_query, page_range, snippet, SearchHit, SearchResults};

pub mod snapshot;

pub use snapshot::SNAPSHOT_FILE;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("index lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    /// Relative to the account's archive directory.
    pub path: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub size: u64,
    pub body_text: String,
}

/// Immutable index contents, newest first. Replaced wholesale on rebuild.
#[derive(Debug, Default)]
pub struct IndexTable {
    rows: Vec<IndexRow>,
    folded_subject: Vec<String>,
    folded_body: Vec<String>,
    built_at: Option<DateTime<Utc>>,
}

impl IndexTable {
    pub fn new(mut rows: Vec<IndexRow>, built_at: Option<DateTime<Utc>>) -> Self {
        rows.sort_by(|a, b| b.date.cmp(&a.date));
        let folded_subject = rows.iter().map(|row| fold_case(&row.subject)).collect();
        let folded_body = rows.iter().map(|row| fold_case(&row.body_text)).collect();
        Self {
            rows,
            folded_subject,
            folded_body,
            built_at,
        }
    }

    pub fn rows(&self) -> &[IndexRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    /// Row positions matching an already folded query, in date order. An
    /// empty query matches everything.
    pub fn matching(&self, folded_query: &str) -> Vec<usize> {
        if folded_query.is_empty() {
            return (0..self.rows.len()).collect();
        }
        (0..self.rows.len())
            .filter(|&i| {
                self.folded_subject[i].contains(folded_query)
                    || self.folded_body[i].contains(folded_query)
            })
            .collect()
    }

    pub fn hit(&self, index: usize, folded_query: &str) -> SearchHit {
        let row = &self.rows[index];
        SearchHit {
            account_id: None,
            path: row.path.clone(),
            subject: row.subject.clone(),
            from: row.from.clone(),
            to: row.to.clone(),
            date: row.date,
            size: row.size,
            snippet: snippet(
                (&row.subject, &self.folded_subject[index]),
                (&row.body_text, &self.folded_body[index]),
                folded_query,
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub indexed: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub elapsed_ms: u128,
    /// False when the new index is live but could not be persisted.
    pub snapshot_saved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_emails: usize,
    pub indexed_at: Option<DateTime<Utc>>,
    pub archive_dir: PathBuf,
    pub snapshot_path: PathBuf,
}

/// Search index over one account's part of the archive.
pub struct SearchIndex {
    store: Arc<dyn BlobStore>,
    prefix: String,
    archive_dir: PathBuf,
    snapshot_path: PathBuf,
    table: RwLock<Arc<IndexTable>>,
    build_lock: Mutex<()>,
}

impl SearchIndex {
    /// Loads the persisted snapshot if there is a usable one; otherwise the
    /// index starts empty until the next rebuild.
    pub fn open(store: Arc<dyn BlobStore>, root: &Path, prefix: &str) -> Self {
        let archive_dir = root.join(prefix);
        let snapshot_path = archive_dir.join(SNAPSHOT_FILE);
        let table = match snapshot::load(&snapshot_path) {
            Ok(Some(table)) => {
                debug!(path = %snapshot_path.display(), rows = table.len(), "loaded index snapshot");
                table
            }
            Ok(None) => IndexTable::default(),
            Err(err) => {
                warn!(path = %snapshot_path.display(), error = %err, "ignoring unreadable index snapshot");
                IndexTable::default()
            }
        };

        Self {
            store,
            prefix: prefix.to_string(),
            archive_dir,
            snapshot_path,
            table: RwLock::new(Arc::new(table)),
            build_lock: Mutex::new(()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Current contents. Queries keep using the table they started with even
    /// if a rebuild swaps in a new one meanwhile.
    pub fn table(&self) -> Arc<IndexTable> {
        match self.table.read() {
            Ok(table) => Arc::clone(&table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Walks the archive and replaces the index. One rebuild at a time per
    /// account; queries are never blocked by it.
    pub fn rebuild(&self) -> Result<BuildReport, IndexError> {
        let _building = self.build_lock.lock().map_err(|_| IndexError::Poisoned)?;
        let started = Instant::now();

        let keys = self.store.list(&self.prefix)?;
        let mut report = BuildReport::default();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();

        for key in keys.iter().filter(|key| key.to_ascii_lowercase().ends_with(".eml")) {
            if let Some(checksum) = checksum_from_file_name(key) {
                if !seen.insert(checksum.to_string()) {
                    report.duplicates += 1;
                    continue;
                }
            }

            match self.read_row(key) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    debug!(key = %key, error = %reason, "skipping unindexable message");
                    report.errors += 1;
                }
            }
        }

        report.indexed = rows.len();
        let table = Arc::new(IndexTable::new(rows, Some(Utc::now())));
        match self.table.write() {
            Ok(mut current) => *current = Arc::clone(&table),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&table),
        }

        match snapshot::save(&self.snapshot_path, &table) {
            Ok(()) => report.snapshot_saved = true,
            Err(err) => {
                warn!(path = %self.snapshot_path.display(), error = %err, "failed to persist index snapshot");
            }
        }

        report.elapsed_ms = started.elapsed().as_millis();
        info!(
            prefix = %self.prefix,
            indexed = report.indexed,
            duplicates = report.duplicates,
            errors = report.errors,
            elapsed_ms = report.elapsed_ms as u64,
            "index rebuilt"
        );
        Ok(report)
    }

    fn read_row(&self, key: &str) -> Result<IndexRow, String> {
        let raw = self.store.read(key).map_err(|err| err.to_string())?;
        let parsed = parse_email(&raw).map_err(|err| err.to_string())?;
        let date = parsed.date.or_else(|| {
            self.store
                .modified(key)
                .map(|time| DateTime::<Utc>::from(time).trunc_subsecs(0))
        });

        let path = key
            .strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
            .to_string();

        Ok(IndexRow {
            path,
            subject: parsed.subject,
            from: parsed.from,
            to: parsed.to,
            date,
            size: parsed.size,
            body_text: parsed.body_text,
        })
    }

    /// Date-ordered page of matches. `limit == 0` returns every match.
    pub fn search(&self, query: &str, offset: usize, limit: usize) -> SearchResults {
        let table = self.table();
        let folded_query = normalize_query(query);
        let matches = table.matching(&folded_query);
        let total = matches.len();
        let hits = matches[page_range(total, offset, limit)]
            .iter()
            .map(|&row| table.hit(row, &folded_query))
            .collect();

        SearchResults {
            query: query.to_string(),
            total,
            offset,
            limit,
            hits,
            indexed_at: table.built_at(),
        }
    }

    pub fn stats(&self) -> IndexStats {
        let table = self.table();
        IndexStats {
            total_emails: table.len(),
            indexed_at: table.built_at(),
            archive_dir: self.archive_dir.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }
}

/// Lazily opened indexes, one per account archive prefix.
pub struct IndexCatalog {
    store: Arc<dyn BlobStore>,
    root: PathBuf,
    indexes: RwLock<HashMap<String, Arc<SearchIndex>>>,
}

impl IndexCatalog {
    pub fn new(store: Arc<dyn BlobStore>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, prefix: &str) -> Arc<SearchIndex> {
        if let Some(index) = self
            .indexes
            .read()
            .ok()
            .and_then(|indexes| indexes.get(prefix).cloned())
        {
            return index;
        }

        let opened = Arc::new(SearchIndex::open(Arc::clone(&self.store), &self.root, prefix));
        match self.indexes.write() {
            Ok(mut indexes) => Arc::clone(indexes.entry(prefix.to_string()).or_insert(opened)),
            Err(_) => opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{IndexCatalog, SearchIndex};
    use crate::archive::{BlobStore, FsBlobStore};

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("mailarc-indexer-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }

    fn eml(subject: &str, date: &str, body: &str) -> Vec<u8> {
        format!(
            "From: Alice <alice@example.com>\r\nTo: bob@example.com\r\nSubject: {subject}\r\nDate: {date}\r\n\r\n{body}\r\n"
        )
        .into_bytes()
    }

    fn seed(store: &FsBlobStore) {
        let files = [
            (
                "u/example.com/me/inbox/1111111111111111-1.eml",
                eml("Meeting Tomorrow", "Mon, 4 Mar 2024 09:00:00 +0000", "See you there."),
            ),
            (
                "u/example.com/me/inbox/2222222222222222-2.eml",
                eml("Re: Meeting Tomorrow", "Tue, 5 Mar 2024 09:00:00 +0000", "Sounds good."),
            ),
            (
                "u/example.com/me/archive/3333333333333333-7.eml",
                eml(
                    "Invoice #1234",
                    "Wed, 6 Mar 2024 09:00:00 +0000",
                    "Payment for the trampoline is due.",
                ),
            ),
            (
                "u/example.com/me/gmail/allmail/1111111111111111-40.eml",
                eml("Meeting Tomorrow", "Mon, 4 Mar 2024 09:00:00 +0000", "See you there."),
            ),
            ("u/example.com/me/inbox/notes.txt", b"not mail".to_vec()),
        ];
        for (key, bytes) in files {
            store.write(key, &bytes).expect("seed write");
        }
    }

    #[test]
    fn rebuild_dedups_by_checksum_and_orders_by_date() {
        let root = temp_root();
        let store = FsBlobStore::new(&root);
        seed(&store);
        let index = SearchIndex::open(Arc::new(store), &root, "u/example.com/me");

        let report = index.rebuild().expect("rebuild");
        assert_eq!(report.indexed, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.errors, 0);
        assert!(report.snapshot_saved);

        let all = index.search("", 0, 0);
        assert_eq!(all.total, 3);
        assert_eq!(all.hits[0].subject, "Invoice #1234");
        assert_eq!(all.hits[2].subject, "Meeting Tomorrow");
        assert!(all.hits.iter().all(|hit| hit.snippet.is_none()));
        assert_eq!(all.hits[0].path, "archive/3333333333333333-7.eml");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn queries_match_subject_or_body_case_insensitively() {
        let root = temp_root();
        let store = FsBlobStore::new(&root);
        seed(&store);
        let index = SearchIndex::open(Arc::new(store), &root, "u/example.com/me");
        index.rebuild().expect("rebuild");

        assert_eq!(index.search("meeting", 0, 0).total, 2);

        let trampoline = index.search("TRAMPOLINE", 0, 0);
        assert_eq!(trampoline.total, 1);
        assert!(trampoline.hits[0]
            .snippet
            .as_deref()
            .is_some_and(|s| s.contains("trampoline")));

        let first = index.search("", 0, 1);
        let second = index.search("", 1, 1);
        assert_eq!(first.total, 3);
        assert_eq!(second.total, 3);
        assert_ne!(first.hits[0].path, second.hits[0].path);

        let past_end = index.search("meeting", 10, 5);
        assert_eq!(past_end.total, 2);
        assert!(past_end.hits.is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn pages_add_up_to_total_for_any_limit() {
        let root = temp_root();
        let store = FsBlobStore::new(&root);
        seed(&store);
        let index = SearchIndex::open(Arc::new(store), &root, "u/example.com/me");
        index.rebuild().expect("rebuild");

        for limit in 1..=4 {
            let mut offset = 0;
            let mut seen = 0;
            loop {
                let page = index.search("", offset, limit);
                assert_eq!(page.total, 3);
                if page.hits.is_empty() {
                    break;
                }
                seen += page.hits.len();
                offset += limit;
            }
            assert_eq!(seen, 3);
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn catalog_reopens_from_snapshot_without_walking() {
        let root = temp_root();
        let store = FsBlobStore::new(&root);
        seed(&store);
        let store: Arc<dyn BlobStore> = Arc::new(store);

        let index = SearchIndex::open(Arc::clone(&store), &root, "u/example.com/me");
        index.rebuild().expect("rebuild");
        let before = index.stats();

        std::fs::remove_dir_all(root.join("u/example.com/me/inbox")).expect("remove inbox");

        let catalog = IndexCatalog::new(store, &root);
        let reopened = catalog.get("u/example.com/me");
        assert!(Arc::ptr_eq(&reopened, &catalog.get("u/example.com/me")));
        let after = reopened.stats();
        assert_eq!(after.total_emails, before.total_emails);
        assert_eq!(after.indexed_at, before.indexed_at);
        assert_eq!(reopened.search("", 0, 0).total, 3);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unreadable_snapshot_starts_empty() {
        let root = temp_root();
        std::fs::create_dir_all(root.join("u/d/l")).expect("dirs");
        std::fs::write(root.join("u/d/l/index.json.gz"), b"junk").expect("junk");

        let index = SearchIndex::open(Arc::new(FsBlobStore::new(&root)), &root, "u/d/l");
        assert_eq!(index.stats().total_emails, 0);
        assert_eq!(index.search("", 0, 0).total, 0);

        let _ = std::fs::remove_dir_all(root);
    }
}
