//! Compressed columnar snapshot of one account's index.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{IndexError, IndexRow, IndexTable};

pub const SNAPSHOT_FILE: &str = "index.json.gz";
const SNAPSHOT_VERSION: u32 = 1;

/// One vector per column; all of equal length.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Columns {
    version: u32,
    built_at: Option<DateTime<Utc>>,
    path: Vec<String>,
    subject: Vec<String>,
    from: Vec<String>,
    to: Vec<String>,
    /// Unix milliseconds.
    date: Vec<Option<i64>>,
    size: Vec<u64>,
    body_text: Vec<String>,
}

impl Columns {
    fn from_table(table: &IndexTable) -> Self {
        let rows = table.rows();
        let mut columns = Self {
            version: SNAPSHOT_VERSION,
            built_at: table.built_at(),
            ..Self::default()
        };
        for row in rows {
            columns.path.push(row.path.clone());
            columns.subject.push(row.subject.clone());
            columns.from.push(row.from.clone());
            columns.to.push(row.to.clone());
            columns.date.push(row.date.map(|date| date.timestamp_millis()));
            columns.size.push(row.size);
            columns.body_text.push(row.body_text.clone());
        }
        columns
    }

    fn into_table(self) -> Result<IndexTable, IndexError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(IndexError::Snapshot(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        let len = self.path.len();
        let lengths = [
            self.subject.len(),
            self.from.len(),
            self.to.len(),
            self.date.len(),
            self.size.len(),
            self.body_text.len(),
        ];
        if lengths.iter().any(|column| *column != len) {
            return Err(IndexError::Snapshot("column lengths differ".to_string()));
        }

        let rows = self
            .path
            .into_iter()
            .zip(self.subject)
            .zip(self.from)
            .zip(self.to)
            .zip(self.date)
            .zip(self.size)
            .zip(self.body_text)
            .map(|((((((path, subject), from), to), date), size), body_text)| IndexRow {
                path,
                subject,
                from,
                to,
                date: date.and_then(DateTime::<Utc>::from_timestamp_millis),
                size,
                body_text,
            })
            .collect();
        Ok(IndexTable::new(rows, self.built_at))
    }
}

/// Writes next to `path` first and renames over it, so a reader sees either
/// the previous snapshot or the new one.
pub fn save(path: &Path, table: &IndexTable) -> Result<(), IndexError> {
    let dir = path
        .parent()
        .ok_or_else(|| IndexError::Snapshot(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let staging = dir.join(format!(".{SNAPSHOT_FILE}.{}.tmp", Uuid::new_v4()));

    let result = (|| -> Result<(), IndexError> {
        let file = File::create(&staging)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &Columns::from_table(table))?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        std::fs::rename(&staging, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    result
}

/// `Ok(None)` when no snapshot has been written yet.
pub fn load(path: &Path) -> Result<Option<IndexTable>, IndexError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let columns: Columns = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?;
    columns.into_table().map(Some)
}
