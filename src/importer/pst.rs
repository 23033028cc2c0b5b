//! Native PST/OST decoding through the `outlook-pst` crate.
//!
//! Each mail item becomes a small synthesized RFC 822 document. Contacts,
//! calendar entries, notes and tasks are skipped.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use outlook_pst::{
    ltp::prop_context::PropertyValue,
    messaging::{
        folder::{Folder, UnicodeFolder},
        message::{Message, UnicodeMessage},
        store::{Store, UnicodeStore},
    },
    ndb::node_id::NodeId,
    *,
};
use tracing::{debug, info, warn};

use super::{ArchiveDecoder, ImportError, ImportPhase, ImportSummary, ProgressFn};
use crate::archive::{FsBlobStore, MessageWriter};
use crate::checksum::checksum;
use crate::mail::html_to_text;

const MAX_FOLDER_DEPTH: usize = 64;
const MAX_FOLDER_NAME: usize = 60;
const PROGRESS_EVERY: u64 = 100;

const PROP_MESSAGE_CLASS: u16 = 0x001A;
const PROP_SUBJECT: u16 = 0x0037;
const PROP_SUBMIT_TIME: u16 = 0x0039;
const PROP_SENT_REPRESENTING_NAME: u16 = 0x0042;
const PROP_SENDER_NAME: u16 = 0x0C1A;
const PROP_SENDER_EMAIL: u16 = 0x0C1F;
const PROP_DISPLAY_TO: u16 = 0x0E04;
const PROP_DELIVERY_TIME: u16 = 0x0E06;
const PROP_BODY: u16 = 0x1000;
const PROP_BODY_HTML: u16 = 0x1013;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

const NON_MAIL_CLASSES: &[&str] = &[
    "ipm.contact",
    "ipm.distlist",
    "ipm.appointment",
    "ipm.schedule",
    "ipm.stickynote",
    "ipm.task",
    "ipm.activity",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct PstDecoder;

impl PstDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveDecoder for PstDecoder {
    fn name(&self) -> &str {
        "outlook-pst"
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &ProgressFn,
    ) -> Result<ImportSummary, ImportError> {
        let pst = UnicodePstFile::open(archive).map_err(decode("open archive"))?;
        let store = UnicodeStore::read(Rc::new(pst)).map_err(decode("read message store"))?;
        let root_id = store
            .properties()
            .ipm_sub_tree_entry_id()
            .map_err(decode("locate mail folders"))?;
        let root = UnicodeFolder::read(Rc::clone(&store), &root_id).map_err(decode("read mail root"))?;

        progress(ImportPhase::Extracting, 0, 0);
        let mut extraction = Extraction {
            store,
            writer: MessageWriter::new(Arc::new(FsBlobStore::new(dest.to_path_buf())), ""),
            progress,
            seen: HashSet::new(),
            summary: ImportSummary::default(),
        };
        extraction.walk(&root, 0)?;

        let summary = extraction.summary;
        info!(extracted = summary.extracted, errors = summary.errors, "pst extraction finished");
        progress(ImportPhase::Extracting, summary.extracted, summary.extracted);
        Ok(summary)
    }
}

fn decode<E: Display>(what: &'static str) -> impl Fn(E) -> ImportError {
    move |err| ImportError::Decode(format!("{what}: {err}"))
}

struct Extraction<'a> {
    store: Rc<UnicodeStore>,
    writer: MessageWriter,
    progress: &'a ProgressFn,
    /// Content already written during this run.
    seen: HashSet<String>,
    summary: ImportSummary,
}

impl Extraction<'_> {
    fn walk(&mut self, folder: &UnicodeFolder, depth: usize) -> Result<(), ImportError> {
        if depth > MAX_FOLDER_DEPTH {
            return Err(ImportError::Decode(format!(
                "folder tree deeper than {MAX_FOLDER_DEPTH} levels"
            )));
        }

        let name = folder.properties().display_name().unwrap_or_default();
        let dir = sanitize_folder_name(&name);

        if let Some(contents) = folder.contents_table() {
            for row in contents.rows_matrix() {
                let node = u32::from(row.id());
                match self.read_message(node) {
                    Ok(Some(message)) => self.write_message(&dir, &message),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(folder = %name, node, error = %err, "skipping unreadable item");
                        self.summary.errors += 1;
                    }
                }
            }
        }

        if let Some(hierarchy) = folder.hierarchy_table() {
            for row in hierarchy.rows_matrix() {
                let node = u32::from(row.id());
                let subfolder = self
                    .store
                    .properties()
                    .make_entry_id(NodeId::from(node))
                    .map_err(|err| err.to_string())
                    .and_then(|entry_id| {
                        UnicodeFolder::read(Rc::clone(&self.store), &entry_id)
                            .map_err(|err| err.to_string())
                    });
                match subfolder {
                    Ok(subfolder) => self.walk(&subfolder, depth + 1)?,
                    Err(err) => warn!(parent = %name, node, error = %err, "skipping unreadable folder"),
                }
            }
        }

        Ok(())
    }

    /// `Ok(None)` for items that are not mail.
    fn read_message(&self, node: u32) -> Result<Option<PstMessage>, String> {
        let entry_id = self
            .store
            .properties()
            .make_entry_id(NodeId::from(node))
            .map_err(|err| err.to_string())?;
        let message = UnicodeMessage::read(Rc::clone(&self.store), &entry_id, None)
            .map_err(|err| err.to_string())?;
        let props = message.properties();

        let class = text(props.get(PROP_MESSAGE_CLASS)).unwrap_or_default();
        if !is_mail_class(&class) {
            debug!(node, class = %class, "skipping non-mail item");
            return Ok(None);
        }

        let body = text(props.get(PROP_BODY))
            .or_else(|| text(props.get(PROP_BODY_HTML)).map(|html| html_to_text(&html)))
            .unwrap_or_default();

        Ok(Some(PstMessage {
            subject: text(props.get(PROP_SUBJECT))
                .map(|s| strip_subject_prefix(&s).to_string())
                .unwrap_or_default(),
            sender_name: text(props.get(PROP_SENDER_NAME))
                .or_else(|| text(props.get(PROP_SENT_REPRESENTING_NAME)))
                .unwrap_or_default(),
            sender_email: text(props.get(PROP_SENDER_EMAIL)).unwrap_or_default(),
            display_to: text(props.get(PROP_DISPLAY_TO)).unwrap_or_default(),
            body,
            submitted: filetime(props.get(PROP_SUBMIT_TIME)),
            delivered: filetime(props.get(PROP_DELIVERY_TIME)),
        }))
    }

    fn write_message(&mut self, dir: &str, message: &PstMessage) {
        let raw = message.to_rfc822(Utc::now());
        if !self.seen.insert(checksum(&raw)) {
            return;
        }

        match self.writer.save(dir, &self.summary.extracted.to_string(), &raw) {
            Ok(saved) if saved.created => {
                self.summary.extracted += 1;
                if self.summary.extracted % PROGRESS_EVERY == 0 {
                    (self.progress)(ImportPhase::Extracting, self.summary.extracted, 0);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(folder = %dir, error = %err, "failed to write extracted message");
                self.summary.errors += 1;
            }
        }
    }
}

fn text(value: Option<&PropertyValue>) -> Option<String> {
    match value? {
        PropertyValue::String8(s) => Some(s.to_string()),
        PropertyValue::Unicode(s) => Some(s.to_string()),
        PropertyValue::Binary(b) => String::from_utf8(b.buffer().to_vec()).ok(),
        _ => None,
    }
}

fn filetime(value: Option<&PropertyValue>) -> Option<DateTime<Utc>> {
    match value? {
        PropertyValue::Time(t) => filetime_to_utc(*t),
        _ => None,
    }
}

/// FILETIME counts 100ns ticks since 1601.
pub fn filetime_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    let secs = ticks / 10_000_000 - FILETIME_EPOCH_OFFSET;
    (secs > 0).then(|| DateTime::from_timestamp(secs, 0)).flatten()
}

/// Drops the MAPI normalized-subject marker (`\u{1}` plus a length char).
fn strip_subject_prefix(subject: &str) -> &str {
    let mut chars = subject.chars();
    if chars.next() == Some('\u{1}') {
        chars.next();
        return chars.as_str();
    }
    subject
}

pub fn is_mail_class(class: &str) -> bool {
    let class = class.trim().to_ascii_lowercase();
    !NON_MAIL_CLASSES
        .iter()
        .any(|prefix| class == *prefix || class.starts_with(&format!("{prefix}.")))
}

pub fn sanitize_folder_name(name: &str) -> String {
    let name: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .take(MAX_FOLDER_NAME)
        .collect();
    if name.trim_matches('.').is_empty() {
        return "other".to_string();
    }
    name
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PstMessage {
    pub subject: String,
    pub sender_name: String,
    pub sender_email: String,
    pub display_to: String,
    pub body: String,
    pub submitted: Option<DateTime<Utc>>,
    pub delivered: Option<DateTime<Utc>>,
}

impl PstMessage {
    pub fn date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.submitted.or(self.delivered).unwrap_or(now)
    }

    fn from_header(&self) -> String {
        match (self.sender_name.is_empty(), self.sender_email.is_empty()) {
            (false, false) => format!("{} <{}>", self.sender_name, self.sender_email),
            (true, false) => self.sender_email.clone(),
            _ => self.sender_name.clone(),
        }
    }

    pub fn to_rfc822(&self, now: DateTime<Utc>) -> Vec<u8> {
        let headers = [
            ("From", header_value(&self.from_header())),
            ("To", header_value(&self.display_to)),
            ("Subject", header_value(&self.subject)),
            ("Date", self.date(now).to_rfc2822()),
            ("MIME-Version", "1.0".to_string()),
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ("Content-Transfer-Encoding", "8bit".to_string()),
            ("X-Imported-From", "PST".to_string()),
        ];

        let mut out = String::with_capacity(self.body.len() + 512);
        for (name, value) in headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out.into_bytes()
    }
}

fn header_value(value: &str) -> String {
    value.replace('\r', "").replace('\n', " ")
}
