//! Offline archive import (PST/OST).
//!
//! The native decoder runs first. If it fails for any reason, including a
//! panic inside the format library, the `readpst` tool re-extracts into the
//! same destination.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::ArchiveError;

pub mod jobs;
pub mod pst;
pub mod readpst;
pub mod upload;

pub use jobs::{ImportJob, ImportJobs, ImportPhase, JOB_RETENTION};
pub use pst::PstDecoder;
pub use readpst::ReadpstDecoder;
pub use upload::{stream_upload, UPLOAD_CHUNK};

pub const DEFAULT_TITLE: &str = "imported.pst";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("decode archive: {0}")]
    Decode(String),

    #[error("decoder panicked: {0}")]
    Panicked(String),

    #[error("upload: {0}")]
    Upload(String),

    #[error("primary decoder failed ({primary}); readpst fallback not installed (install pst-utils)")]
    FallbackUnavailable { primary: String },

    #[error("primary decoder failed ({primary}); readpst fallback also failed: {reason}")]
    FallbackFailed { primary: String, reason: String },
}

/// Progress callback shared by upload and extraction: `(phase, current, total)`.
pub type ProgressFn = dyn Fn(ImportPhase, u64, u64) + Send + Sync;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub extracted: u64,
    pub errors: u64,
}

/// Turns an archive file into `.eml` files under `dest`.
pub trait ArchiveDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, archive: &Path, dest: &Path, progress: &ProgressFn)
        -> Result<ImportSummary, ImportError>;
}

#[derive(Clone)]
pub struct Importer {
    primary: Arc<dyn ArchiveDecoder>,
    fallback: Arc<dyn ArchiveDecoder>,
}

impl Importer {
    pub fn new() -> Self {
        Self::with_decoders(Arc::new(PstDecoder::new()), Arc::new(ReadpstDecoder::new()))
    }

    pub fn with_decoders(primary: Arc<dyn ArchiveDecoder>, fallback: Arc<dyn ArchiveDecoder>) -> Self {
        Self { primary, fallback }
    }

    /// Blocking; run it off the async executor.
    pub fn import(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &ProgressFn,
    ) -> Result<ImportSummary, ImportError> {
        std::fs::create_dir_all(dest)?;

        let primary_err = match run_guarded(self.primary.as_ref(), archive, dest, progress) {
            Ok(summary) => {
                info!(
                    decoder = self.primary.name(),
                    extracted = summary.extracted,
                    errors = summary.errors,
                    "archive imported"
                );
                return Ok(summary);
            }
            Err(err) => err,
        };

        warn!(
            decoder = self.primary.name(),
            error = %primary_err,
            fallback = self.fallback.name(),
            "primary decoder failed, trying fallback"
        );

        let primary = primary_err.to_string();
        match run_guarded(self.fallback.as_ref(), archive, dest, progress) {
            Ok(summary) => {
                info!(
                    decoder = self.fallback.name(),
                    extracted = summary.extracted,
                    "archive imported by fallback"
                );
                Ok(summary)
            }
            Err(ImportError::FallbackUnavailable { .. }) => {
                Err(ImportError::FallbackUnavailable { primary })
            }
            Err(err) => Err(ImportError::FallbackFailed {
                primary,
                reason: err.to_string(),
            }),
        }
    }
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a panic inside a decoder into an ordinary error.
fn run_guarded(
    decoder: &dyn ArchiveDecoder,
    archive: &Path,
    dest: &Path,
    progress: &ProgressFn,
) -> Result<ImportSummary, ImportError> {
    panic::catch_unwind(AssertUnwindSafe(|| decoder.extract(archive, dest, progress)))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ImportError::Panicked(message))
        })
}

/// Reduces a client-supplied file name to a safe single path component.
pub fn sanitize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    let base = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .replace("..", "");
    let base = base.trim();
    if base.is_empty() || base == "." {
        return DEFAULT_TITLE.to_string();
    }
    base.to_string()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{
        sanitize_title, ArchiveDecoder, ImportError, ImportSummary, Importer, ProgressFn,
        ReadpstDecoder,
    };

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("mailarc-importer-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }

    /// Writes one file, then panics.
    struct PanickingDecoder;

    impl ArchiveDecoder for PanickingDecoder {
        fn name(&self) -> &str {
            "panicking"
        }

        fn extract(&self, _: &Path, dest: &Path, _: &ProgressFn) -> Result<ImportSummary, ImportError> {
            std::fs::write(dest.join("0000000000000000-0.eml"), b"Subject: partial\r\n\r\n")
                .expect("partial write");
            panic!("btree node out of range");
        }
    }

    struct CountingDecoder {
        calls: AtomicUsize,
        result: fn() -> Result<ImportSummary, ImportError>,
    }

    impl ArchiveDecoder for CountingDecoder {
        fn name(&self) -> &str {
            "counting"
        }

        fn extract(&self, _: &Path, _: &Path, _: &ProgressFn) -> Result<ImportSummary, ImportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    #[test]
    fn panicking_primary_without_fallback_reports_unavailable() {
        let root = temp_root();
        let dest = root.join("out");
        let importer = Importer::with_decoders(
            Arc::new(PanickingDecoder),
            Arc::new(ReadpstDecoder::with_program("mailarc-no-such-readpst")),
        );

        let err = importer
            .import(&root.join("missing.pst"), &dest, &|_, _, _| {})
            .expect_err("import must fail");

        assert!(matches!(err, ImportError::FallbackUnavailable { .. }));
        let message = err.to_string();
        assert!(message.contains("not installed"));
        assert!(message.contains("btree node out of range"));
        assert!(dest.join("0000000000000000-0.eml").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn successful_primary_skips_fallback() {
        let root = temp_root();
        let fallback = Arc::new(CountingDecoder {
            calls: AtomicUsize::new(0),
            result: || Ok(ImportSummary::default()),
        });
        let importer = Importer::with_decoders(
            Arc::new(CountingDecoder {
                calls: AtomicUsize::new(0),
                result: || Ok(ImportSummary { extracted: 4, errors: 1 }),
            }),
            fallback.clone(),
        );

        let summary = importer
            .import(&root.join("a.pst"), &root.join("out"), &|_, _, _| {})
            .expect("import");
        assert_eq!(summary, ImportSummary { extracted: 4, errors: 1 });
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn failing_fallback_is_distinguished_from_missing_one() {
        let root = temp_root();
        let importer = Importer::with_decoders(
            Arc::new(CountingDecoder {
                calls: AtomicUsize::new(0),
                result: || Err(ImportError::Decode("bad header".to_string())),
            }),
            Arc::new(CountingDecoder {
                calls: AtomicUsize::new(0),
                result: || Err(ImportError::Decode("exit status 1".to_string())),
            }),
        );

        let err = importer
            .import(&root.join("a.pst"), &root.join("out"), &|_, _, _| {})
            .expect_err("both fail");
        match err {
            ImportError::FallbackFailed { primary, reason } => {
                assert!(primary.contains("bad header"));
                assert!(reason.contains("exit status 1"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn titles_are_reduced_to_a_base_name() {
        assert_eq!(sanitize_title("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_title(r"C:\mail\Outlook.pst"), "Outlook.pst");
        assert_eq!(sanitize_title("a..b.pst"), "ab.pst");
        assert_eq!(sanitize_title(".."), "imported.pst");
        assert_eq!(sanitize_title("  "), "imported.pst");
    }
}
