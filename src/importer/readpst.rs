use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::{ArchiveDecoder, ImportError, ImportPhase, ImportSummary, ProgressFn};

const PROGRAM: &str = "readpst";

/// Extraction through the external `readpst` tool from pst-utils.
#[derive(Debug, Clone)]
pub struct ReadpstDecoder {
    program: OsString,
}

impl ReadpstDecoder {
    pub fn new() -> Self {
        Self::with_program(PROGRAM)
    }

    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolves the program against `PATH` unless it already names a file.
    pub fn locate(&self) -> Option<PathBuf> {
        let direct = Path::new(&self.program);
        if direct.components().count() > 1 {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

impl Default for ReadpstDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveDecoder for ReadpstDecoder {
    fn name(&self) -> &str {
        PROGRAM
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        progress: &ProgressFn,
    ) -> Result<ImportSummary, ImportError> {
        let program = self.locate().ok_or_else(|| ImportError::FallbackUnavailable {
            primary: String::new(),
        })?;
        debug!(program = %program.display(), "running readpst");
        progress(ImportPhase::Extracting, 0, 0);

        // -e: one .eml per message, -j 0: no parallel children
        let status = Command::new(&program)
            .arg("-e")
            .arg("-o")
            .arg(dest)
            .arg("-j")
            .arg("0")
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(ImportError::Decode(format!("readpst exited with {status}")));
        }

        let extracted = count_eml_files(dest);
        info!(extracted, "readpst finished");
        progress(ImportPhase::Extracting, extracted, extracted);
        Ok(ImportSummary {
            extracted,
            errors: 0,
        })
    }
}

pub fn count_eml_files(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
        })
        .count() as u64
}
