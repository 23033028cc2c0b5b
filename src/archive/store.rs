use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::ArchiveError;

/// Byte-level storage behind the archive tree. Keys are opaque relative paths
/// with forward slashes.
pub trait BlobStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>, ArchiveError>;

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), ArchiveError>;

    /// Every key under `prefix`, in a stable walk order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError>;

    fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        Ok(self.read(key).is_ok())
    }

    fn modified(&self, _key: &str) -> Option<SystemTime> {
        None
    }

    /// Best effort; stores without mutable timestamps may ignore it.
    fn set_modified(&self, _key: &str, _time: SystemTime) -> Result<(), ArchiveError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|segment| !segment.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => path.push(part),
                _ => return Err(ArchiveError::InvalidKey(key.to_string())),
            }
        }
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl BlobStore for FsBlobStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
        Ok(fs::read(self.path_for(key)?)?)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ArchiveError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ArchiveError::InvalidKey(key.to_string()))?;
        let staging = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&staging, &path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        Ok(result?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let base = self.path_for(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'));
            if hidden {
                continue;
            }
            if let Some(key) = self.key_for(entry.path()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn modified(&self, key: &str) -> Option<SystemTime> {
        let path = self.path_for(key).ok()?;
        fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }

    fn set_modified(&self, key: &str, time: SystemTime) -> Result<(), ArchiveError> {
        let file = File::options().write(true).open(self.path_for(key)?)?;
        file.set_modified(time)?;
        Ok(())
    }
}
