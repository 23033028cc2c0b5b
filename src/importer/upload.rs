use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::{ImportError, ImportPhase, ProgressFn};

pub const UPLOAD_CHUNK: usize = 256 * 1024;
const MIB: u64 = 1024 * 1024;

/// Copies an upload into a temporary file, reporting progress in MiB when
/// the expected size is known. The file is deleted when the returned path
/// is dropped, and on any error.
pub async fn stream_upload<R>(
    mut reader: R,
    expected_size: u64,
    progress: &ProgressFn,
) -> Result<TempPath, ImportError>
where
    R: AsyncRead + Unpin,
{
    let (file, path) = tempfile::Builder::new()
        .prefix("mailarc-upload-")
        .suffix(".pst")
        .tempfile()?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut buf = vec![0u8; UPLOAD_CHUNK];
    let mut written: u64 = 0;
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .map_err(|err| ImportError::Upload(format!("read upload: {err}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])
            .await
            .map_err(|err| ImportError::Upload(format!("write temp file: {err}")))?;
        written += read as u64;
        if expected_size > 0 {
            progress(ImportPhase::Uploading, written / MIB, expected_size / MIB);
        }
    }

    file.flush()
        .await
        .map_err(|err| ImportError::Upload(format!("flush temp file: {err}")))?;
    file.sync_all()
        .await
        .map_err(|err| ImportError::Upload(format!("sync temp file: {err}")))?;

    Ok(path)
}
