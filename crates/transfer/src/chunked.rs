use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::progress::{self, ProgressBitmap};
use crate::{HEAD_CHECKSUM_LEN, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-1 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Computes SHA-1 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    Ok(calculate_upload_checksums(path)?.sha1)
}

/// Whole-file and leading-bytes checksums of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksums {
    /// SHA-1 hex of the whole file.
    pub sha1: String,
    /// SHA-1 hex of the first [`HEAD_CHECKSUM_LEN`] bytes.
    ///
    /// Reserved as a lookup key for resumable upload history.
    pub head_sha1: String,
}

/// Streams `path` once, producing both checksums.
pub fn calculate_upload_checksums(path: &Path) -> Result<FileChecksums, TransferError> {
    let mut file = File::open(path)?;
    let mut whole = Sha1::new();
    let mut head = Sha1::new();
    let mut head_remaining = HEAD_CHECKSUM_LEN;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);
        let head_part = n.min(head_remaining);
        if head_part > 0 {
            head.update(&buf[..head_part]);
            head_remaining -= head_part;
        }
    }
    Ok(FileChecksums {
        sha1: hex::encode(whole.finalize()),
        head_sha1: hex::encode(head.finalize()),
    })
}

// ---------------------------------------------------------------------------
// SourceFile
// ---------------------------------------------------------------------------

/// Read side of an upload: one shared handle, serialized by a lock.
pub struct SourceFile {
    path: PathBuf,
    size: u64,
    file: Mutex<File>,
}

impl SourceFile {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            size,
            file: Mutex::new(file),
        })
    }

    /// Reads exactly `size` bytes at `offset`.
    pub fn read_block(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let mut buf = vec![0u8; size as usize];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

// ---------------------------------------------------------------------------
// DestinationFile
// ---------------------------------------------------------------------------

/// Write side of a download.
///
/// The file handle and the completion bitmap live behind one lock, so a
/// block write, its bitmap flag and the sidecar update form a single
/// critical section. Workers never see the raw handle.
pub struct DestinationFile {
    path: PathBuf,
    sidecar: PathBuf,
    inner: Mutex<DestinationInner>,
}

struct DestinationInner {
    file: File,
    progress: ProgressBitmap,
}

impl DestinationFile {
    /// Opens (or creates) `path` for writing without truncating it.
    pub fn open(path: &Path, progress: ProgressBitmap) -> Result<Self, TransferError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            sidecar: progress::sidecar_path(path),
            inner: Mutex::new(DestinationInner { file, progress }),
        })
    }

    /// Writes `data` at `offset`.
    #[cfg(test)]
    pub(crate) fn write_block(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        write_at(&mut inner.file, offset, data)
    }

    /// Reads `size` bytes at `offset`.
    #[cfg(test)]
    pub(crate) fn read_block(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let mut buf = vec![0u8; size as usize];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes a verified block, marks it done and persists the bitmap.
    ///
    /// Nothing is written once `cancel` has fired. Returns `false` if the
    /// block was already marked.
    pub fn commit_block(
        &self,
        index: usize,
        offset: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if inner.progress.is_done(index) {
            return Ok(false);
        }

        write_at(&mut inner.file, offset, data)?;
        inner.progress.mark(index);
        if let Err(e) = progress::save(&self.sidecar, &inner.progress) {
            warn!(path = %self.sidecar.display(), error = %e, "failed to persist download progress");
        }
        Ok(true)
    }

    /// Snapshot of the completion bitmap.
    #[cfg(test)]
    pub(crate) fn progress(&self) -> ProgressBitmap {
        self.inner.lock().unwrap().progress.clone()
    }

    /// Flushes the file and removes the sidecar.
    pub fn finish(&self) -> Result<(), TransferError> {
        let inner = self.inner.lock().unwrap();
        inner.file.sync_all()?;
        progress::delete(&self.sidecar)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar
    }
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}
