//! Per-block completion bitmap and its sidecar file.
//!
//! # Sidecar format
//!
//! ```text
//! [4 bytes: "CDNP"]
//! [1 byte: version = 1]
//! [4 bytes BE: block count]
//! [4 bytes BE: CRC-32 of payload]
//! [ceil(count / 8) bytes: payload, bit i = block i, LSB first]
//! ```
//!
//! Anything that does not decode exactly is treated as "no sidecar".

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Sidecar magic bytes.
pub const SIDECAR_MAGIC: &[u8; 4] = b"CDNP";

/// Current sidecar format version.
pub const SIDECAR_VERSION: u8 = 1;

/// Suffix appended to the destination path.
pub const SIDECAR_SUFFIX: &str = ".cdndrive";

const HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// One flag per block: `true` once the block is verified and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressBitmap {
    done: Vec<bool>,
}

impl ProgressBitmap {
    /// All-pending bitmap for `block_count` blocks.
    pub fn new(block_count: usize) -> Self {
        Self {
            done: vec![false; block_count],
        }
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.done.get(index).copied().unwrap_or(false)
    }

    /// Marks `index` complete. Returns `false` if it already was.
    pub fn mark(&mut self, index: usize) -> bool {
        match self.done.get_mut(index) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    pub fn completed(&self) -> usize {
        self.done.iter().filter(|d| **d).count()
    }

    pub fn is_complete(&self) -> bool {
        self.done.iter().all(|d| *d)
    }

    /// Indices still to transfer, ascending.
    pub fn pending(&self) -> Vec<usize> {
        self.done
            .iter()
            .enumerate()
            .filter_map(|(i, d)| (!d).then_some(i))
            .collect()
    }

    /// Serializes to the sidecar format.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = vec![0u8; self.done.len().div_ceil(8)];
        for (i, _) in self.done.iter().enumerate().filter(|(_, d)| **d) {
            payload[i / 8] |= 1 << (i % 8);
        }

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(SIDECAR_MAGIC);
        out.push(SIDECAR_VERSION);
        out.extend_from_slice(&(self.done.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Parses a sidecar, requiring exactly `block_count` entries.
    pub fn decode(data: &[u8], block_count: usize) -> Option<Self> {
        if data.len() < HEADER_LEN || &data[..4] != SIDECAR_MAGIC {
            return None;
        }
        if data[4] != SIDECAR_VERSION {
            return None;
        }
        let count = u32::from_be_bytes(data[5..9].try_into().ok()?) as usize;
        if count != block_count {
            return None;
        }
        let crc = u32::from_be_bytes(data[9..13].try_into().ok()?);
        let payload = &data[HEADER_LEN..];
        if payload.len() != count.div_ceil(8) || crc32fast::hash(payload) != crc {
            return None;
        }

        let done = (0..count)
            .map(|i| payload[i / 8] & (1 << (i % 8)) != 0)
            .collect();
        Some(Self { done })
    }
}

/// Sidecar path for a destination file: `<destination>.cdndrive`.
pub fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Loads a sidecar. Returns `None` when absent or unreadable.
pub fn load(path: &Path, block_count: usize) -> Option<ProgressBitmap> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read progress sidecar");
            return None;
        }
    };
    let bitmap = ProgressBitmap::decode(&data, block_count);
    if bitmap.is_none() {
        warn!(path = %path.display(), "progress sidecar is corrupt or belongs to another file");
    }
    bitmap
}

/// Overwrites the sidecar with `bitmap`.
pub fn save(path: &Path, bitmap: &ProgressBitmap) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bitmap.encode())?;
    std::fs::rename(&tmp, path)
}

/// Removes the sidecar; a missing file is not an error.
pub fn delete(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed progress sidecar");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Formats a byte count the way progress lines show it (`1.50 MiB`).
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
