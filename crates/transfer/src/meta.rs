//! Block model and the meta object wire format.
//!
//! A file is described by a [`FileDescriptor`] whose blocks tile
//! `[0, size)` in order. On the wire only per-block size, checksum and
//! locator are stored; index and offset are positional and recomputed by
//! [`FileDescriptor::from_json`].

use serde::{Deserialize, Serialize};

use crate::TransferError;

/// One contiguous chunk of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Position in the block sequence.
    pub index: usize,
    /// Byte offset in the file.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
    /// SHA-1 hex of the raw block bytes (empty until computed).
    pub sha1: String,
    /// Backend locator of the encoded block (empty until uploaded).
    pub url: String,
}

impl BlockDescriptor {
    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// The authoritative record of one logical file, as seen by one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub size: u64,
    /// SHA-1 hex of the whole file.
    pub sha1: String,
    /// Unix seconds.
    pub created_at: i64,
    pub blocks: Vec<BlockDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMeta {
    file_name: String,
    size: u64,
    sha1: String,
    time: i64,
    block_dicts: Vec<WireBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBlock {
    size: u64,
    sha1: String,
    url: String,
}

/// Number of blocks needed to cover `size` bytes.
pub fn block_count(size: u64, block_size: u64) -> usize {
    assert!(block_size > 0, "block size must be positive");
    size.div_ceil(block_size) as usize
}

/// Splits `size` bytes into consecutive blocks of `block_size`.
///
/// Every block has `block_size` bytes except the last, which holds the
/// remainder. Checksums and locators are left empty.
pub fn plan_blocks(size: u64, block_size: u64) -> Vec<BlockDescriptor> {
    let count = block_count(size, block_size);
    (0..count)
        .map(|index| {
            let offset = index as u64 * block_size;
            BlockDescriptor {
                index,
                offset,
                size: block_size.min(size - offset),
                ..Default::default()
            }
        })
        .collect()
}

impl FileDescriptor {
    /// Builds a descriptor, renumbering blocks positionally.
    pub fn new(
        file_name: impl Into<String>,
        size: u64,
        sha1: impl Into<String>,
        created_at: i64,
        blocks: Vec<BlockDescriptor>,
    ) -> Self {
        let mut descriptor = Self {
            file_name: file_name.into(),
            size,
            sha1: sha1.into(),
            created_at,
            blocks,
        };
        descriptor.reindex();
        descriptor
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether `other` describes the same content: equal checksum, size
    /// and block count.
    pub fn same_content(&self, other: &FileDescriptor) -> bool {
        self.sha1 == other.sha1
            && self.size == other.size
            && self.blocks.len() == other.blocks.len()
    }

    /// Checks that the blocks tile `[0, size)` with no gaps or overlaps.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.blocks.is_empty() {
            return Err(TransferError::InvalidMeta("no blocks".into()));
        }

        let mut expected_offset = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.index != i {
                return Err(TransferError::InvalidMeta(format!(
                    "block {i} carries index {}",
                    block.index
                )));
            }
            if block.size == 0 {
                return Err(TransferError::InvalidMeta(format!("block {i} is empty")));
            }
            if block.offset != expected_offset {
                return Err(TransferError::InvalidMeta(format!(
                    "block {i} starts at {} instead of {expected_offset}",
                    block.offset
                )));
            }
            expected_offset = expected_offset
                .checked_add(block.size)
                .ok_or_else(|| TransferError::InvalidMeta("block sizes overflow".into()))?;
        }

        if expected_offset != self.size {
            return Err(TransferError::InvalidMeta(format!(
                "blocks cover {expected_offset} bytes but file size is {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Serializes to the meta object wire format.
    pub fn to_json(&self) -> Result<Vec<u8>, TransferError> {
        let wire = WireMeta {
            file_name: self.file_name.clone(),
            size: self.size,
            sha1: self.sha1.clone(),
            time: self.created_at,
            block_dicts: self
                .blocks
                .iter()
                .map(|b| WireBlock {
                    size: b.size,
                    sha1: b.sha1.clone(),
                    url: b.url.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parses and validates a meta object.
    pub fn from_json(data: &[u8]) -> Result<Self, TransferError> {
        let wire: WireMeta = serde_json::from_slice(data)?;
        let blocks = wire
            .block_dicts
            .into_iter()
            .map(|b| BlockDescriptor {
                size: b.size,
                sha1: b.sha1,
                url: b.url,
                ..Default::default()
            })
            .collect();
        let descriptor = Self::new(wire.file_name, wire.size, wire.sha1, wire.time, blocks);
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn reindex(&mut self) {
        let mut offset = 0u64;
        for (index, block) in self.blocks.iter_mut().enumerate() {
            block.index = index;
            block.offset = offset;
            offset = offset.saturating_add(block.size);
        }
    }
}
