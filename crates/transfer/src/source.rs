//! Redundant download sources and the policy for choosing between them.
//!
//! Several drivers may hold copies of the same file. Their meta objects
//! are reconciled against the first one that parses: every later source
//! must agree on checksum, size and block count, and the first one that
//! does not halts reconciliation for the rest of the link group.

use std::sync::Arc;

use cdndrive_driver::Driver;
use rand::Rng;
use rand::rngs::StdRng;

use crate::TransferError;
use crate::meta::{BlockDescriptor, FileDescriptor};

/// One driver's view of a file.
#[derive(Clone)]
pub struct Source {
    pub driver: Arc<dyn Driver>,
    pub blocks: Vec<BlockDescriptor>,
}

impl Source {
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn block(&self, index: usize) -> Option<&BlockDescriptor> {
        self.blocks.get(index)
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("driver", &self.driver.name())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// The reconciled set of sources for one download.
#[derive(Debug, Clone)]
pub struct SourceSet {
    reference: FileDescriptor,
    sources: Vec<Source>,
}

impl SourceSet {
    /// The descriptor every source agreed with.
    pub fn reference(&self) -> &FileDescriptor {
        &self.reference
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Indices of the sources that carry `block_index`.
    pub fn candidates(&self, block_index: usize) -> Vec<usize> {
        self.sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| (block_index < s.blocks.len()).then_some(i))
            .collect()
    }
}

/// Builds a [`SourceSet`] one parsed meta object at a time.
#[derive(Default)]
pub struct Reconciler {
    reference: Option<FileDescriptor>,
    sources: Vec<Source>,
    halted: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers one source.
    ///
    /// The first offer becomes the reference. A later offer describing
    /// different content is rejected and halts reconciliation: the caller
    /// must not offer further sources from the same group. A repeated
    /// driver name replaces that driver's earlier entry.
    pub fn offer(
        &mut self,
        driver: Arc<dyn Driver>,
        descriptor: FileDescriptor,
    ) -> Result<(), TransferError> {
        if self.halted {
            return Err(TransferError::SourceMismatch {
                driver: driver.name().to_string(),
            });
        }

        match &self.reference {
            None => self.reference = Some(descriptor.clone()),
            Some(reference) if !reference.same_content(&descriptor) => {
                self.halted = true;
                return Err(TransferError::SourceMismatch {
                    driver: driver.name().to_string(),
                });
            }
            Some(_) => {}
        }

        self.sources.retain(|s| s.name() != driver.name());
        self.sources.push(Source {
            driver,
            blocks: descriptor.blocks,
        });
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Finishes reconciliation.
    pub fn finish(self) -> Result<SourceSet, TransferError> {
        match self.reference {
            Some(reference) if !self.sources.is_empty() => Ok(SourceSet {
                reference,
                sources: self.sources,
            }),
            _ => Err(TransferError::NoUsableSource),
        }
    }
}

/// Chooses which source serves one attempt at one block.
pub trait SourcePicker: Send + Sync {
    /// Returns the source to fetch `block_index` from, or `None` if no
    /// source carries it.
    fn pick<'s>(
        &self,
        set: &'s SourceSet,
        block_index: usize,
        attempt: u32,
        rng: &mut StdRng,
    ) -> Option<&'s Source>;
}

/// Uniform random choice among the sources carrying the block.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPicker;

impl SourcePicker for UniformPicker {
    fn pick<'s>(
        &self,
        set: &'s SourceSet,
        block_index: usize,
        _attempt: u32,
        rng: &mut StdRng,
    ) -> Option<&'s Source> {
        pick_source(set, block_index, rng)
    }
}

/// Uniform random source for `block_index`.
pub fn pick_source<'s>(
    set: &'s SourceSet,
    block_index: usize,
    rng: &mut StdRng,
) -> Option<&'s Source> {
    let candidates = set.candidates(block_index);
    if candidates.is_empty() {
        return None;
    }
    set.sources.get(candidates[rng.gen_range(0..candidates.len())])
}
