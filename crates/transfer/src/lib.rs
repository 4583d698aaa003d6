//! Chunked, multi-source, resumable file transfer for CDNDrive.
//!
//! A file is split into fixed-size blocks. Uploads push every block to each
//! target driver independently and finish with a JSON meta object per
//! driver. Downloads reconcile one or more meta objects for the same file,
//! then fetch blocks from whichever source carries them, verifying each
//! block's SHA-1 before it is written. Progress survives restarts through a
//! sidecar bitmap next to the destination file.

mod chunked;
pub mod config;
pub mod download;
mod error;
pub mod fetch;
pub mod meta;
mod pool;
pub mod progress;
pub mod source;
mod types;
pub mod upload;
mod validation;

pub use chunked::{
    DestinationFile, FileChecksums, SourceFile, calculate_file_checksum,
    calculate_upload_checksums, checksum_bytes,
};
pub use config::TransferConfig;
pub use download::Downloader;
pub use error::TransferError;
pub use fetch::{Fetcher, HttpFetcher};
pub use meta::{BlockDescriptor, FileDescriptor};
pub use progress::ProgressBitmap;
pub use source::{Reconciler, Source, SourcePicker, SourceSet, UniformPicker, pick_source};
pub use types::{
    DownloadOutcome, DownloadReport, DriverUploadResult, TransferEvent, UploadReport,
};
pub use upload::Uploader;
pub use validation::destination_path;

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Attempts per block before the owning scope is failed.
pub const MAX_ATTEMPTS: u32 = 10;

/// Length of the leading window hashed into [`FileChecksums::head_sha1`].
pub const HEAD_CHECKSUM_LEN: usize = 4 * 1024 * 1024;

/// Capacity of the event channel returned by `take_events`.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;
