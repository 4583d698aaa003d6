//! Events and results of the transfer engines.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

/// Progress event emitted during a transfer.
///
/// `scope` is the file name for downloads and the driver name for uploads.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A meta object was parsed and accepted as a download source.
    SourceFound { driver: String, file_name: String },
    /// A download picked up an existing sidecar.
    Resumed { file_name: String, completed: usize, total: usize },
    /// One block was verified and stored.
    BlockDone { scope: String, index: usize, completed: usize, total: usize },
    /// One attempt at a block failed and will be retried.
    BlockRetry { scope: String, index: usize, attempt: u32, error: String },
    /// The scope finished successfully.
    Finished { scope: String },
    /// The scope failed.
    Failed { scope: String, error: String },
}

/// Publishes an event without waiting; dropped when nobody listens or
/// the channel is full.
pub(crate) fn emit(events: &mpsc::Sender<TransferEvent>, event: TransferEvent) {
    let _ = events.try_send(event);
}

/// Result of a download that transferred data.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Bytes fetched and written by this session.
    pub bytes_transferred: u64,
    /// Blocks already complete when the session started.
    pub blocks_resumed: usize,
    pub elapsed: Duration,
}

impl DownloadReport {
    /// Average throughput of this session in bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

/// Terminal outcome of a successful download call.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Completed(DownloadReport),
    /// The destination already held the whole file; nothing was written.
    AlreadyComplete { path: PathBuf },
}

/// Per-driver result of an upload.
#[derive(Debug, Clone)]
pub struct DriverUploadResult {
    pub name: String,
    pub display_name: String,
    /// The meta link on success, the error message otherwise.
    pub result: Result<String, String>,
}

impl DriverUploadResult {
    pub fn meta_link(&self) -> Option<&str> {
        self.result.as_deref().ok()
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of an upload across all target drivers.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub file_name: String,
    pub size: u64,
    pub sha1: String,
    pub head_sha1: String,
    /// One entry per target driver, in the caller's order.
    pub drivers: Vec<DriverUploadResult>,
}

impl UploadReport {
    /// Meta links of every driver that succeeded.
    pub fn meta_links(&self) -> Vec<&str> {
        self.drivers.iter().filter_map(|d| d.meta_link()).collect()
    }

    /// Whether every driver succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.drivers.iter().all(DriverUploadResult::is_success)
    }
}
