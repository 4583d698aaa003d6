//! Download engine.
//!
//! Reconciles the meta objects behind one or more source links, decides
//! whether an existing destination can be resumed, then runs one worker
//! pool that fetches, verifies and commits every pending block.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cdndrive_driver::{Driver, DriverRegistry};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunked::{DestinationFile, calculate_file_checksum, checksum_bytes};
use crate::config::TransferConfig;
use crate::fetch::{Fetcher, HttpFetcher, force_https};
use crate::meta::FileDescriptor;
use crate::pool::{
    PoolSpec, Signal, TaskQueue, join_workers, run_blocking, spawn_pool, with_deadline,
};
use crate::progress::{self, ProgressBitmap, human_size};
use crate::source::{Reconciler, SourcePicker, SourceSet, UniformPicker};
use crate::types::{DownloadOutcome, DownloadReport, TransferEvent, emit};
use crate::validation::destination_path;
use crate::{EVENT_CHANNEL_CAPACITY, TransferError};

/// Downloads files described by meta links.
pub struct Downloader {
    registry: DriverRegistry,
    fetcher: Arc<dyn Fetcher>,
    picker: Arc<dyn SourcePicker>,
    config: TransferConfig,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl Downloader {
    /// Creates a downloader over plain HTTP with uniform source choice.
    pub fn new(registry: DriverRegistry, config: TransferConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            fetcher: Arc::new(HttpFetcher::default()),
            picker: Arc::new(UniformPicker),
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_picker(mut self, picker: Arc<dyn SourcePicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Root cancellation token. Cancelling it stops every running download.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Downloads one file from a group of redundant source links.
    pub async fn download(&self, links: &[String]) -> Result<DownloadOutcome, TransferError> {
        self.config.validate()?;
        let start = Instant::now();

        let sources = self.resolve_sources(links).await?;
        let reference = sources.reference().clone();
        let file_name = reference.file_name.clone();
        let path = planned_destination(&self.config, &reference)?;
        let total = reference.block_count();

        let bitmap = match run_blocking({
            let path = path.clone();
            let reference = reference.clone();
            let verify = self.config.verify_existing;
            move || resume_state(&path, &reference, verify)
        })
        .await
        {
            Ok(bitmap) => bitmap,
            Err(TransferError::AlreadyComplete { .. }) => {
                warn!(file = %file_name, path = %path.display(), "file already exists and is complete, skipping");
                emit(&self.events_tx, TransferEvent::Finished { scope: file_name });
                return Ok(DownloadOutcome::AlreadyComplete { path });
            }
            Err(e) => {
                error!(file = %file_name, error = %e, "cannot start download");
                emit(
                    &self.events_tx,
                    TransferEvent::Failed {
                        scope: file_name,
                        error: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let pending = bitmap.pending();
        let resumed = total - pending.len();
        if resumed > 0 {
            info!(file = %file_name, completed = resumed, total, "resuming download");
            emit(
                &self.events_tx,
                TransferEvent::Resumed {
                    file_name: file_name.clone(),
                    completed: resumed,
                    total,
                },
            );
        }

        let destination = Arc::new(
            run_blocking({
                let path = path.clone();
                let dir = self.config.output_dir.clone();
                move || {
                    std::fs::create_dir_all(&dir)?;
                    DestinationFile::open(&path, bitmap)
                }
            })
            .await?,
        );

        let transferred = match self
            .run_pool(&sources, Arc::clone(&destination), pending, resumed)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(file = %file_name, error = %e, "download failed");
                emit(
                    &self.events_tx,
                    TransferEvent::Failed {
                        scope: file_name,
                        error: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        run_blocking({
            let destination = Arc::clone(&destination);
            move || destination.finish()
        })
        .await?;

        let report = DownloadReport {
            file_name: file_name.clone(),
            path,
            size: reference.size,
            bytes_transferred: transferred,
            blocks_resumed: resumed,
            elapsed: start.elapsed(),
        };
        info!(
            file = %file_name,
            elapsed_secs = report.elapsed.as_secs_f64(),
            speed = %format!("{}/s", human_size(report.throughput() as u64)),
            "download complete"
        );
        emit(&self.events_tx, TransferEvent::Finished { scope: file_name });
        Ok(DownloadOutcome::Completed(report))
    }

    /// Downloads several files one after another, one source group each.
    pub async fn download_batch(
        &self,
        groups: &[Vec<String>],
    ) -> Vec<Result<DownloadOutcome, TransferError>> {
        let mut results = Vec::with_capacity(groups.len());
        for (i, links) in groups.iter().enumerate() {
            info!(file = i + 1, total = groups.len(), "starting batch download");
            results.push(self.download(links).await);
        }
        results
    }

    /// Fetches and reconciles every source's meta object.
    async fn resolve_sources(&self, links: &[String]) -> Result<SourceSet, TransferError> {
        let mut reconciler = Reconciler::new();
        for link in links {
            if reconciler.is_halted() {
                break;
            }
            let (driver, descriptor) = match self.fetch_meta(link).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(link = %link, error = %e, "skipping source");
                    continue;
                }
            };

            let file_name = descriptor.file_name.clone();
            let size = descriptor.size;
            let blocks = descriptor.block_count();
            let created = chrono::DateTime::from_timestamp(descriptor.created_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let sha1 = descriptor.sha1.clone();

            if let Err(e) = reconciler.offer(Arc::clone(&driver), descriptor) {
                warn!(link = %link, error = %e, "source disagrees, ignoring remaining sources");
                continue;
            }
            info!(
                driver = %driver.display_name(),
                file = %file_name,
                size = %human_size(size),
                created = %created,
                blocks,
                sha1 = %sha1,
                "found source"
            );
            emit(
                &self.events_tx,
                TransferEvent::SourceFound {
                    driver: driver.name().to_string(),
                    file_name,
                },
            );
        }

        reconciler.finish().inspect_err(|_| {
            error!(links = links.len(), "no usable download source");
        })
    }

    async fn fetch_meta(
        &self,
        link: &str,
    ) -> Result<(Arc<dyn Driver>, FileDescriptor), TransferError> {
        let parse_error = |reason: String| TransferError::SourceParse {
            link: link.to_string(),
            reason,
        };

        let driver = self
            .registry
            .by_meta_link(link)
            .ok_or_else(|| parse_error("link is not recognised by any driver".into()))?;
        let real = driver
            .meta_to_real(link)
            .ok_or_else(|| parse_error("link has no real URL".into()))?;
        let url = force_https(&real, self.config.force_https);

        let body = with_deadline(
            self.config.fetch_timeout(),
            self.fetcher.fetch(&url, driver.headers()),
        )
        .await
        .map_err(|e| parse_error(e.to_string()))?;
        let data = driver
            .codec()
            .decode(&body)
            .map_err(|e| parse_error(e.to_string()))?;
        let descriptor = FileDescriptor::from_json(&data).map_err(|e| parse_error(e.to_string()))?;

        debug!(link, driver = %driver.name(), "parsed meta object");
        Ok((driver, descriptor))
    }

    /// Runs the worker pool until every pending block is stored.
    ///
    /// Returns the bytes written by this session.
    async fn run_pool(
        &self,
        sources: &SourceSet,
        destination: Arc<DestinationFile>,
        pending: Vec<usize>,
        resumed: usize,
    ) -> Result<u64, TransferError> {
        let total = sources.reference().block_count();
        if pending.is_empty() {
            return Ok(0);
        }

        let file_name = sources.reference().file_name.clone();
        let scope = self.cancel.child_token();
        let rng = match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let job = Arc::new(BlockJob {
            sources: sources.clone(),
            fetcher: Arc::clone(&self.fetcher),
            picker: Arc::clone(&self.picker),
            rng: Mutex::new(rng),
            destination,
            force_https: self.config.force_https,
            fetch_timeout: self.config.fetch_timeout(),
            max_attempts: self.config.max_attempts,
            cancel: scope.clone(),
            events: self.events_tx.clone(),
        });

        let (signal_tx, mut signal_rx) = mpsc::channel(pending.len());
        let queue = TaskQueue::new(pending);
        let handles = spawn_pool(
            PoolSpec {
                scope: Arc::from(file_name.as_str()),
                concurrency: self.config.concurrency,
                max_attempts: self.config.max_attempts,
            },
            queue,
            scope.clone(),
            signal_tx,
            move |index, attempt| {
                let job = Arc::clone(&job);
                async move { job.run(index, attempt).await }
            },
        );

        let mut completed = resumed;
        let mut transferred = 0u64;
        let outcome = loop {
            if completed == total {
                break Ok(transferred);
            }
            match signal_rx.recv().await {
                Some(Signal::Done { index, value }) => {
                    completed += 1;
                    transferred += value;
                    debug!(file = %file_name, block = index, completed, total, "block stored");
                    emit(
                        &self.events_tx,
                        TransferEvent::BlockDone {
                            scope: file_name.clone(),
                            index,
                            completed,
                            total,
                        },
                    );
                }
                Some(Signal::Fatal {
                    index,
                    attempts,
                    last_error,
                }) => {
                    break Err(TransferError::Fatal {
                        index,
                        attempts,
                        last_error: last_error.to_string(),
                    });
                }
                None => break Err(TransferError::Cancelled),
            }
        };

        scope.cancel();
        join_workers(&file_name, handles).await?;
        outcome
    }
}

/// Shared state of one download's workers.
struct BlockJob {
    sources: SourceSet,
    fetcher: Arc<dyn Fetcher>,
    picker: Arc<dyn SourcePicker>,
    rng: Mutex<StdRng>,
    destination: Arc<DestinationFile>,
    force_https: bool,
    fetch_timeout: Duration,
    max_attempts: u32,
    cancel: CancellationToken,
    events: mpsc::Sender<TransferEvent>,
}

impl BlockJob {
    async fn run(&self, index: usize, attempt: u32) -> Result<u64, TransferError> {
        let result = self.attempt(index, attempt).await;
        match &result {
            Err(TransferError::Cancelled) | Ok(_) => {}
            Err(_) if attempt >= self.max_attempts => {}
            Err(e) => emit(
                &self.events,
                TransferEvent::BlockRetry {
                    scope: self.sources.reference().file_name.clone(),
                    index,
                    attempt,
                    error: e.to_string(),
                },
            ),
        }
        result
    }

    /// One attempt: pick a source, fetch, decode, verify, commit.
    async fn attempt(&self, index: usize, attempt: u32) -> Result<u64, TransferError> {
        let expected = self
            .sources
            .reference()
            .blocks
            .get(index)
            .ok_or_else(|| TransferError::block(index, "block index out of range"))?;

        let source = {
            let mut rng = self.rng.lock().unwrap();
            self.picker.pick(&self.sources, index, attempt, &mut rng)
        }
        .ok_or_else(|| TransferError::block(index, "no source carries this block"))?;
        let block = source
            .block(index)
            .ok_or_else(|| TransferError::block(index, "picked source lacks this block"))?;

        let url = force_https(&block.url, self.force_https);
        let body = with_deadline(
            self.fetch_timeout,
            self.fetcher.fetch(&url, source.driver.headers()),
        )
        .await?;
        let codec = source.driver.codec();
        let (data, actual) = run_blocking(move || {
            let data = codec.decode(&body)?;
            let sum = checksum_bytes(&data);
            Ok((data, sum))
        })
        .await?;
        if !actual.eq_ignore_ascii_case(&block.sha1) {
            return Err(TransferError::block(
                index,
                format!(
                    "checksum mismatch from {}: expected {}, got {actual}",
                    source.driver.display_name(),
                    block.sha1
                ),
            ));
        }
        if data.len() as u64 != expected.size {
            return Err(TransferError::block(
                index,
                format!("expected {} bytes, got {}", expected.size, data.len()),
            ));
        }

        let len = data.len() as u64;
        let offset = expected.offset;
        let destination = Arc::clone(&self.destination);
        let cancel = self.cancel.clone();
        let written =
            run_blocking(move || destination.commit_block(index, offset, &data, &cancel)).await?;
        debug!(driver = %source.name(), block = index, attempt, "block verified");
        Ok(if written { len } else { 0 })
    }
}

/// Decides how to treat an existing destination.
///
/// Returns the bitmap to start from, or `AlreadyComplete` when the file is
/// already whole.
fn resume_state(
    path: &Path,
    reference: &FileDescriptor,
    verify_existing: bool,
) -> Result<ProgressBitmap, TransferError> {
    let total = reference.block_count();
    let conflict = |reason: &str| TransferError::ResumeConflict {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let len = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Err(conflict("destination is not a regular file")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Ok(ProgressBitmap::new(total));
    }
    if len > reference.size {
        return Err(conflict("existing file is larger than the target"));
    }
    if let Some(bitmap) = progress::load(&progress::sidecar_path(path), total) {
        return Ok(bitmap);
    }
    if len < reference.size {
        return Err(conflict("partial file without a readable progress sidecar"));
    }

    if verify_existing {
        let actual = calculate_file_checksum(path)?;
        if !actual.eq_ignore_ascii_case(&reference.sha1) {
            return Err(conflict("existing file has the target size but a different checksum"));
        }
    }
    Err(TransferError::AlreadyComplete {
        path: path.display().to_string(),
    })
}

/// Destination a download of `descriptor` would write to.
pub fn planned_destination(
    config: &TransferConfig,
    descriptor: &FileDescriptor,
) -> Result<PathBuf, TransferError> {
    destination_path(&config.output_dir, &descriptor.file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::plan_blocks;
    use tempfile::TempDir;

    fn descriptor(data: &[u8], block_size: u64) -> FileDescriptor {
        FileDescriptor::new(
            "f.bin",
            data.len() as u64,
            checksum_bytes(data),
            0,
            plan_blocks(data.len() as u64, block_size),
        )
    }

    #[test]
    fn missing_or_empty_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let desc = descriptor(&[1u8; 10], 4);

        let bitmap = resume_state(&path, &desc, true).unwrap();
        assert_eq!(bitmap.pending(), vec![0, 1, 2]);

        std::fs::write(&path, b"").unwrap();
        let mut stale = ProgressBitmap::new(3);
        stale.mark(0);
        progress::save(&progress::sidecar_path(&path), &stale).unwrap();
        let bitmap = resume_state(&path, &desc, true).unwrap();
        assert_eq!(bitmap.completed(), 0);
    }

    #[test]
    fn partial_file_with_sidecar_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let desc = descriptor(&[1u8; 10], 4);
        std::fs::write(&path, [1u8; 4]).unwrap();
        let mut bitmap = ProgressBitmap::new(3);
        bitmap.mark(0);
        progress::save(&progress::sidecar_path(&path), &bitmap).unwrap();

        let loaded = resume_state(&path, &desc, true).unwrap();
        assert_eq!(loaded.pending(), vec![1, 2]);
    }

    #[test]
    fn partial_file_without_sidecar_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [1u8; 4]).unwrap();
        let err = resume_state(&path, &descriptor(&[1u8; 10], 4), true).unwrap_err();
        assert!(matches!(err, TransferError::ResumeConflict { .. }));
    }

    #[test]
    fn larger_file_conflicts_even_with_sidecar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [1u8; 11]).unwrap();
        progress::save(&progress::sidecar_path(&path), &ProgressBitmap::new(3)).unwrap();
        let err = resume_state(&path, &descriptor(&[1u8; 10], 4), true).unwrap_err();
        assert!(matches!(err, TransferError::ResumeConflict { .. }));
    }

    #[test]
    fn full_size_file_is_verified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        let data = [7u8; 10];
        let desc = descriptor(&data, 4);

        std::fs::write(&path, data).unwrap();
        assert!(matches!(
            resume_state(&path, &desc, true),
            Err(TransferError::AlreadyComplete { .. })
        ));

        std::fs::write(&path, [8u8; 10]).unwrap();
        assert!(matches!(
            resume_state(&path, &desc, true),
            Err(TransferError::ResumeConflict { .. })
        ));
        // Without verification a same-size file counts as complete.
        assert!(matches!(
            resume_state(&path, &desc, false),
            Err(TransferError::AlreadyComplete { .. })
        ));
    }

    #[test]
    fn full_size_file_with_sidecar_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let mut bitmap = ProgressBitmap::new(3);
        bitmap.mark(2);
        progress::save(&progress::sidecar_path(&path), &bitmap).unwrap();

        let loaded = resume_state(&path, &descriptor(&[1u8; 10], 4), true).unwrap();
        assert_eq!(loaded.pending(), vec![0, 1]);
    }

    #[test]
    fn planned_destination_rejects_traversal() {
        let config = TransferConfig {
            output_dir: PathBuf::from("/downloads"),
            ..Default::default()
        };
        let mut desc = descriptor(&[1u8; 10], 4);
        assert_eq!(
            planned_destination(&config, &desc).unwrap(),
            PathBuf::from("/downloads/f.bin")
        );
        desc.file_name = "../f.bin".into();
        assert!(planned_destination(&config, &desc).is_err());
    }
}
