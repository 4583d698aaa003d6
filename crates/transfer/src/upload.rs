//! Upload engine.
//!
//! Every target driver gets its own task queue, worker pool and child
//! cancellation scope under one root scope per upload. The source file and
//! the per-block checksum cache are shared: a block is hashed once, by
//! whichever driver reads it first. A driver that fails does not affect
//! its siblings; results are reported per driver.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use cdndrive_driver::{CredentialStore, Driver};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunked::{FileChecksums, SourceFile, calculate_upload_checksums, checksum_bytes};
use crate::config::TransferConfig;
use crate::meta::{BlockDescriptor, FileDescriptor, plan_blocks};
use crate::pool::{
    Attempts, PoolSpec, Signal, TaskQueue, join_workers, retry, run_blocking, spawn_pool,
    with_deadline,
};
use crate::progress::human_size;
use crate::types::{DriverUploadResult, TransferEvent, UploadReport, emit};
use crate::{EVENT_CHANNEL_CAPACITY, TransferError};

/// Uploads local files to one or more drivers.
pub struct Uploader {
    http: reqwest::Client,
    config: TransferConfig,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(config: TransferConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            http: reqwest::Client::new(),
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `http` for every driver call.
    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Root cancellation token. Cancelling it stops every driver of every
    /// running upload.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `path` to every driver in `drivers`.
    ///
    /// Fails as a whole only when the file cannot be prepared. Driver
    /// failures are reported per driver in [`UploadReport::drivers`].
    pub async fn upload(
        &self,
        path: &Path,
        drivers: &[Arc<dyn Driver>],
        credentials: &CredentialStore,
    ) -> Result<UploadReport, TransferError> {
        self.config.validate()?;
        if drivers.is_empty() {
            return Err(TransferError::InvalidConfig("no target drivers".into()));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidPath(format!("no file name: {}", path.display())))?;

        let source = run_blocking({
            let path = path.to_path_buf();
            move || SourceFile::open(&path)
        })
        .await?;
        if source.size() == 0 {
            return Err(TransferError::EmptyFile(path.display().to_string()));
        }
        let size = source.size();

        let FileChecksums { sha1, head_sha1 } = run_blocking({
            let path = path.to_path_buf();
            move || calculate_upload_checksums(&path)
        })
        .await?;

        let blocks = plan_blocks(size, self.config.block_size);
        info!(
            file = %file_name,
            size = %human_size(size),
            blocks = blocks.len(),
            sha1 = %sha1,
            drivers = drivers.len(),
            "starting upload"
        );

        let plan = Arc::new(UploadPlan {
            file_name: file_name.clone(),
            size,
            sha1: sha1.clone(),
            checksums: (0..blocks.len()).map(|_| OnceLock::new()).collect(),
            blocks,
            source,
        });

        let root = self.cancel.child_token();
        let uploads = drivers.iter().map(|driver| {
            self.upload_to(
                Arc::clone(&plan),
                Arc::clone(driver),
                credentials.get(driver.name()),
                root.child_token(),
            )
        });
        let results = join_all(uploads).await;
        root.cancel();

        Ok(UploadReport {
            file_name,
            size,
            sha1,
            head_sha1,
            drivers: results,
        })
    }

    /// Runs one driver's scope to completion and reports it.
    async fn upload_to(
        &self,
        plan: Arc<UploadPlan>,
        driver: Arc<dyn Driver>,
        credential: String,
        scope: CancellationToken,
    ) -> DriverUploadResult {
        let name = driver.name().to_string();
        let display_name = driver.display_name().to_string();
        let start = Instant::now();

        let result = self
            .run_driver(&plan, Arc::clone(&driver), credential, &scope)
            .await;
        scope.cancel();

        match &result {
            Ok(link) => {
                let secs = start.elapsed().as_secs_f64();
                let speed = if secs > 0.0 {
                    (plan.size as f64 / secs) as u64
                } else {
                    0
                };
                info!(
                    driver = %display_name,
                    file = %plan.file_name,
                    elapsed_secs = secs,
                    speed = %format!("{}/s", human_size(speed)),
                    meta_link = %link,
                    "upload complete"
                );
                emit(&self.events_tx, TransferEvent::Finished { scope: name.clone() });
            }
            Err(e) => {
                error!(driver = %display_name, file = %plan.file_name, error = %e, "upload failed");
                emit(
                    &self.events_tx,
                    TransferEvent::Failed {
                        scope: name.clone(),
                        error: e.to_string(),
                    },
                );
            }
        }

        DriverUploadResult {
            name,
            display_name,
            result: result.map_err(|e| e.to_string()),
        }
    }

    /// Uploads every block, then the meta object. Returns the meta link.
    async fn run_driver(
        &self,
        plan: &Arc<UploadPlan>,
        driver: Arc<dyn Driver>,
        credential: String,
        scope: &CancellationToken,
    ) -> Result<String, TransferError> {
        let total = plan.blocks.len();
        let name = driver.name().to_string();
        let job = Arc::new(UploadJob {
            plan: Arc::clone(plan),
            driver: Arc::clone(&driver),
            credential: credential.clone(),
            http: self.http.clone(),
            upload_timeout: self.config.upload_timeout(),
            max_attempts: self.config.max_attempts,
            events: self.events_tx.clone(),
        });

        let (signal_tx, mut signal_rx) = mpsc::channel(total);
        let handles = spawn_pool(
            PoolSpec {
                scope: Arc::from(name.as_str()),
                concurrency: self.config.concurrency,
                max_attempts: self.config.max_attempts,
            },
            TaskQueue::new((0..total).collect()),
            scope.clone(),
            signal_tx,
            move |index, attempt| {
                let job = Arc::clone(&job);
                async move { job.run(index, attempt).await }
            },
        );

        let mut uploaded: Vec<Option<UploadedBlock>> = vec![None; total];
        let mut completed = 0;
        let outcome = loop {
            if completed == total {
                break Ok(());
            }
            match signal_rx.recv().await {
                Some(Signal::Done { index, value }) => {
                    if uploaded[index].replace(value).is_none() {
                        completed += 1;
                    }
                    debug!(driver = %name, block = index, completed, total, "block uploaded");
                    emit(
                        &self.events_tx,
                        TransferEvent::BlockDone {
                            scope: name.clone(),
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
        if outcome.is_err() {
            scope.cancel();
        }
        join_workers(&name, handles).await?;
        outcome?;

        let blocks = plan
            .blocks
            .iter()
            .zip(uploaded)
            .map(|(block, done)| {
                let done = done.unwrap_or_default();
                BlockDescriptor {
                    sha1: done.sha1,
                    url: done.url,
                    ..block.clone()
                }
            })
            .collect();
        let descriptor = FileDescriptor::new(
            plan.file_name.clone(),
            plan.size,
            plan.sha1.clone(),
            chrono::Utc::now().timestamp(),
            blocks,
        );
        let meta = descriptor.to_json()?;
        info!(driver = %driver.display_name(), file = %plan.file_name, "blocks uploaded, storing meta object");

        let url = self
            .upload_meta(&driver, &meta, &credential, &plan.sha1, scope)
            .await?;
        Ok(driver.real_to_meta(&url))
    }

    async fn upload_meta(
        &self,
        driver: &Arc<dyn Driver>,
        meta: &[u8],
        credential: &str,
        sha1: &str,
        scope: &CancellationToken,
    ) -> Result<String, TransferError> {
        let outcome = retry(
            self.config.max_attempts,
            scope,
            |_| {
                with_deadline(self.config.upload_timeout(), async move {
                    driver
                        .upload(meta, &self.http, credential, sha1)
                        .await
                        .map_err(TransferError::from)
                })
            },
            |attempt, e| {
                warn!(
                    driver = %driver.display_name(),
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = %e,
                    "meta upload attempt failed"
                );
            },
        )
        .await;

        match outcome {
            Attempts::Succeeded(url) => Ok(url),
            Attempts::Cancelled => Err(TransferError::Cancelled),
            Attempts::Exhausted {
                attempts,
                last_error,
            } => Err(TransferError::MetaUpload {
                attempts,
                last_error: last_error.to_string(),
            }),
        }
    }
}

/// State shared by every driver of one upload.
struct UploadPlan {
    file_name: String,
    size: u64,
    sha1: String,
    blocks: Vec<BlockDescriptor>,
    /// Block checksums, filled on first read.
    checksums: Vec<OnceLock<String>>,
    source: SourceFile,
}

#[derive(Debug, Clone, Default)]
struct UploadedBlock {
    url: String,
    sha1: String,
}

/// One driver's workers.
struct UploadJob {
    plan: Arc<UploadPlan>,
    driver: Arc<dyn Driver>,
    credential: String,
    http: reqwest::Client,
    upload_timeout: Duration,
    max_attempts: u32,
    events: mpsc::Sender<TransferEvent>,
}

impl UploadJob {
    async fn run(&self, index: usize, attempt: u32) -> Result<UploadedBlock, TransferError> {
        let result = self.attempt(index).await;
        match &result {
            Err(TransferError::Cancelled) | Ok(_) => {}
            Err(_) if attempt >= self.max_attempts => {}
            Err(e) => emit(
                &self.events,
                TransferEvent::BlockRetry {
                    scope: self.driver.name().to_string(),
                    index,
                    attempt,
                    error: e.to_string(),
                },
            ),
        }
        result
    }

    async fn attempt(&self, index: usize) -> Result<UploadedBlock, TransferError> {
        let block = self
            .plan
            .blocks
            .get(index)
            .ok_or_else(|| TransferError::block(index, "block index out of range"))?;

        let plan = Arc::clone(&self.plan);
        let (offset, size) = (block.offset, block.size);
        let (data, sha1) = run_blocking(move || {
            let data = plan.source.read_block(offset, size)?;
            let sha1 = plan.checksums[index]
                .get_or_init(|| checksum_bytes(&data))
                .clone();
            Ok((data, sha1))
        })
        .await?;

        let url = with_deadline(self.upload_timeout, async {
            self.driver
                .upload(&data, &self.http, &self.credential, &sha1)
                .await
                .map_err(TransferError::from)
        })
        .await?;
        debug!(driver = %self.driver.name(), block = index, "block stored");
        Ok(UploadedBlock { url, sha1 })
    }
}
