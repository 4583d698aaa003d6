//! Worker pool and retry scaffolding shared by both transfer directions.
//!
//! A pool is a fixed number of tokio tasks pulling block indices from one
//! [`TaskQueue`]. Each index is retried up to `max_attempts` times; the
//! outcome goes to a single supervisor as a [`Signal`]. Cancelling the
//! pool's token makes every worker stop at its next queue pull or
//! attempt boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::TransferError;

/// Bounded queue of block indices, filled once and drained by workers.
pub(crate) struct TaskQueue {
    rx: Mutex<mpsc::Receiver<usize>>,
}

impl TaskQueue {
    pub(crate) fn new(tasks: Vec<usize>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(tasks.len().max(1));
        for task in tasks {
            // Capacity equals the task count, so this never fills up.
            let _ = tx.try_send(task);
        }
        Arc::new(Self { rx: Mutex::new(rx) })
    }

    /// Next task, or `None` once the queue is drained or `cancel` fired.
    pub(crate) async fn next(&self, cancel: &CancellationToken) -> Option<usize> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = async { self.rx.lock().await.recv().await } => task,
        }
    }
}

/// Outcome of one task, reported to the pool's supervisor.
#[derive(Debug)]
pub(crate) enum Signal<T> {
    Done { index: usize, value: T },
    Fatal { index: usize, attempts: u32, last_error: TransferError },
}

/// Result of [`retry`].
#[derive(Debug)]
pub(crate) enum Attempts<T> {
    Succeeded(T),
    Cancelled,
    Exhausted { attempts: u32, last_error: TransferError },
}

/// Runs `op` until it succeeds, `max_attempts` is used up, or `cancel` fires.
///
/// `on_failure` sees every failed attempt (1-based).
pub(crate) async fn retry<T, F, Fut>(
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
    mut on_failure: impl FnMut(u32, &TransferError),
) -> Attempts<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut last_error = TransferError::Cancelled;
    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Attempts::Cancelled;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempts::Cancelled,
            result = op(attempt) => result,
        };
        match result {
            Ok(value) => return Attempts::Succeeded(value),
            Err(TransferError::Cancelled) => return Attempts::Cancelled,
            Err(e) => {
                on_failure(attempt, &e);
                last_error = e;
            }
        }
    }
    Attempts::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}

/// Bounds one attempt by `deadline`.
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout),
    }
}

/// Runs blocking file work off the async workers.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        TransferError::Io(std::io::Error::other(format!("task join error: {e}")))
    })?
}

/// Waits for every worker of a pool.
///
/// A worker that panicked took its block with it, so the pool's outcome
/// is replaced by [`TransferError::WorkerPanicked`].
pub(crate) async fn join_workers(
    scope: &str,
    handles: Vec<JoinHandle<()>>,
) -> Result<(), TransferError> {
    let mut panicked = None;
    for handle in handles {
        if let Err(e) = handle.await {
            error!(scope, error = %e, "worker died");
            panicked.get_or_insert_with(|| TransferError::WorkerPanicked {
                scope: scope.to_string(),
                reason: e.to_string(),
            });
        }
    }
    match panicked {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Settings of one pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolSpec {
    /// Label for log lines: the file or driver the pool works for.
    pub scope: Arc<str>,
    pub concurrency: usize,
    pub max_attempts: u32,
}

/// Spawns `spec.concurrency` workers running `job(index, attempt)` for
/// every queued index.
///
/// A worker that exhausts a block reports it and exits.
pub(crate) fn spawn_pool<T, F, Fut>(
    spec: PoolSpec,
    queue: Arc<TaskQueue>,
    cancel: CancellationToken,
    signals: mpsc::Sender<Signal<T>>,
    job: F,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(usize, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TransferError>> + Send,
{
    let job = Arc::new(job);
    (0..spec.concurrency)
        .map(|worker| {
            let spec = spec.clone();
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let signals = signals.clone();
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                while let Some(index) = queue.next(&cancel).await {
                    let outcome = retry(
                        spec.max_attempts,
                        &cancel,
                        |attempt| job(index, attempt),
                        |attempt, e| {
                            warn!(
                                scope = %spec.scope,
                                worker,
                                block = index,
                                attempt,
                                max_attempts = spec.max_attempts,
                                error = %e,
                                "block attempt failed"
                            );
                        },
                    )
                    .await;

                    let (signal, fatal) = match outcome {
                        Attempts::Succeeded(value) => (Signal::Done { index, value }, false),
                        Attempts::Cancelled => break,
                        Attempts::Exhausted {
                            attempts,
                            last_error,
                        } => {
                            if cancel.is_cancelled() {
                                break;
                            }
                            error!(
                                scope = %spec.scope,
                                block = index,
                                attempts,
                                error = %last_error,
                                "block failed, giving up"
                            );
                            let signal = Signal::Fatal {
                                index,
                                attempts,
                                last_error,
                            };
                            (signal, true)
                        }
                    };
                    // A fatal block dooms the scope; stop pulling work.
                    if signals.send(signal).await.is_err() || fatal {
                        break;
                    }
                }
                debug!(scope = %spec.scope, worker, "worker exiting");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec(concurrency: usize, max_attempts: u32) -> PoolSpec {
        PoolSpec {
            scope: Arc::from("test"),
            concurrency,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn queue_drains_then_ends() {
        let queue = TaskQueue::new(vec![3, 1, 2]);
        let cancel = CancellationToken::new();
        assert_eq!(queue.next(&cancel).await, Some(3));
        assert_eq!(queue.next(&cancel).await, Some(1));
        assert_eq!(queue.next(&cancel).await, Some(2));
        assert_eq!(queue.next(&cancel).await, None);
    }

    #[tokio::test]
    async fn empty_queue_ends_immediately() {
        let queue = TaskQueue::new(Vec::new());
        assert_eq!(queue.next(&CancellationToken::new()).await, None);
    }

    #[tokio::test]
    async fn cancelled_queue_yields_nothing() {
        let queue = TaskQueue::new(vec![1]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.next(&cancel).await, None);
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let mut failures = Vec::new();
        let outcome = retry(
            10,
            &cancel,
            |attempt| async move {
                if attempt < 3 {
                    Err(TransferError::block(0, "flaky"))
                } else {
                    Ok(attempt)
                }
            },
            |attempt, _| failures.push(attempt),
        )
        .await;
        assert!(matches!(outcome, Attempts::Succeeded(3)));
        assert_eq!(failures, vec![1, 2]);
    }

    #[tokio::test]
    async fn retry_exhausts_with_last_error() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome: Attempts<()> = retry(
            10,
            &cancel,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(TransferError::block(5, format!("attempt {attempt}"))) }
            },
            |_, _| {},
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        match outcome {
            Attempts::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 10);
                assert_eq!(last_error.to_string(), "block 5: attempt 10");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = retry(10, &cancel, |_| async { Ok(()) }, |_, _| {}).await;
        assert!(matches!(outcome, Attempts::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_maps_to_timeout() {
        let result: Result<(), _> = with_deadline(Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransferError::Timeout)));
    }

    #[tokio::test]
    async fn run_blocking_propagates_result() {
        assert_eq!(run_blocking(|| Ok(7)).await.unwrap(), 7);
        let err = run_blocking::<(), _>(|| Err(TransferError::Timeout)).await;
        assert!(matches!(err, Err(TransferError::Timeout)));
    }

    #[tokio::test]
    async fn pool_runs_every_task_once() {
        let queue = TaskQueue::new((0..20).collect());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(20);
        let handles = spawn_pool(spec(4, 3), queue, cancel, tx, |index, _| async move {
            Ok(index * 2)
        });

        let mut seen = Vec::new();
        while let Some(signal) = rx.recv().await {
            match signal {
                Signal::Done { index, value } => {
                    assert_eq!(value, index * 2);
                    seen.push(index);
                }
                Signal::Fatal { .. } => panic!("unexpected fatal"),
            }
        }
        for h in handles {
            h.await.unwrap();
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pool_reports_exhaustion_as_fatal() {
        let queue = TaskQueue::new(vec![7]);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        spawn_pool(spec(2, 10), queue, cancel, tx, move |index, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(TransferError::block(index, "always")) }
        });

        match rx.recv().await {
            Some(Signal::Fatal {
                index, attempts: n, ..
            }) => {
                assert_eq!(index, 7);
                assert_eq!(n, 10);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_job_surfaces_on_join() {
        let queue = TaskQueue::new(vec![0, 1, 2, 3]);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handles = spawn_pool(spec(2, 3), queue, cancel.clone(), tx, |index, _| async move {
            if index == 2 {
                panic!("job blew up on block {index}");
            }
            Ok(index)
        });

        let mut done = Vec::new();
        while let Some(signal) = rx.recv().await {
            match signal {
                Signal::Done { index, .. } => done.push(index),
                Signal::Fatal { .. } => panic!("unexpected fatal"),
            }
        }
        done.sort();
        assert_eq!(done, vec![0, 1, 3]);
        assert!(!cancel.is_cancelled());

        match join_workers("movie.bin", handles).await {
            Err(TransferError::WorkerPanicked { scope, reason }) => {
                assert_eq!(scope, "movie.bin");
                assert!(reason.contains("panic"), "{reason}");
            }
            other => panic!("expected a worker panic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_workers_join_ok() {
        let (tx, _rx) = mpsc::channel(1);
        let handles = spawn_pool(
            spec(3, 1),
            TaskQueue::new(Vec::new()),
            CancellationToken::new(),
            tx,
            |index, _| async move { Ok(index) },
        );
        assert!(join_workers("empty", handles).await.is_ok());
    }
}
