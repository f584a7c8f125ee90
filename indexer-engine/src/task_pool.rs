use crate::error::{PoolError, TaskError};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline for the bounded submit hand-off. Expiry is the backpressure
/// signal, not a retry mechanism.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// A unit of work handed to the pool. Ownership transfers submitter →
/// worker → outcome drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Height(u64),
    Range { start: u64, end: u64 },
}

impl TaskKind {
    /// Inclusive height bounds covered by this task.
    pub fn bounds(&self) -> (u64, u64) {
        match *self {
            TaskKind::Height(h) => (h, h),
            TaskKind::Range { start, end } => (start, end),
        }
    }
}

/// Result of one task execution. `result` carries the blocks-processed
/// count on success.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: u64,
    pub result: Result<u64, TaskError>,
    pub duration: Duration,
}

pub type TaskHandler =
    Arc<dyn Fn(CancellationToken, Task) -> BoxFuture<'static, Result<u64, TaskError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub result_capacity: usize,
}

/// Point-in-time pool statistics. Observability only, never control flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub active_workers: usize,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub outcomes_dropped: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub result_len: usize,
    pub result_capacity: usize,
    pub mean_task_ms: f64,
}

#[derive(Debug, Default)]
struct PoolShared {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped_outcomes: AtomicU64,
    active: AtomicUsize,
    busy_ms_total: AtomicU64,
}

/// Cloneable submission and stats surface of a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    work_tx: flume::Sender<Task>,
    result_rx: flume::Receiver<TaskOutcome>,
    shared: Arc<PoolShared>,
    workers: usize,
    queue_capacity: usize,
    result_capacity: usize,
}

impl PoolHandle {
    /// Bounded hand-off to the work queue. Fails with `QueueFull` when no
    /// slot frees up within `SUBMIT_TIMEOUT`; never blocks indefinitely.
    pub async fn submit(&self, task: Task) -> Result<(), PoolError> {
        match tokio::time::timeout(SUBMIT_TIMEOUT, self.work_tx.send_async(task)).await {
            Err(_) => Err(PoolError::QueueFull),
            Ok(Err(_)) => Err(PoolError::Stopped),
            Ok(Ok(())) => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let completed = self.shared.completed.load(Ordering::Relaxed);
        let failed = self.shared.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let busy_ms = self.shared.busy_ms_total.load(Ordering::Relaxed);
        PoolStats {
            workers: self.workers,
            active_workers: self.shared.active.load(Ordering::Relaxed),
            jobs_submitted: self.shared.submitted.load(Ordering::Relaxed),
            jobs_completed: completed,
            jobs_failed: failed,
            outcomes_dropped: self.shared.dropped_outcomes.load(Ordering::Relaxed),
            queue_len: self.work_tx.len(),
            queue_capacity: self.queue_capacity,
            result_len: self.result_rx.len(),
            result_capacity: self.result_capacity,
            mean_task_ms: if finished == 0 {
                0.0
            } else {
                busy_ms as f64 / finished as f64
            },
        }
    }
}

/// Fixed-size pool of worker tasks draining a bounded work queue and
/// publishing outcomes to a bounded result queue.
pub struct TaskPool {
    handle: PoolHandle,
    result_rx: flume::Receiver<TaskOutcome>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TaskPool {
    pub fn new(config: PoolConfig, handler: TaskHandler) -> Self {
        let workers = config.workers.max(1);
        let (work_tx, work_rx) = flume::bounded(config.queue_capacity);
        let (result_tx, result_rx) = flume::bounded(config.result_capacity);
        let cancel = CancellationToken::new();
        let shared = Arc::new(PoolShared::default());

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    work_rx.clone(),
                    result_tx.clone(),
                    handler.clone(),
                    cancel.child_token(),
                    shared.clone(),
                ))
            })
            .collect();

        Self {
            handle: PoolHandle {
                work_tx,
                result_rx: result_rx.clone(),
                shared,
                workers,
                queue_capacity: config.queue_capacity,
                result_capacity: config.result_capacity,
            },
            result_rx,
            workers: handles,
            cancel,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Consumable outcome stream; unordered across workers, finite once the
    /// pool is stopped and its workers have exited.
    pub fn results(&self) -> flume::Receiver<TaskOutcome> {
        self.result_rx.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.handle.stats()
    }

    /// Stops the pool, letting each worker finish its in-flight task.
    /// Consumes the pool, so a second stop is not expressible.
    pub async fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
        for handle in self.workers {
            let _ = handle.await;
        }
        debug!("task pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    work_rx: flume::Receiver<Task>,
    result_tx: flume::Sender<TaskOutcome>,
    handler: TaskHandler,
    cancel: CancellationToken,
    shared: Arc<PoolShared>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = work_rx.recv_async() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let task_id = task.id;
        shared.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // One panicking handler must not take down the worker or its peers.
        let result = match AssertUnwindSafe((handler)(cancel.clone(), task))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        };

        let duration = started.elapsed();
        shared.active.fetch_sub(1, Ordering::Relaxed);
        shared
            .busy_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        match &result {
            Ok(_) => shared.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => shared.failed.fetch_add(1, Ordering::Relaxed),
        };

        let outcome = TaskOutcome {
            task_id,
            result,
            duration,
        };
        if result_tx.try_send(outcome).is_err() {
            shared.dropped_outcomes.fetch_add(1, Ordering::Relaxed);
            warn!(worker = worker_id, task = task_id, "result queue full, dropping outcome");
        }
    }
    debug!(worker = worker_id, "pool worker exited");
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::Semaphore;

    fn counting_handler() -> TaskHandler {
        Arc::new(|_cancel, task| {
            async move {
                let (start, end) = task.kind.bounds();
                Ok(end - start + 1)
            }
            .boxed()
        })
    }

    fn range_task(id: u64, start: u64, end: u64) -> Task {
        Task {
            id,
            kind: TaskKind::Range { start, end },
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_accepted_task_appears_exactly_once() {
        let pool = TaskPool::new(
            PoolConfig {
                workers: 3,
                queue_capacity: 16,
                result_capacity: 32,
            },
            counting_handler(),
        );
        let handle = pool.handle();
        let results = pool.results();

        for id in 0..10u64 {
            handle
                .submit(range_task(id, id * 10, id * 10 + 9))
                .await
                .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let outcome = results.recv_async().await.unwrap();
            assert_eq!(outcome.result.unwrap(), 10);
            assert!(seen.insert(outcome.task_id), "duplicate outcome");
        }
        assert_eq!(seen.len(), 10);

        pool.stop().await;
        assert!(results.recv_async().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn full_queue_rejects_without_losing_accepted_work() {
        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = gate.clone();
        let handler: TaskHandler = Arc::new(move |_cancel, task| {
            let gate = handler_gate.clone();
            async move {
                let permit = gate.acquire().await.expect("gate open");
                permit.forget();
                let (start, end) = task.kind.bounds();
                Ok(end - start + 1)
            }
            .boxed()
        });

        let pool = TaskPool::new(
            PoolConfig {
                workers: 1,
                queue_capacity: 1,
                result_capacity: 8,
            },
            handler,
        );
        let handle = pool.handle();
        let results = pool.results();

        handle.submit(range_task(1, 0, 0)).await.unwrap();
        // Wait until the single worker is blocked inside the handler.
        while handle.stats().active_workers == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.submit(range_task(2, 1, 1)).await.unwrap();

        let rejected = handle.submit(range_task(3, 2, 2)).await;
        assert_eq!(rejected, Err(PoolError::QueueFull));

        gate.add_permits(3);
        let mut seen = HashSet::new();
        for _ in 0..2 {
            seen.insert(results.recv_async().await.unwrap().task_id);
        }
        assert_eq!(seen, HashSet::from([1, 2]));

        // The rejected task is retried by the caller and accepted now.
        handle.submit(range_task(3, 2, 2)).await.unwrap();
        assert_eq!(results.recv_async().await.unwrap().task_id, 3);

        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_handler_is_isolated_to_its_task() {
        let handler: TaskHandler = Arc::new(|_cancel, task| {
            async move {
                if task.id == 2 {
                    panic!("boom on task 2");
                }
                Ok(1)
            }
            .boxed()
        });
        let pool = TaskPool::new(
            PoolConfig {
                workers: 2,
                queue_capacity: 8,
                result_capacity: 8,
            },
            handler,
        );
        let handle = pool.handle();
        let results = pool.results();

        for id in 1..=3u64 {
            handle.submit(range_task(id, id, id)).await.unwrap();
        }

        let mut panicked = 0;
        let mut succeeded = 0;
        for _ in 0..3 {
            let outcome = results.recv_async().await.unwrap();
            match outcome.result {
                Err(TaskError::Panicked(msg)) => {
                    assert_eq!(outcome.task_id, 2);
                    assert!(msg.contains("boom"));
                    panicked += 1;
                }
                Ok(_) => succeeded += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((succeeded, panicked), (2, 1));

        let stats = pool.stats();
        assert_eq!(stats.jobs_submitted, 3);
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 1);

        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stats_report_configuration_and_idle_state() {
        let pool = TaskPool::new(
            PoolConfig {
                workers: 2,
                queue_capacity: 4,
                result_capacity: 16,
            },
            counting_handler(),
        );
        let stats = pool.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.queue_capacity, 4);
        assert_eq!(stats.result_capacity, 16);
        assert_eq!(stats.mean_task_ms, 0.0);
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_after_stop_reports_stopped() {
        let pool = TaskPool::new(
            PoolConfig {
                workers: 1,
                queue_capacity: 1,
                result_capacity: 1,
            },
            counting_handler(),
        );
        let handle = pool.handle();
        pool.stop().await;

        assert_eq!(
            handle.submit(range_task(1, 0, 0)).await,
            Err(PoolError::Stopped)
        );
    }
}
