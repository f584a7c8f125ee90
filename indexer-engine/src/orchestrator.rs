use crate::adapter::ChainAdapter;
use crate::config::IndexerConfig;
use crate::error::{OrchestratorError, PoolError, TaskError};
use crate::gap::GapReconciler;
use crate::metrics::SharedMetrics;
use crate::model::ChainRecord;
use crate::processor::BlockProcessor;
use crate::progress::ProgressTracker;
use crate::store::ChainStore;
use crate::task_pool::{
    panic_message, PoolHandle, PoolStats, Task, TaskHandler, TaskKind, TaskOutcome, TaskPool,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause before retrying a batch rejected by a full work queue.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(200);

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

/// Lifecycle flag with compare-and-swap transitions. Only one caller wins
/// each transition, so overlapping start/stop calls cannot race.
#[derive(Debug, Default)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn begin_start(&self) -> bool {
        self.0
            .compare_exchange(STOPPED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn confirm_running(&self) {
        self.0.store(RUNNING, Ordering::Release);
    }

    fn abort_start(&self) {
        self.0.store(STOPPED, Ordering::Release);
    }

    fn begin_stop(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_stop(&self) {
        self.0.store(STOPPED, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }
}

struct Running {
    stop: CancellationToken,
    pool: TaskPool,
    loops: Vec<JoinHandle<()>>,
}

/// Pool statistics wrapped with the chain identity, for the presentation
/// layer.
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub chain_id: String,
    pub running: bool,
    pub pool: Option<PoolStats>,
}

/// Top-level driver for one chain: polls the head, partitions the confirmed
/// range into batches for the task pool, and periodically runs gap
/// reconciliation and progress tracking.
pub struct Orchestrator {
    config: IndexerConfig,
    adapter: Arc<dyn ChainAdapter>,
    processor: Arc<dyn BlockProcessor>,
    chain_store: Arc<dyn ChainStore>,
    reconciler: Arc<GapReconciler>,
    progress: Arc<ProgressTracker>,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
    task_seq: Arc<AtomicU64>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IndexerConfig,
        adapter: Arc<dyn ChainAdapter>,
        processor: Arc<dyn BlockProcessor>,
        chain_store: Arc<dyn ChainStore>,
        reconciler: Arc<GapReconciler>,
        progress: Arc<ProgressTracker>,
        metrics: SharedMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            adapter,
            processor,
            chain_store,
            reconciler,
            progress,
            metrics,
            shutdown,
            lifecycle: Lifecycle::default(),
            running: Mutex::new(None),
            task_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers the chain if needed and launches the four loops. Rejected
    /// when already running.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        if !self.lifecycle.begin_start() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        match self.launch() {
            Ok(running) => {
                *self.running.lock() = Some(running);
                self.lifecycle.confirm_running();
                info!(chain = %self.config.chain_id, "indexer started");
                Ok(())
            }
            Err(err) => {
                self.lifecycle.abort_start();
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<Running, OrchestratorError> {
        if self.chain_store.chain(&self.config.chain_id)?.is_none() {
            self.chain_store.upsert_chain(ChainRecord::new(
                &self.config.chain_id,
                self.config.start_height,
            ))?;
        }

        let stop = self.shutdown.child_token();
        let pool = TaskPool::new(
            self.config.pool_config(),
            batch_handler(self.adapter.clone(), self.processor.clone(), stop.clone()),
        );
        let results = pool.results();
        let handle = pool.handle();

        let sync = SyncLoop {
            config: self.config.clone(),
            adapter: self.adapter.clone(),
            chain_store: self.chain_store.clone(),
            pool: handle.clone(),
            metrics: self.metrics.clone(),
            task_seq: self.task_seq.clone(),
            stop: stop.clone(),
        };
        let loops = vec![
            spawn_loop("sync", self.metrics.clone(), sync.run()),
            spawn_loop(
                "drain",
                self.metrics.clone(),
                drain_loop(results, stop.clone()),
            ),
            spawn_loop(
                "gaps",
                self.metrics.clone(),
                gap_loop(
                    self.reconciler.clone(),
                    self.config.gap_scan_interval(),
                    self.config.gap_recovery,
                    stop.clone(),
                ),
            ),
            spawn_loop(
                "progress",
                self.metrics.clone(),
                progress_loop(
                    self.progress.clone(),
                    handle,
                    self.config.progress_interval(),
                    stop.clone(),
                ),
            ),
        ];

        Ok(Running { stop, pool, loops })
    }

    /// Cancels the stop signal once, drains the pool, and joins the loops.
    /// Rejected when not running; a losing concurrent caller observes
    /// `NotRunning` instead of a second shutdown.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        if !self.lifecycle.begin_stop() {
            return Err(OrchestratorError::NotRunning);
        }
        let Some(running) = self.running.lock().take() else {
            self.lifecycle.finish_stop();
            return Err(OrchestratorError::NotRunning);
        };
        info!(chain = %self.config.chain_id, "stopping indexer");
        running.stop.cancel();
        running.pool.stop().await;
        for handle in running.loops {
            let _ = handle.await;
        }
        self.lifecycle.finish_stop();
        info!(chain = %self.config.chain_id, "indexer stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            chain_id: self.config.chain_id.clone(),
            running: self.is_running(),
            pool: self.running.lock().as_ref().map(|running| running.pool.stats()),
        }
    }

    /// On-demand access outside the periodic loops.
    pub fn reconciler(&self) -> Arc<GapReconciler> {
        self.reconciler.clone()
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }
}

/// Fetch the batch range from the adapter and run it through the
/// processor. Watermark advancement happens inside the processor, which is
/// why out-of-order completion is safe here.
fn batch_handler(
    adapter: Arc<dyn ChainAdapter>,
    processor: Arc<dyn BlockProcessor>,
    stop: CancellationToken,
) -> TaskHandler {
    Arc::new(move |pool_cancel, task| {
        let adapter = adapter.clone();
        let processor = processor.clone();
        let stop = stop.clone();
        async move {
            if stop.is_cancelled() || pool_cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let (start, end) = task.kind.bounds();
            let blocks = adapter.blocks_in_range(start, end).await?;
            let report = processor.process_batch(&blocks);
            if report.failed > 0 {
                return Err(TaskError::Partial {
                    processed: report.processed,
                    failed: report.failed,
                });
            }
            Ok(report.processed as u64)
        }
        .boxed()
    })
}

struct SyncLoop {
    config: IndexerConfig,
    adapter: Arc<dyn ChainAdapter>,
    chain_store: Arc<dyn ChainStore>,
    pool: PoolHandle,
    metrics: SharedMetrics,
    task_seq: Arc<AtomicU64>,
    stop: CancellationToken,
}

impl SyncLoop {
    /// Polls the head, carves the confirmed range into batches, and submits
    /// them in strictly increasing height order. The cursor advances only
    /// on accepted submission, so a full queue retries the same batch and
    /// no height is ever skipped.
    async fn run(self) {
        let chain_id = self.config.chain_id.clone();
        let batch_size = self.config.batch_size.max(1);
        let mut cursor = match self.chain_store.chain(&chain_id) {
            Ok(Some(record)) => record
                .indexed_height
                .map(|height| height + 1)
                .unwrap_or(record.start_height),
            Ok(None) => self.config.start_height,
            Err(err) => {
                error!(chain = %chain_id, %err, "failed to read chain record, starting from configured height");
                self.config.start_height
            }
        };
        info!(chain = %chain_id, cursor, "sync loop started");

        let mut backfill_reported = false;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        'run: loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break 'run,
                _ = ticker.tick() => {}
            }

            let head = match self.adapter.latest_height().await {
                Ok(head) => head,
                Err(err) => {
                    warn!(chain = %chain_id, %err, "head height query failed");
                    continue;
                }
            };
            self.metrics.set_head_height(head);

            let mut target = head
                .saturating_sub(self.config.confirmation_depth)
                .max(cursor.saturating_sub(1));
            if let Some(end_height) = self.config.end_height {
                target = target.min(end_height);
            }

            while cursor <= target {
                let end = (cursor + batch_size - 1).min(target);
                let task = Task {
                    id: self.task_seq.fetch_add(1, Ordering::Relaxed),
                    kind: TaskKind::Range { start: cursor, end },
                };
                loop {
                    match self.pool.submit(task).await {
                        Ok(()) => {
                            debug!(chain = %chain_id, start = cursor, end, "batch submitted");
                            cursor = end + 1;
                            break;
                        }
                        Err(PoolError::QueueFull) => {
                            debug!(chain = %chain_id, start = cursor, end, "work queue full, retrying batch");
                            tokio::select! {
                                biased;
                                _ = self.stop.cancelled() => break 'run,
                                _ = tokio::time::sleep(BACKPRESSURE_PAUSE) => {}
                            }
                        }
                        Err(PoolError::Stopped) => {
                            warn!(chain = %chain_id, "task pool stopped, ending sync loop");
                            break 'run;
                        }
                    }
                }
            }

            if let Some(end_height) = self.config.end_height {
                if cursor > end_height && !backfill_reported {
                    info!(chain = %chain_id, end_height, "bounded backfill complete");
                    backfill_reported = true;
                }
            }
        }
        info!(chain = %chain_id, "sync loop stopped");
    }
}

/// Consumes pool outcomes. Purely observational; the cursor never depends
/// on completions.
async fn drain_loop(results: flume::Receiver<TaskOutcome>, stop: CancellationToken) {
    loop {
        let outcome = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            outcome = results.recv_async() => match outcome {
                Ok(outcome) => outcome,
                Err(_) => break,
            },
        };
        match outcome.result {
            Ok(blocks) => debug!(
                task = outcome.task_id,
                blocks,
                duration_ms = outcome.duration.as_millis() as u64,
                "batch completed"
            ),
            Err(err) => warn!(task = outcome.task_id, %err, "batch failed"),
        }
    }
    debug!("outcome drain loop stopped");
}

async fn gap_loop(
    reconciler: Arc<GapReconciler>,
    interval: Duration,
    enabled: bool,
    stop: CancellationToken,
) {
    if !enabled {
        info!("gap recovery disabled");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match reconciler.recover_all(&stop).await {
            Ok(report) if report.detected > 0 => info!(
                gaps = report.detected,
                blocks = report.blocks_recovered,
                "gap reconciliation pass complete"
            ),
            Ok(_) => debug!("no gaps detected"),
            Err(err) => warn!(%err, "gap reconciliation incomplete"),
        }
    }
    debug!("gap loop stopped");
}

async fn progress_loop(
    progress: Arc<ProgressTracker>,
    pool: PoolHandle,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match progress.get_progress().await {
            Ok(snapshot) => {
                let stats = pool.stats();
                info!(
                    chain = %snapshot.chain_id,
                    indexed = snapshot.indexed_height,
                    head = snapshot.head_height,
                    behind = snapshot.blocks_behind,
                    percent = snapshot.percent,
                    status = %snapshot.status,
                    "sync progress"
                );
                debug!(
                    active = stats.active_workers,
                    queued = stats.queue_len,
                    completed = stats.jobs_completed,
                    failed = stats.jobs_failed,
                    mean_task_ms = stats.mean_task_ms,
                    "pool statistics"
                );
            }
            Err(err) => warn!(%err, "progress refresh failed"),
        }
    }
    debug!("progress loop stopped");
}

/// Fault boundary of every loop: a caught panic marks the engine degraded
/// and the loop stays down until the next start.
fn spawn_loop<F>(name: &'static str, metrics: SharedMetrics, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            error!(
                task = name,
                panic = %panic_message(panic.as_ref()),
                "loop crashed, chain synchronization degraded"
            );
            metrics.mark_degraded();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedAdapter;
    use crate::metrics::create_shared_metrics;
    use crate::processor::StoreProcessor;
    use crate::store::memory::{MemoryBlockStore, MemoryChainStore};

    fn build(config: IndexerConfig) -> (Arc<SimulatedAdapter>, Arc<MemoryChainStore>, Orchestrator) {
        let adapter = Arc::new(SimulatedAdapter::new(config.chain_id.clone()));
        let chain_store = Arc::new(MemoryChainStore::new());
        let block_store = Arc::new(MemoryBlockStore::new());
        let metrics = create_shared_metrics();
        let processor = Arc::new(StoreProcessor::new(
            chain_store.clone(),
            block_store.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(GapReconciler::new(
            config.chain_id.clone(),
            adapter.clone(),
            processor.clone(),
            chain_store.clone(),
            block_store.clone(),
            metrics.clone(),
        ));
        let progress = Arc::new(ProgressTracker::new(
            config.chain_id.clone(),
            adapter.clone(),
            chain_store.clone(),
            metrics.clone(),
        ));
        let orchestrator = Orchestrator::new(
            config,
            adapter.clone(),
            processor,
            chain_store.clone(),
            reconciler,
            progress,
            metrics,
            CancellationToken::new(),
        );
        (adapter, chain_store, orchestrator)
    }

    fn quiet_config() -> IndexerConfig {
        IndexerConfig {
            chain_id: "testnet".into(),
            poll_interval_ms: 3_600_000,
            gap_scan_interval_ms: 3_600_000,
            progress_interval_ms: 3_600_000,
            ..IndexerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_is_rejected_while_running() {
        let (_adapter, _store, orchestrator) = build(quiet_config());

        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());
        assert!(matches!(
            orchestrator.start(),
            Err(OrchestratorError::AlreadyRunning)
        ));

        orchestrator.stop().await.unwrap();
        assert!(!orchestrator.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_is_rejected_while_stopped() {
        let (_adapter, _store, orchestrator) = build(quiet_config());

        assert!(matches!(
            orchestrator.stop().await,
            Err(OrchestratorError::NotRunning)
        ));

        orchestrator.start().unwrap();
        orchestrator.stop().await.unwrap();
        assert!(matches!(
            orchestrator.stop().await,
            Err(OrchestratorError::NotRunning)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restart_after_stop_is_allowed() {
        let (_adapter, _store, orchestrator) = build(quiet_config());

        orchestrator.start().unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_registers_the_chain() {
        let (_adapter, chain_store, orchestrator) = build(IndexerConfig {
            start_height: 7,
            ..quiet_config()
        });

        assert!(chain_store.chain("testnet").unwrap().is_none());
        orchestrator.start().unwrap();
        let record = chain_store.chain("testnet").unwrap().unwrap();
        assert_eq!(record.start_height, 7);
        assert_eq!(record.indexed_height, None);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stats_wrap_pool_stats_with_chain_id() {
        let (_adapter, _store, orchestrator) = build(quiet_config());

        let stats = orchestrator.stats();
        assert_eq!(stats.chain_id, "testnet");
        assert!(!stats.running);
        assert!(stats.pool.is_none());

        orchestrator.start().unwrap();
        let stats = orchestrator.stats();
        assert!(stats.running);
        let pool = stats.pool.unwrap();
        assert_eq!(pool.workers, orchestrator.config().workers);
        orchestrator.stop().await.unwrap();
    }
}
