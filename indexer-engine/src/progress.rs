use crate::adapter::ChainAdapter;
use crate::error::StoreError;
use crate::metrics::SharedMetrics;
use crate::model::ChainStatus;
use crate::store::ChainStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Blocks-behind above which a chain is reported as syncing.
pub const SYNCING_THRESHOLD: u64 = 32;
/// Blocks-behind below which a chain is reported as synced. Between the
/// two thresholds the previous status is retained.
pub const SYNCED_THRESHOLD: u64 = 8;

/// Derived synchronization progress of one chain. Recomputed per query;
/// staleness between refreshes is acceptable.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub chain_id: String,
    pub start_height: u64,
    pub indexed_height: Option<u64>,
    pub head_height: u64,
    pub blocks_behind: u64,
    pub percent: f64,
    pub blocks_per_sec: Option<f64>,
    pub eta_secs: Option<u64>,
    pub status: ChainStatus,
}

/// Computes lag, completion and coarse status, and pushes the gauges to
/// the observability sink.
pub struct ProgressTracker {
    chain_id: String,
    adapter: Arc<dyn ChainAdapter>,
    chain_store: Arc<dyn ChainStore>,
    metrics: SharedMetrics,
    last_sample: Mutex<Option<(Instant, u64)>>,
}

impl ProgressTracker {
    pub fn new(
        chain_id: impl Into<String>,
        adapter: Arc<dyn ChainAdapter>,
        chain_store: Arc<dyn ChainStore>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            adapter,
            chain_store,
            metrics,
            last_sample: Mutex::new(None),
        }
    }

    pub async fn get_progress(&self) -> Result<Progress, StoreError> {
        let record = self
            .chain_store
            .chain(&self.chain_id)?
            .ok_or_else(|| StoreError::UnknownChain(self.chain_id.clone()))?;

        let head = match self.adapter.latest_height().await {
            Ok(head) => {
                self.chain_store.record_head_height(&self.chain_id, head)?;
                head
            }
            Err(err) => {
                debug!(chain = %self.chain_id, %err, "head query failed, using cached head");
                record.head_height
            }
        };

        // A chain with nothing indexed measures from just below its start.
        let indexed = record
            .indexed_height
            .unwrap_or_else(|| record.start_height.saturating_sub(1));
        let blocks_behind = head.saturating_sub(indexed);

        let percent = if head > record.start_height {
            let span = head - record.start_height;
            let done = indexed.saturating_sub(record.start_height).min(span);
            100.0 * done as f64 / span as f64
        } else {
            0.0
        };

        let blocks_per_sec = self.sample_rate(indexed);
        let eta_secs = blocks_per_sec
            .filter(|rate| *rate > 0.0)
            .map(|rate| (blocks_behind as f64 / rate).ceil() as u64);

        let status = if blocks_behind > SYNCING_THRESHOLD {
            ChainStatus::Syncing
        } else if blocks_behind < SYNCED_THRESHOLD {
            ChainStatus::Synced
        } else {
            record.status
        };
        if status != record.status {
            self.chain_store.set_status(&self.chain_id, status)?;
        }

        self.metrics.set_head_height(head);
        self.metrics.set_indexed_height(indexed);
        self.metrics.set_blocks_behind(blocks_behind);
        self.metrics.set_percent_synced(percent);
        self.metrics.set_status(status);

        Ok(Progress {
            chain_id: self.chain_id.clone(),
            start_height: record.start_height,
            indexed_height: record.indexed_height,
            head_height: head,
            blocks_behind,
            percent,
            blocks_per_sec,
            eta_secs,
            status,
        })
    }

    /// Throughput from the previous sample; `None` until two samples exist.
    fn sample_rate(&self, indexed: u64) -> Option<f64> {
        let now = Instant::now();
        let mut sample = self.last_sample.lock();
        let rate = sample.and_then(|(at, last_indexed)| {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed <= 0.0 || indexed < last_indexed {
                return None;
            }
            Some((indexed - last_indexed) as f64 / elapsed)
        });
        *sample = Some((now, indexed));
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedAdapter;
    use crate::metrics::create_shared_metrics;
    use crate::model::ChainRecord;
    use crate::store::memory::MemoryChainStore;

    const CHAIN: &str = "testnet";

    fn tracker_with(
        head: u64,
        start: u64,
        indexed: Option<u64>,
    ) -> (Arc<SimulatedAdapter>, Arc<MemoryChainStore>, ProgressTracker) {
        let adapter = Arc::new(SimulatedAdapter::new(CHAIN));
        adapter.extend(head);
        let chain_store = Arc::new(MemoryChainStore::new());
        let mut record = ChainRecord::new(CHAIN, start);
        record.indexed_height = indexed;
        chain_store.upsert_chain(record).unwrap();
        let tracker = ProgressTracker::new(
            CHAIN,
            adapter.clone(),
            chain_store.clone(),
            create_shared_metrics(),
        );
        (adapter, chain_store, tracker)
    }

    #[tokio::test]
    async fn halfway_progress_arithmetic_is_exact() {
        let (_adapter, _store, tracker) = tracker_with(1000, 0, Some(500));

        let progress = tracker.get_progress().await.unwrap();
        assert_eq!(progress.blocks_behind, 500);
        assert_eq!(progress.percent, 50.0);
        assert_eq!(progress.head_height, 1000);
        assert_eq!(progress.status, ChainStatus::Syncing);
    }

    #[tokio::test]
    async fn head_query_failure_falls_back_to_cached_head() {
        let (adapter, store, tracker) = tracker_with(100, 0, Some(40));

        // Prime the cached head.
        tracker.get_progress().await.unwrap();
        assert_eq!(store.chain(CHAIN).unwrap().unwrap().head_height, 100);

        adapter.inject_failures(1);
        let progress = tracker.get_progress().await.unwrap();
        assert_eq!(progress.head_height, 100);
        assert_eq!(progress.blocks_behind, 60);
    }

    #[tokio::test]
    async fn status_holds_between_thresholds() {
        let (adapter, store, tracker) = tracker_with(100, 0, Some(50));

        // 50 behind: above the syncing threshold.
        assert_eq!(tracker.get_progress().await.unwrap().status, ChainStatus::Syncing);

        // 20 behind: inside the hysteresis band, previous status holds.
        store.advance_indexed_height(CHAIN, 80).unwrap();
        assert_eq!(tracker.get_progress().await.unwrap().status, ChainStatus::Syncing);

        // 2 behind: synced.
        store.advance_indexed_height(CHAIN, 98).unwrap();
        let progress = tracker.get_progress().await.unwrap();
        assert_eq!(progress.status, ChainStatus::Synced);
        assert_eq!(store.chain(CHAIN).unwrap().unwrap().status, ChainStatus::Synced);

        // Back inside the band: synced holds.
        adapter.extend(20);
        assert_eq!(tracker.get_progress().await.unwrap().status, ChainStatus::Synced);
    }

    #[tokio::test]
    async fn nothing_indexed_reports_zero_percent() {
        let (_adapter, _store, tracker) = tracker_with(1000, 0, None);

        let progress = tracker.get_progress().await.unwrap();
        assert_eq!(progress.indexed_height, None);
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.blocks_behind, 1000);
    }

    #[tokio::test]
    async fn head_at_start_reports_zero_percent() {
        let (_adapter, _store, tracker) = tracker_with(0, 0, None);

        let progress = tracker.get_progress().await.unwrap();
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.blocks_behind, 0);
        assert_eq!(progress.status, ChainStatus::Synced);
    }

    #[tokio::test]
    async fn rate_needs_two_samples() {
        let (_adapter, store, tracker) = tracker_with(1000, 0, Some(100));

        assert_eq!(tracker.get_progress().await.unwrap().blocks_per_sec, None);

        store.advance_indexed_height(CHAIN, 300).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let progress = tracker.get_progress().await.unwrap();
        let rate = progress.blocks_per_sec.unwrap();
        assert!(rate > 0.0);
        assert!(progress.eta_secs.is_some());
    }
}
