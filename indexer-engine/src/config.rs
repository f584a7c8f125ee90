use crate::task_pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one chain's indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chain to index (e.g. `"ethereum"`).
    pub chain_id: String,
    /// First block to index.
    pub start_height: u64,
    /// Optional end height for bounded backfill. `None` = run forever.
    pub end_height: Option<u64>,
    /// Heights per task submitted to the pool.
    pub batch_size: u64,
    /// Number of pool workers fetching and persisting batches.
    pub workers: usize,
    /// Capacity of the bounded work queue.
    pub queue_capacity: usize,
    /// Capacity of the bounded outcome queue.
    pub result_capacity: usize,
    /// Blocks withheld from indexing until confirmed.
    pub confirmation_depth: u64,
    /// Chain head polling interval.
    pub poll_interval_ms: u64,
    /// Gap detection and recovery interval, coarser than polling.
    pub gap_scan_interval_ms: u64,
    /// Progress recomputation interval.
    pub progress_interval_ms: u64,
    /// Whether the gap loop actively recovers detected gaps.
    pub gap_recovery: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: "default".into(),
            start_height: 0,
            end_height: None,
            batch_size: 100,
            workers: 4,
            queue_capacity: 64,
            result_capacity: 256,
            confirmation_depth: 12,
            poll_interval_ms: 2_000,
            gap_scan_interval_ms: 30_000,
            progress_interval_ms: 10_000,
            gap_recovery: true,
        }
    }
}

impl IndexerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn gap_scan_interval(&self) -> Duration {
        Duration::from_millis(self.gap_scan_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            result_capacity: self.result_capacity,
        }
    }
}
