use crate::model::ChainStatus;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A snapshot of the engine metrics.
/// Contains a copy of all counters and gauges as simple values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineMetricsSnapshot {
    /// Blocks persisted since start
    pub blocks_indexed: u64,
    /// Per-block persistence failures
    pub process_failures: u64,
    /// Gaps found by detection runs
    pub gaps_detected: u64,
    /// Gaps fully healed
    pub gaps_recovered: u64,
    /// Gaps whose recovery failed
    pub gap_recovery_failures: u64,
    /// Last observed chain head height
    pub head_height: u64,
    /// Current watermark
    pub indexed_height: u64,
    /// Head minus watermark
    pub blocks_behind: u64,
    /// Percent complete, in basis points
    pub percent_synced_bp: u64,
    pub status: ChainStatus,
    /// Set when a loop exited on an unexpected fault
    pub degraded: bool,
}

impl Display for EngineMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine Metrics Snapshot:")?;
        writeln!(f, "  Blocks indexed: {}", self.blocks_indexed)?;
        writeln!(f, "  Process failures: {}", self.process_failures)?;
        writeln!(f, "  Gaps detected: {}", self.gaps_detected)?;
        writeln!(f, "  Gaps recovered: {}", self.gaps_recovered)?;
        writeln!(f, "  Gap recovery failures: {}", self.gap_recovery_failures)?;
        writeln!(f, "  Head height: {}", self.head_height)?;
        writeln!(f, "  Indexed height: {}", self.indexed_height)?;
        writeln!(f, "  Blocks behind: {}", self.blocks_behind)?;
        writeln!(
            f,
            "  Percent synced: {:.2}%",
            self.percent_synced_bp as f64 / 100.0
        )?;
        writeln!(f, "  Status: {}", self.status)?;
        write!(f, "  Degraded: {}", self.degraded)
    }
}

/// Metrics structure containing atomic counters and gauges for the engine.
#[derive(Debug)]
pub struct EngineMetrics {
    pub blocks_indexed: AtomicU64,
    pub process_failures: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub gaps_recovered: AtomicU64,
    pub gap_recovery_failures: AtomicU64,
    pub head_height: AtomicU64,
    pub indexed_height: AtomicU64,
    pub blocks_behind: AtomicU64,
    pub percent_synced_bp: AtomicU64,
    pub status: ArcSwap<ChainStatus>,
    pub degraded: AtomicBool,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters initialized to zero
    pub fn new() -> Self {
        Self {
            blocks_indexed: AtomicU64::new(0),
            process_failures: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            gaps_recovered: AtomicU64::new(0),
            gap_recovery_failures: AtomicU64::new(0),
            head_height: AtomicU64::new(0),
            indexed_height: AtomicU64::new(0),
            blocks_behind: AtomicU64::new(0),
            percent_synced_bp: AtomicU64::new(0),
            status: ArcSwap::new(Arc::new(ChainStatus::Unknown)),
            degraded: AtomicBool::new(false),
        }
    }

    /// Create a snapshot of the current metrics
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            blocks_indexed: self.blocks_indexed.load(Ordering::Relaxed),
            process_failures: self.process_failures.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            gaps_recovered: self.gaps_recovered.load(Ordering::Relaxed),
            gap_recovery_failures: self.gap_recovery_failures.load(Ordering::Relaxed),
            head_height: self.head_height.load(Ordering::Relaxed),
            indexed_height: self.indexed_height.load(Ordering::Relaxed),
            blocks_behind: self.blocks_behind.load(Ordering::Relaxed),
            percent_synced_bp: self.percent_synced_bp.load(Ordering::Relaxed),
            status: *self.status.load().as_ref(),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    pub fn increment_blocks_indexed(&self) {
        self.blocks_indexed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_process_failures(&self) {
        self.process_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_gaps_detected(&self, count: u64) {
        self.gaps_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_gaps_recovered(&self) {
        self.gaps_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_gap_recovery_failures(&self) {
        self.gap_recovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_head_height(&self, height: u64) {
        self.head_height.store(height, Ordering::Relaxed);
    }

    pub fn set_indexed_height(&self, height: u64) {
        self.indexed_height.store(height, Ordering::Relaxed);
    }

    pub fn set_blocks_behind(&self, behind: u64) {
        self.blocks_behind.store(behind, Ordering::Relaxed);
    }

    pub fn set_percent_synced(&self, percent: f64) {
        self.percent_synced_bp
            .store((percent * 100.0) as u64, Ordering::Relaxed);
    }

    pub fn set_status(&self, status: ChainStatus) {
        self.status.store(Arc::new(status));
    }

    pub fn get_status(&self) -> ChainStatus {
        *self.status.load().as_ref()
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics instance wrapped in Arc for use across loops and workers
pub type SharedMetrics = Arc<EngineMetrics>;

/// Create a new shared metrics instance
pub fn create_shared_metrics() -> SharedMetrics {
    Arc::new(EngineMetrics::new())
}
