use crate::adapter::ChainAdapter;
use crate::error::GapError;
use crate::metrics::SharedMetrics;
use crate::processor::BlockProcessor;
use crate::store::{BlockStore, ChainStore};
use itertools::Itertools;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Width of the detection scan windows. Independent of the sync batch size.
pub const DETECTION_WINDOW: u64 = 10_000;

/// A contiguous range of heights below the watermark with no persisted
/// block. Created by detection, consumed by recovery, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub chain_id: String,
    pub start: u64,
    pub end: u64,
}

impl Gap {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Tally of one `recover_all` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub detected: usize,
    pub recovered: usize,
    pub failed: usize,
    pub blocks_recovered: u64,
}

/// Finds numeric discontinuities in the persisted block sequence and heals
/// them by re-fetching and re-processing the missing ranges.
pub struct GapReconciler {
    chain_id: String,
    adapter: Arc<dyn ChainAdapter>,
    processor: Arc<dyn BlockProcessor>,
    chain_store: Arc<dyn ChainStore>,
    block_store: Arc<dyn BlockStore>,
    metrics: SharedMetrics,
    window: u64,
}

impl GapReconciler {
    /// The adapter is required up front; a reconciler that cannot recover
    /// is not constructible.
    pub fn new(
        chain_id: impl Into<String>,
        adapter: Arc<dyn ChainAdapter>,
        processor: Arc<dyn BlockProcessor>,
        chain_store: Arc<dyn ChainStore>,
        block_store: Arc<dyn BlockStore>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            adapter,
            processor,
            chain_store,
            block_store,
            metrics,
            window: DETECTION_WINDOW,
        }
    }

    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window.max(1);
        self
    }

    /// Scans `[0, watermark]` in fixed windows and reports every missing
    /// sub-range. A chain with nothing indexed yet has no gaps by
    /// definition. O(watermark / window) repository queries.
    pub fn detect(&self) -> Result<Vec<Gap>, GapError> {
        let Some(indexed) = self
            .chain_store
            .chain(&self.chain_id)?
            .and_then(|record| record.indexed_height)
        else {
            return Ok(Vec::new());
        };

        let mut gaps = Vec::new();
        let mut window_start = 0u64;
        loop {
            let window_end = window_start.saturating_add(self.window - 1).min(indexed);
            let heights =
                self.block_store
                    .heights_in_range(&self.chain_id, window_start, window_end)?;
            self.scan_window(window_start, window_end, &heights, &mut gaps);
            if window_end == indexed {
                break;
            }
            window_start = window_end + 1;
        }

        if !gaps.is_empty() {
            self.metrics.add_gaps_detected(gaps.len() as u64);
            debug!(
                chain = %self.chain_id,
                gaps = gaps.len(),
                indexed,
                "detected gaps below watermark"
            );
        }
        Ok(gaps)
    }

    fn scan_window(&self, window_start: u64, window_end: u64, heights: &[u64], gaps: &mut Vec<Gap>) {
        let Some((&first, &last)) = heights.first().zip(heights.last()) else {
            gaps.push(self.gap(window_start, window_end));
            return;
        };
        if first > window_start {
            gaps.push(self.gap(window_start, first - 1));
        }
        for (lower, upper) in heights.iter().tuple_windows() {
            if upper - lower > 1 {
                gaps.push(self.gap(lower + 1, upper - 1));
            }
        }
        if last < window_end {
            gaps.push(self.gap(last + 1, window_end));
        }
    }

    fn gap(&self, start: u64, end: u64) -> Gap {
        Gap {
            chain_id: self.chain_id.clone(),
            start,
            end,
        }
    }

    /// Re-fetches the gap's range and runs it through the processor. Any
    /// fetch or process fault surfaces as a single error for this gap.
    pub async fn recover(&self, gap: &Gap) -> Result<u64, GapError> {
        let blocks = self
            .adapter
            .blocks_in_range(gap.start, gap.end)
            .await
            .map_err(|source| GapError::Fetch {
                start: gap.start,
                end: gap.end,
                source,
            })?;
        let report = self.processor.process_batch(&blocks);
        if report.failed > 0 {
            return Err(GapError::Process {
                start: gap.start,
                end: gap.end,
                failed: report.failed,
                total: blocks.len(),
            });
        }
        info!(
            chain = %self.chain_id,
            start = gap.start,
            end = gap.end,
            blocks = report.processed,
            "gap recovered"
        );
        Ok(report.processed as u64)
    }

    /// Detects and then recovers every gap sequentially, honoring
    /// cancellation between gaps. One failed gap does not abort the rest;
    /// any failure turns the run into an aggregate error naming counts.
    pub async fn recover_all(&self, cancel: &CancellationToken) -> Result<RecoveryReport, GapError> {
        let gaps = self.detect()?;
        let mut report = RecoveryReport {
            detected: gaps.len(),
            ..RecoveryReport::default()
        };

        for gap in &gaps {
            if cancel.is_cancelled() {
                debug!(chain = %self.chain_id, "gap recovery cancelled");
                break;
            }
            match self.recover(gap).await {
                Ok(blocks) => {
                    report.recovered += 1;
                    report.blocks_recovered += blocks;
                    self.metrics.increment_gaps_recovered();
                }
                Err(err) => {
                    warn!(
                        chain = %self.chain_id,
                        start = gap.start,
                        end = gap.end,
                        %err,
                        "gap recovery failed"
                    );
                    report.failed += 1;
                    self.metrics.increment_gap_recovery_failures();
                }
            }
        }

        if report.failed > 0 {
            return Err(GapError::Partial {
                recovered: report.recovered,
                total: report.detected,
            });
        }
        Ok(report)
    }

    /// True iff `[start, end]` is fully persisted: the count matches and
    /// the sorted heights are exactly `start..=end`. Audit helper, not used
    /// by the periodic loops.
    pub fn verify_continuity(&self, start: u64, end: u64) -> Result<bool, GapError> {
        let count = self.block_store.count_in_range(&self.chain_id, start, end)?;
        if count != end - start + 1 {
            return Ok(false);
        }
        let heights = self.block_store.heights_in_range(&self.chain_id, start, end)?;
        Ok(heights.iter().copied().eq(start..=end))
    }
}
