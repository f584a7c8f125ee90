use crate::error::ProcessError;
use crate::metrics::SharedMetrics;
use crate::model::Block;
use crate::store::{BlockStore, ChainStore};
use std::sync::Arc;
use tracing::warn;

/// Result of processing a batch of blocks. One failed block does not abort
/// the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Validates and persists blocks, advancing the chain watermark
/// opportunistically. The watermark only ever moves forward, no matter in
/// which order batches complete.
pub trait BlockProcessor: Send + Sync {
    fn process(&self, block: &Block) -> Result<(), ProcessError>;

    fn process_batch(&self, blocks: &[Block]) -> BatchReport {
        let mut report = BatchReport::default();
        for block in blocks {
            match self.process(block) {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    warn!(
                        chain = %block.chain_id,
                        height = block.height,
                        %err,
                        "block processing failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Store-backed processor: validate, upsert the block, advance the
/// watermark.
pub struct StoreProcessor {
    chain_store: Arc<dyn ChainStore>,
    block_store: Arc<dyn BlockStore>,
    metrics: SharedMetrics,
}

impl StoreProcessor {
    pub fn new(
        chain_store: Arc<dyn ChainStore>,
        block_store: Arc<dyn BlockStore>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            chain_store,
            block_store,
            metrics,
        }
    }

    fn validate(block: &Block) -> Result<(), ProcessError> {
        if block.chain_id.is_empty() {
            return Err(ProcessError::Invalid {
                height: block.height,
                reason: "empty chain id",
            });
        }
        if block.hash == [0u8; 32] {
            return Err(ProcessError::Invalid {
                height: block.height,
                reason: "zero hash",
            });
        }
        Ok(())
    }
}

impl BlockProcessor for StoreProcessor {
    fn process(&self, block: &Block) -> Result<(), ProcessError> {
        Self::validate(block).inspect_err(|_| self.metrics.increment_process_failures())?;

        self.block_store
            .put_block(block.clone())
            .inspect_err(|_| self.metrics.increment_process_failures())?;

        let watermark = self
            .chain_store
            .advance_indexed_height(&block.chain_id, block.height)
            .inspect_err(|_| self.metrics.increment_process_failures())?;

        self.metrics.increment_blocks_indexed();
        self.metrics.set_indexed_height(watermark);
        Ok(())
    }
}
