use crate::error::StoreError;
use crate::model::{Block, BlockHash, ChainRecord, ChainStatus};

pub mod memory;

/// Chain-record repository facade. Lookups return `Ok(None)` for missing
/// records; errors are reserved for backend failures and contract misuse.
pub trait ChainStore: Send + Sync {
    fn chain(&self, id: &str) -> Result<Option<ChainRecord>, StoreError>;

    fn upsert_chain(&self, record: ChainRecord) -> Result<(), StoreError>;

    /// Read-modify-write advance of the watermark. The stored value only
    /// ever moves forward; an already-passed height leaves it untouched.
    /// Returns the watermark after the call.
    fn advance_indexed_height(&self, id: &str, height: u64) -> Result<u64, StoreError>;

    fn record_head_height(&self, id: &str, head: u64) -> Result<(), StoreError>;

    fn set_status(&self, id: &str, status: ChainStatus) -> Result<(), StoreError>;
}

/// Block repository facade, keyed by `(chain_id, height)` and
/// `(chain_id, hash)`.
pub trait BlockStore: Send + Sync {
    fn block_at(&self, chain_id: &str, height: u64) -> Result<Option<Block>, StoreError>;

    fn block_by_hash(&self, chain_id: &str, hash: &BlockHash) -> Result<Option<Block>, StoreError>;

    fn blocks_in_range(&self, chain_id: &str, start: u64, end: u64)
        -> Result<Vec<Block>, StoreError>;

    /// Persisted heights in `start..=end`, ascending.
    fn heights_in_range(&self, chain_id: &str, start: u64, end: u64)
        -> Result<Vec<u64>, StoreError>;

    fn count_in_range(&self, chain_id: &str, start: u64, end: u64) -> Result<u64, StoreError>;

    /// Upsert by `(chain_id, height)`.
    fn put_block(&self, block: Block) -> Result<(), StoreError>;
}
