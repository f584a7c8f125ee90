use crate::error::StoreError;
use crate::model::{Block, BlockHash, ChainRecord, ChainStatus};
use crate::store::{BlockStore, ChainStore};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;

/// In-memory chain-record store, used by tests and the demo wiring. A
/// durable deployment plugs in its own `ChainStore`.
#[derive(Default)]
pub struct MemoryChainStore {
    chains: RwLock<HashMap<String, ChainRecord>>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for MemoryChainStore {
    fn chain(&self, id: &str) -> Result<Option<ChainRecord>, StoreError> {
        Ok(self.chains.read().get(id).cloned())
    }

    fn upsert_chain(&self, record: ChainRecord) -> Result<(), StoreError> {
        self.chains.write().insert(record.id.clone(), record);
        Ok(())
    }

    fn advance_indexed_height(&self, id: &str, height: u64) -> Result<u64, StoreError> {
        let mut chains = self.chains.write();
        let record = chains
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownChain(id.to_string()))?;
        match record.indexed_height {
            Some(current) if current >= height => Ok(current),
            _ => {
                record.indexed_height = Some(height);
                record.updated_at = OffsetDateTime::now_utc();
                Ok(height)
            }
        }
    }

    fn record_head_height(&self, id: &str, head: u64) -> Result<(), StoreError> {
        let mut chains = self.chains.write();
        let record = chains
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownChain(id.to_string()))?;
        record.head_height = head;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    fn set_status(&self, id: &str, status: ChainStatus) -> Result<(), StoreError> {
        let mut chains = self.chains.write();
        let record = chains
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownChain(id.to_string()))?;
        record.status = status;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

/// In-memory block store, height-ordered per chain with a hash index.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<BlockMaps>,
}

#[derive(Default)]
struct BlockMaps {
    by_height: HashMap<String, BTreeMap<u64, Block>>,
    height_by_hash: HashMap<(String, BlockHash), u64>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes persisted blocks in `start..=end`. Test hook for carving
    /// holes below the watermark.
    pub fn remove_range(&self, chain_id: &str, start: u64, end: u64) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(chain) = inner.by_height.get_mut(chain_id) {
            for height in start..=end {
                if let Some(block) = chain.remove(&height) {
                    inner
                        .height_by_hash
                        .remove(&(chain_id.to_string(), block.hash));
                }
            }
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_at(&self, chain_id: &str, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self
            .inner
            .read()
            .by_height
            .get(chain_id)
            .and_then(|chain| chain.get(&height))
            .cloned())
    }

    fn block_by_hash(&self, chain_id: &str, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        let inner = self.inner.read();
        let Some(height) = inner
            .height_by_hash
            .get(&(chain_id.to_string(), *hash))
            .copied()
        else {
            return Ok(None);
        };
        Ok(inner
            .by_height
            .get(chain_id)
            .and_then(|chain| chain.get(&height))
            .cloned())
    }

    fn blocks_in_range(
        &self,
        chain_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, StoreError> {
        Ok(self
            .inner
            .read()
            .by_height
            .get(chain_id)
            .map(|chain| chain.range(start..=end).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    fn heights_in_range(
        &self,
        chain_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .inner
            .read()
            .by_height
            .get(chain_id)
            .map(|chain| chain.range(start..=end).map(|(h, _)| *h).collect())
            .unwrap_or_default())
    }

    fn count_in_range(&self, chain_id: &str, start: u64, end: u64) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .by_height
            .get(chain_id)
            .map(|chain| chain.range(start..=end).count() as u64)
            .unwrap_or_default())
    }

    fn put_block(&self, block: Block) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(previous) = inner
            .by_height
            .entry(block.chain_id.clone())
            .or_default()
            .insert(block.height, block.clone())
        {
            inner
                .height_by_hash
                .remove(&(block.chain_id.clone(), previous.hash));
        }
        inner
            .height_by_hash
            .insert((block.chain_id.clone(), block.hash), block.height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transaction;

    fn test_block(chain_id: &str, height: u64) -> Block {
        Block {
            chain_id: chain_id.to_string(),
            height,
            hash: [height as u8 + 1; 32],
            parent_hash: [height as u8; 32],
            timestamp: height,
            transactions: vec![Transaction {
                hash: [height as u8 + 100; 32],
                payload: vec![],
            }],
        }
    }

    #[test]
    fn watermark_only_moves_forward() {
        let store = MemoryChainStore::new();
        store.upsert_chain(ChainRecord::new("c", 0)).unwrap();

        assert_eq!(store.advance_indexed_height("c", 5).unwrap(), 5);
        assert_eq!(store.advance_indexed_height("c", 3).unwrap(), 5);
        assert_eq!(store.advance_indexed_height("c", 5).unwrap(), 5);
        assert_eq!(store.advance_indexed_height("c", 9).unwrap(), 9);
        assert_eq!(store.chain("c").unwrap().unwrap().indexed_height, Some(9));
    }

    #[test]
    fn advance_on_unknown_chain_is_rejected() {
        let store = MemoryChainStore::new();
        assert!(matches!(
            store.advance_indexed_height("missing", 1),
            Err(StoreError::UnknownChain(_))
        ));
    }

    #[test]
    fn put_block_is_an_upsert() {
        let store = MemoryBlockStore::new();
        store.put_block(test_block("c", 4)).unwrap();
        store.put_block(test_block("c", 4)).unwrap();

        assert_eq!(store.count_in_range("c", 0, 10).unwrap(), 1);
        let block = store.block_at("c", 4).unwrap().unwrap();
        assert_eq!(store.block_by_hash("c", &block.hash).unwrap(), Some(block));
    }

    #[test]
    fn range_queries_are_ordered_and_bounded() {
        let store = MemoryBlockStore::new();
        for height in [7u64, 2, 0, 8, 1] {
            store.put_block(test_block("c", height)).unwrap();
        }

        assert_eq!(store.heights_in_range("c", 0, 8).unwrap(), vec![0, 1, 2, 7, 8]);
        assert_eq!(store.heights_in_range("c", 3, 6).unwrap(), Vec::<u64>::new());
        assert_eq!(store.count_in_range("c", 1, 7).unwrap(), 3);
        assert_eq!(store.blocks_in_range("other", 0, 8).unwrap(), vec![]);
    }
}
