use crate::error::AdapterError;
use crate::model::{Block, BlockHash, Transaction};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Pull-based query interface of one chain. Implementations perform the
/// actual source I/O; failures are transient and retried by the engine on
/// the next scheduled tick.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> &str;

    /// Current tip height of the chain.
    async fn latest_height(&self) -> Result<u64, AdapterError>;

    /// Single block by height.
    async fn block_at(&self, height: u64) -> Result<Block, AdapterError>;

    /// All blocks in `start..=end`.
    async fn blocks_in_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError>;
}

/// In-memory chain source with a controllable head and injectable failures.
/// Backs the demo binary and the engine tests; not a network client.
pub struct SimulatedAdapter {
    chain_id: String,
    state: RwLock<SimState>,
}

struct SimState {
    blocks: Vec<Block>,
    failures_left: u32,
}

impl SimulatedAdapter {
    /// Creates the chain with a genesis block at height 0.
    pub fn new(chain_id: impl Into<String>) -> Self {
        let chain_id = chain_id.into();
        let genesis = synth_block(&chain_id, 0, [0u8; 32]);
        Self {
            chain_id,
            state: RwLock::new(SimState {
                blocks: vec![genesis],
                failures_left: 0,
            }),
        }
    }

    /// Appends `count` blocks to the tip.
    pub fn extend(&self, count: u64) {
        let mut state = self.state.write();
        for _ in 0..count {
            let parent = state.blocks.last().expect("genesis always present");
            let block = synth_block(&self.chain_id, parent.height + 1, parent.hash);
            state.blocks.push(block);
        }
    }

    pub fn head(&self) -> u64 {
        self.state.read().blocks.last().expect("genesis always present").height
    }

    /// The next `count` adapter calls fail with `AdapterError::Unavailable`.
    pub fn inject_failures(&self, count: u32) {
        self.state.write().failures_left = count;
    }

    fn take_failure(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(AdapterError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for SimulatedAdapter {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn latest_height(&self) -> Result<u64, AdapterError> {
        self.take_failure()?;
        Ok(self.head())
    }

    async fn block_at(&self, height: u64) -> Result<Block, AdapterError> {
        self.take_failure()?;
        self.state
            .read()
            .blocks
            .get(height as usize)
            .cloned()
            .ok_or(AdapterError::NotFound(height))
    }

    async fn blocks_in_range(&self, start: u64, end: u64) -> Result<Vec<Block>, AdapterError> {
        self.take_failure()?;
        let state = self.state.read();
        if end as usize >= state.blocks.len() {
            return Err(AdapterError::NotFound(state.blocks.len() as u64));
        }
        Ok(state.blocks[start as usize..=end as usize].to_vec())
    }
}

fn synth_block(chain_id: &str, height: u64, parent_hash: BlockHash) -> Block {
    let hash = synth_hash(chain_id, height, &parent_hash);
    let tx_hash = synth_hash(chain_id, height.wrapping_add(0x9e37_79b9), &hash);
    Block {
        chain_id: chain_id.to_string(),
        height,
        hash,
        parent_hash,
        timestamp: 1_700_000_000 + height,
        transactions: vec![Transaction {
            hash: tx_hash,
            payload: height.to_be_bytes().to_vec(),
        }],
    }
}

fn synth_hash(chain_id: &str, height: u64, parent: &BlockHash) -> BlockHash {
    let mut seed = 0xcbf2_9ce4_8422_2325u64;
    for b in chain_id.bytes() {
        seed = (seed ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    seed ^= height.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut hash = [0u8; 32];
    for (i, chunk) in hash.chunks_mut(8).enumerate() {
        seed ^= u64::from_be_bytes(parent[i * 8..i * 8 + 8].try_into().expect("8-byte chunk"));
        seed = seed.wrapping_mul(0x2545_f491_4f6c_dd1d).rotate_left(27);
        chunk.copy_from_slice(&seed.to_be_bytes());
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_chain_extends_and_serves_ranges() {
        let adapter = SimulatedAdapter::new("testnet");
        assert_eq!(adapter.latest_height().await.unwrap(), 0);

        adapter.extend(10);
        assert_eq!(adapter.latest_height().await.unwrap(), 10);

        let blocks = adapter.blocks_in_range(3, 7).await.unwrap();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].height, 3);
        assert_eq!(blocks[4].height, 7);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].hash);
        }
    }

    #[tokio::test]
    async fn range_past_head_is_not_found() {
        let adapter = SimulatedAdapter::new("testnet");
        adapter.extend(5);
        assert!(matches!(
            adapter.blocks_in_range(3, 9).await,
            Err(AdapterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let adapter = SimulatedAdapter::new("testnet");
        adapter.inject_failures(2);
        assert!(adapter.latest_height().await.is_err());
        assert!(adapter.latest_height().await.is_err());
        assert!(adapter.latest_height().await.is_ok());
    }
}
