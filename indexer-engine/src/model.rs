use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

pub type BlockHash = [u8; 32];

/// Coarse synchronization status of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    /// No measurement taken yet.
    Unknown,
    /// Indexed height is trailing the chain head.
    Syncing,
    /// Indexed height is at or near the chain head.
    Synced,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
        }
    }
}

/// Persisted synchronization state of one chain.
#[derive(Debug, Clone)]
pub struct ChainRecord {
    pub id: String,
    /// First height this deployment indexes from.
    pub start_height: u64,
    /// Last observed chain head height.
    pub head_height: u64,
    /// Watermark: highest height fully persisted. `None` until the first
    /// block lands. Only ever advanced, never regressed.
    pub indexed_height: Option<u64>,
    pub status: ChainStatus,
    pub updated_at: OffsetDateTime,
}

impl ChainRecord {
    pub fn new(id: impl Into<String>, start_height: u64) -> Self {
        Self {
            id: id.into(),
            start_height,
            head_height: 0,
            indexed_height: None,
            status: ChainStatus::Unknown,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A block as handed over by the adapter. Opaque to the engine beyond
/// `(chain_id, height)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub chain_id: String,
    pub height: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: BlockHash,
    pub payload: Vec<u8>,
}
