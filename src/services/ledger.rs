//! The chain collaborator: a read-only source of sequential blocks and state
//! snapshots, plus a chain-dump backed implementation.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::{io, path::Path};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::models::{
    block::{Block, Hash256},
    codec::{CodecError, Reader},
};

/// Largest block record accepted from a chain dump.
const MAX_DUMP_RECORD: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("block {0} not found")]
    BlockNotFound(u32),
    #[error("ledger does not retain full state")]
    StateNotRetained,
    #[error("inconsistent chain data: {0}")]
    Inconsistent(String),
    #[error("malformed chain dump: {0}")]
    Dump(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::BlockNotFound(_) | LedgerError::Io(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// A state-trie entry yielded by [`Ledger::seek_states`].
pub type StateEntry = (Vec<u8>, Vec<u8>);

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Network magic of the chain.
    async fn network_magic(&self) -> LedgerResult<u32>;

    /// Number of blocks, i.e. the height of the next block to be produced.
    async fn block_count(&self) -> LedgerResult<u32>;

    async fn block(&self, index: u32) -> LedgerResult<Block>;

    /// State-root commitment at `index`.
    async fn state_root(&self, index: u32) -> LedgerResult<Hash256>;

    /// Depth-first walk of every trie node reachable from `root` whose key
    /// starts with `prefix`. Each node is yielded exactly once.
    fn seek_states(&self, root: Hash256, prefix: &[u8]) -> BoxStream<'static, LedgerResult<StateEntry>>;

    /// Whether historical state is kept for every height.
    fn keeps_full_state(&self) -> bool;
}

/// A ledger served from a chain dump file.
///
/// Layout: `start: u32 LE | count: u32 LE | (len: u32 LE | block)*`, blocks
/// in ascending height. Archives begin at genesis, so only dumps with
/// `start == 0` are accepted. Dumps carry no state.
pub struct DumpLedger {
    magic: u32,
    blocks: Vec<Block>,
}

impl DumpLedger {
    /// Load the whole dump into memory.
    pub async fn open(path: impl AsRef<Path>, magic: u32) -> LedgerResult<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).await?;
        let ledger = Self::from_bytes(&raw, magic)?;
        info!(
            path = %path.display(),
            blocks = ledger.blocks.len(),
            "loaded chain dump"
        );
        Ok(ledger)
    }

    pub fn from_bytes(raw: &[u8], magic: u32) -> LedgerResult<Self> {
        let mut r = Reader::new(raw);
        let start = r.u32()?;
        if start != 0 {
            return Err(LedgerError::Inconsistent(format!(
                "dump starts at block {start}, archives start at genesis"
            )));
        }
        let count = r.u32()?;
        let mut blocks = Vec::with_capacity(count.min(1 << 20) as usize);
        for expected in 0..count {
            let block = Block::decode(r.var_bytes(MAX_DUMP_RECORD)?)?;
            if block.index != expected {
                return Err(LedgerError::Inconsistent(format!(
                    "record {} holds block {}",
                    expected, block.index
                )));
            }
            blocks.push(block);
        }
        r.finish()?;
        Ok(Self { magic, blocks })
    }
}

#[async_trait]
impl Ledger for DumpLedger {
    async fn network_magic(&self) -> LedgerResult<u32> {
        Ok(self.magic)
    }

    async fn block_count(&self) -> LedgerResult<u32> {
        u32::try_from(self.blocks.len())
            .map_err(|_| LedgerError::Inconsistent("block count exceeds u32".into()))
    }

    async fn block(&self, index: u32) -> LedgerResult<Block> {
        self.blocks
            .get(index as usize)
            .cloned()
            .ok_or(LedgerError::BlockNotFound(index))
    }

    async fn state_root(&self, _index: u32) -> LedgerResult<Hash256> {
        Err(LedgerError::StateNotRetained)
    }

    fn seek_states(&self, _root: Hash256, _prefix: &[u8]) -> BoxStream<'static, LedgerResult<StateEntry>> {
        Box::pin(stream::once(async { Err(LedgerError::StateNotRetained) }))
    }

    fn keeps_full_state(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::codec::put_var_bytes, test_utils::make_block};

    fn encode_dump(start: u32, blocks: &[Block]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for block in blocks {
            put_var_bytes(&mut out, &block.encode());
        }
        out
    }

    #[tokio::test]
    async fn dump_ledger_serves_blocks_from_genesis() {
        let blocks: Vec<Block> = (0..3).map(make_block).collect();
        let ledger = DumpLedger::from_bytes(&encode_dump(0, &blocks), 7).unwrap();

        assert_eq!(ledger.block_count().await.unwrap(), 3);
        assert_eq!(ledger.block(1).await.unwrap(), blocks[1]);
        assert!(matches!(
            ledger.block(3).await,
            Err(LedgerError::BlockNotFound(3))
        ));
        assert!(!ledger.keeps_full_state());
    }

    #[test]
    fn dump_not_starting_at_genesis_is_rejected() {
        let blocks: Vec<Block> = (5..8).map(make_block).collect();
        assert!(matches!(
            DumpLedger::from_bytes(&encode_dump(5, &blocks), 7),
            Err(LedgerError::Inconsistent(_))
        ));
    }

    #[test]
    fn dump_with_overflowing_header_is_rejected() {
        let mut raw = encode_dump(u32::MAX, &[make_block(0)]);
        assert!(matches!(
            DumpLedger::from_bytes(&raw, 7),
            Err(LedgerError::Inconsistent(_))
        ));

        // A count far beyond the records present runs out of input.
        raw[..8].copy_from_slice(&[0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            DumpLedger::from_bytes(&raw, 7),
            Err(LedgerError::Dump(_))
        ));
    }

    #[test]
    fn dump_with_out_of_order_blocks_is_rejected() {
        let blocks = vec![make_block(0), make_block(2)];
        assert!(matches!(
            DumpLedger::from_bytes(&encode_dump(0, &blocks), 7),
            Err(LedgerError::Inconsistent(_))
        ));
    }

    #[tokio::test]
    async fn dump_ledger_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.acc");
        std::fs::write(&path, encode_dump(0, &[make_block(0)])).unwrap();
        let ledger = DumpLedger::open(&path, 1).await.unwrap();
        assert_eq!(ledger.block_count().await.unwrap(), 1);
        assert_eq!(ledger.network_magic().await.unwrap(), 1);
    }
}
