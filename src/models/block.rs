//! Ledger blocks and their canonical binary form.

use super::codec::{CodecError, Reader, put_var_bytes};
use sha2::{Digest, Sha256};

/// Upper bound on transactions per block accepted by the decoder.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 65_535;
/// Upper bound on a single serialized transaction.
pub const MAX_TRANSACTION_SIZE: usize = 4 * 1024 * 1024;

/// A 32-byte hash as used for block hashes and state roots.
pub type Hash256 = [u8; 32];

/// An immutable ledger block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub nonce: u64,
    /// Height of the block.
    pub index: u32,
    pub primary_index: u8,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    fn encode_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.push(self.primary_index);
    }

    /// SHA-256 over the encoded header.
    pub fn hash(&self) -> Hash256 {
        let mut header = Vec::with_capacity(117);
        self.encode_header(&mut header);
        Sha256::digest(&header).into()
    }

    /// Canonical serialization: header, transaction count, then each
    /// transaction length-prefixed.
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self.transactions.iter().map(|tx| tx.len() + 4).sum();
        let mut out = Vec::with_capacity(121 + body);
        self.encode_header(&mut out);
        out.extend_from_slice(&(self.transactions.len() as u32).to_le_bytes());
        for tx in &self.transactions {
            put_var_bytes(&mut out, tx);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let block = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(block)
    }

    pub(crate) fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.u32()?;
        let prev_hash = r.hash()?;
        let merkle_root = r.hash()?;
        let timestamp = r.u64()?;
        let nonce = r.u64()?;
        let index = r.u32()?;
        let primary_index = r.u8()?;
        let count = r.u32()? as usize;
        if count > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(CodecError::TooLarge {
                len: count,
                limit: MAX_TRANSACTIONS_PER_BLOCK,
            });
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(r.var_bytes(MAX_TRANSACTION_SIZE)?.to_vec());
        }
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            nonce,
            index,
            primary_index,
            transactions,
        })
    }
}
