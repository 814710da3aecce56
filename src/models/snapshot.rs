//! State-snapshot object layout.
//!
//! A snapshot payload is a fixed header followed by length-prefixed state
//! entries:
//!
//! ```text
//! "NSS1" | magic: u32 LE | height: u32 LE | state root: [u8; 32]
//! ( key_len: u32 LE | key | value_len: u32 LE | value )*
//! ```

use super::{block::Hash256, codec::put_var_bytes};

pub const SNAPSHOT_MARKER: &[u8; 4] = b"NSS1";
pub const SNAPSHOT_HEADER_LEN: usize = 4 + 4 + 4 + 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub height: u32,
    pub state_root: Hash256,
}

impl SnapshotHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN);
        out.extend_from_slice(SNAPSHOT_MARKER);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.state_root);
        out
    }
}

/// Append one state entry to `out`.
pub fn encode_entry(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    put_var_bytes(out, key);
    put_var_bytes(out, value);
}

/// Split a full snapshot payload into its header and entries.
#[cfg(test)]
pub fn decode_snapshot(payload: &[u8]) -> Option<(SnapshotHeader, Vec<(Vec<u8>, Vec<u8>)>)> {
    use super::codec::Reader;

    let mut r = Reader::new(payload);
    if r.bytes(4).ok()? != SNAPSHOT_MARKER {
        return None;
    }
    let header = SnapshotHeader {
        magic: r.u32().ok()?,
        height: r.u32().ok()?,
        state_root: r.hash().ok()?,
    };
    let mut entries = Vec::new();
    while r.remaining() > 0 {
        let key = r.var_bytes(usize::MAX).ok()?.to_vec();
        let value = r.var_bytes(usize::MAX).ok()?.to_vec();
        entries.push((key, value));
    }
    Some((header, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_entries() {
        let header = SnapshotHeader {
            magic: 860833102,
            height: 300,
            state_root: [5u8; 32],
        };
        let mut payload = header.encode();
        assert_eq!(payload.len(), SNAPSHOT_HEADER_LEN);
        encode_entry(&mut payload, b"k1", b"v1");
        encode_entry(&mut payload, b"k2", b"");

        let (decoded, entries) = decode_snapshot(&payload).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(
            entries,
            vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), Vec::new())]
        );
    }

    #[test]
    fn rejects_foreign_marker() {
        assert_eq!(decode_snapshot(b"XXXX"), None);
    }
}
