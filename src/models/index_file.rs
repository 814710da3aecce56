//! Index files: one fixed-width object-id slot per height of a run.

use super::object::{OBJECT_ID_LEN, ObjectId};

/// Scratch buffer for one index run, reused across runs.
///
/// Slot `i` holds the identifier of the block at height `start + i`. The
/// buffer belongs to whoever drives the run; it is handed to the builder by
/// `&mut` and cleared, not reallocated, between runs.
#[derive(Debug)]
pub struct IndexBuffer {
    data: Vec<u8>,
    size: u32,
}

impl IndexBuffer {
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0u8; size as usize * OBJECT_ID_LEN],
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn range(slot: u32) -> std::ops::Range<usize> {
        let start = slot as usize * OBJECT_ID_LEN;
        start..start + OBJECT_ID_LEN
    }

    pub fn get(&self, slot: u32) -> ObjectId {
        ObjectId::from_slice(&self.data[Self::range(slot)]).unwrap_or(ObjectId::ZERO)
    }

    /// Write `id` into `slot` unless it is already taken.
    ///
    /// Returns `false` when the slot was already filled; the earlier writer
    /// wins.
    pub fn claim(&mut self, slot: u32, id: ObjectId) -> bool {
        if !self.get(slot).is_zero() {
            return false;
        }
        self.data[Self::range(slot)].copy_from_slice(id.as_bytes());
        true
    }

    /// Slots still holding the zero identifier, in ascending order.
    pub fn empty_slots(&self) -> Vec<u32> {
        (0..self.size).filter(|s| self.get(*s).is_zero()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.empty_slots().is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

/// Parse an index-file payload into its `size` identifiers.
///
/// A payload with an unfilled (zero) slot is rejected: a published index
/// names an object for every height of its run.
pub fn decode_index_payload(payload: &[u8], size: u32) -> Option<Vec<ObjectId>> {
    if payload.len() != size as usize * OBJECT_ID_LEN {
        return None;
    }
    payload
        .chunks_exact(OBJECT_ID_LEN)
        .map(|chunk| ObjectId::from_slice(chunk).filter(|id| !id.is_zero()))
        .collect()
}
