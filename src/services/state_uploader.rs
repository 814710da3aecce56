//! Periodic state-snapshot export.
//!
//! Every height `k * interval` (k >= 1) up to the chain tip gets one
//! snapshot object. The payload is streamed straight from the ledger's
//! state traversal into a single put; a traversal failure aborts the put so
//! no partial snapshot is ever stored.

use bytes::Bytes;
use futures::{StreamExt, future, stream};
use std::{collections::HashSet, io, sync::Arc};
use tracing::{debug, info};

use super::{
    block_uploader::known_blocks,
    ledger::{Ledger, LedgerError},
    object_store::{ObjectStore, PayloadStream},
    retry::RetryExecutor,
    search::RangeSearch,
};
use crate::{
    config::{ArchiveConfig, AttributeKeys},
    errors::{ArchiveError, ArchiveResult, ErrorSlot},
    models::{
        block::Hash256,
        object::{Attribute, ObjectHeader, ObjectId},
        snapshot::{SnapshotHeader, encode_entry},
    },
};

pub struct StateUploader {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    search: RangeSearch,
    container: String,
    owner: String,
    keys: Arc<AttributeKeys>,
    interval: u32,
}

impl StateUploader {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        config: &ArchiveConfig,
    ) -> Self {
        let search = RangeSearch::new(
            store.clone(),
            retry.clone(),
            config.container.clone(),
            config.batch_size,
            config.search_workers,
        );
        Self {
            ledger,
            store,
            retry,
            search,
            container: config.container.clone(),
            owner: config.owner.clone(),
            keys: Arc::new(config.keys.clone()),
            interval: config.sync_interval.max(1),
        }
    }

    /// Snapshot heights at or below the tip of a chain with `chain_height`
    /// blocks that have no snapshot object yet, ascending.
    pub async fn pending_heights(&self, chain_height: u32) -> ArchiveResult<Vec<u32>> {
        let Some(tip) = chain_height.checked_sub(1) else {
            return Ok(Vec::new());
        };
        let exported: HashSet<u32> =
            known_blocks(&self.search, &self.keys.state, self.interval, chain_height)
                .await?
                .into_keys()
                .collect();
        Ok((1u32..)
            .map_while(|k| k.checked_mul(self.interval))
            .take_while(|height| *height <= tip)
            .filter(|height| !exported.contains(height))
            .collect())
    }

    /// Export every pending snapshot, in height order. Stops at the first
    /// failure.
    pub async fn upload_pending(&self) -> ArchiveResult<Vec<(u32, ObjectId)>> {
        if !self.ledger.keeps_full_state() {
            return Err(ArchiveError::StateNotRetained);
        }
        let magic = self
            .retry
            .retry("fetch network magic", || async {
                self.ledger.network_magic().await.map_err(ArchiveError::from)
            })
            .await?;
        let chain_height = self
            .retry
            .retry("fetch block count", || async {
                self.ledger.block_count().await.map_err(ArchiveError::from)
            })
            .await?;

        let pending = self.pending_heights(chain_height).await?;
        info!(chain_height, pending = pending.len(), "exporting state snapshots");
        let mut uploaded = Vec::with_capacity(pending.len());
        for height in pending {
            let id = self.upload_snapshot(height, magic).await?;
            uploaded.push((height, id));
        }
        Ok(uploaded)
    }

    /// Stream the snapshot at `height` into one object.
    pub async fn upload_snapshot(&self, height: u32, magic: u32) -> ArchiveResult<ObjectId> {
        let root = self
            .retry
            .retry(&format!("fetch state root {height}"), || async {
                self.ledger.state_root(height).await.map_err(ArchiveError::from)
            })
            .await?;

        let mut header = ObjectHeader::new(&self.container, &self.owner);
        header.attributes = vec![
            Attribute::new(&self.keys.state, height),
            Attribute::new(&self.keys.state_root, hex::encode(root)),
            Attribute::new(&self.keys.state_sync_interval, self.interval),
        ];

        let id = self
            .retry
            .retry(&format!("put state {height}"), || {
                let header = header.clone();
                async move {
                    let (slot, mut traversal) = ErrorSlot::new();
                    let payload = self.snapshot_stream(height, magic, root, slot);
                    let put = self.store.put_stream(header, payload).await;
                    // A broken traversal is not something a retry can fix.
                    if let Some(err) = traversal.take() {
                        return Err(err);
                    }
                    put.map_err(ArchiveError::from)
                }
            })
            .await?;
        if id.is_zero() {
            return Err(ArchiveError::EmptyObjectId {
                what: format!("state {height}"),
            });
        }
        info!(height, %id, root = %hex::encode(root), "uploaded state snapshot");
        Ok(id)
    }

    fn snapshot_stream(&self, height: u32, magic: u32, root: Hash256, slot: ErrorSlot) -> PayloadStream {
        let head = SnapshotHeader {
            magic,
            height,
            state_root: root,
        }
        .encode();
        let entries = self
            .ledger
            .seek_states(root, &[])
            .map(move |entry| match entry {
                Ok((key, value)) => {
                    let mut chunk = Vec::with_capacity(key.len() + value.len() + 8);
                    encode_entry(&mut chunk, &key, &value);
                    Ok(Bytes::from(chunk))
                }
                Err(err) => {
                    debug!(height, error = %err, "state traversal failed");
                    let message = err.to_string();
                    slot.report(
                        LedgerError::Inconsistent(format!(
                            "state traversal at height {height} failed: {message}"
                        ))
                        .into(),
                    );
                    Err(io::Error::other(message))
                }
            });
        stream::once(future::ready(Ok(Bytes::from(head))))
            .chain(entries)
            .boxed()
    }
}
