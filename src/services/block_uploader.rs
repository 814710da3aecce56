//! Uploads ledger blocks as attribute-tagged objects.

use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    checksum::payload_checksums, ledger::Ledger, ledger::LedgerError, object_store::ObjectStore,
    retry::RetryExecutor, search::RangeSearch,
};
use crate::{
    config::AttributeKeys,
    errors::{ArchiveError, ArchiveResult, ErrorSlot},
    models::{
        block::Block,
        object::{Attribute, ObjectHeader, ObjectId},
    },
};

/// Heights already present in the store, with the object recorded for each.
pub type KnownBlocks = HashMap<u32, ObjectId>;

/// Block objects found in `[start, end)`, first hit per height.
pub async fn known_blocks(
    search: &RangeSearch,
    key: &str,
    start: u32,
    end: u32,
) -> ArchiveResult<KnownBlocks> {
    let mut known = KnownBlocks::new();
    let mut hits = search.search(key, start, end, vec![key.to_string()]);
    while let Some(item) = hits.next().await {
        let item = item?;
        let height = item
            .attributes
            .first()
            .and_then(|value| value.parse::<u32>().ok())
            .ok_or_else(|| ArchiveError::Malformed {
                id: item.id,
                what: format!("{key} attribute"),
            })?;
        known.entry(height).or_insert(item.id);
    }
    Ok(known)
}

#[derive(Clone)]
pub struct BlockUploader {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    container: String,
    owner: String,
    keys: Arc<AttributeKeys>,
    homomorphic: bool,
}

impl BlockUploader {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        container: impl Into<String>,
        owner: impl Into<String>,
        keys: Arc<AttributeKeys>,
        homomorphic: bool,
    ) -> Self {
        Self {
            ledger,
            store,
            retry,
            container: container.into(),
            owner: owner.into(),
            keys,
            homomorphic,
        }
    }

    fn block_header(&self, block: &Block, checksum: String, homomorphic: Option<String>) -> ObjectHeader {
        let keys = &self.keys;
        let mut header = ObjectHeader::new(&self.container, &self.owner);
        header.attributes = vec![
            Attribute::new(&keys.block, block.index),
            Attribute::new(&keys.primary, block.primary_index),
            Attribute::new(&keys.hash, hex::encode(block.hash())),
            Attribute::new(&keys.prev_hash, hex::encode(block.prev_hash)),
            Attribute::new(&keys.timestamp, block.timestamp),
        ];
        header.checksum = Some(checksum);
        header.homomorphic_checksum = homomorphic;
        header
    }

    /// Upload the block at `height` unless `known` already has it.
    pub async fn upload_block(&self, height: u32, known: &KnownBlocks) -> ArchiveResult<ObjectId> {
        if let Some(id) = known.get(&height) {
            return Ok(*id);
        }

        let block = self
            .retry
            .retry(&format!("fetch block {height}"), || async {
                self.ledger.block(height).await.map_err(ArchiveError::from)
            })
            .await?;
        if block.index != height {
            return Err(LedgerError::Inconsistent(format!(
                "asked for block {}, got block {}",
                height, block.index
            ))
            .into());
        }

        let payload = Bytes::from(block.encode());
        let (checksum, homomorphic) = payload_checksums(&payload, self.homomorphic);
        let header = self.block_header(&block, checksum, homomorphic);

        let id = self
            .retry
            .retry(&format!("put block {height}"), || {
                let header = header.clone();
                let payload = payload.clone();
                async move {
                    self.store
                        .put(header, payload)
                        .await
                        .map_err(ArchiveError::from)
                }
            })
            .await?;
        if id.is_zero() {
            return Err(ArchiveError::EmptyObjectId {
                what: format!("block {height}"),
            });
        }
        debug!(height, %id, "uploaded block");
        Ok(id)
    }

    /// Upload every height of `[start, end)` missing from `known`.
    ///
    /// `workers` tasks split the range round-robin: worker `i` takes
    /// `start + i`, `start + i + workers`, and so on. The first failure
    /// cancels the other workers and is returned once they have stopped.
    pub async fn upload_batch(
        &self,
        start: u32,
        end: u32,
        known: Arc<KnownBlocks>,
        workers: usize,
    ) -> ArchiveResult<Vec<(u32, ObjectId)>> {
        let workers = workers.max(1);
        let cancel = self.retry.cancel_token().child_token();
        let (slot, mut errors) = ErrorSlot::new();
        let mut tasks = JoinSet::new();

        for worker in 0..workers {
            let Some(first) = start.checked_add(worker as u32).filter(|h| *h < end) else {
                break;
            };
            let uploader = BlockUploader {
                retry: self.retry.with_token(cancel.clone()),
                ..self.clone()
            };
            let known = known.clone();
            let slot = slot.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut uploaded = Vec::new();
                let mut height = first;
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if !known.contains_key(&height) {
                        match uploader.upload_block(height, &known).await {
                            Ok(id) => uploaded.push((height, id)),
                            Err(err) => {
                                if !matches!(err, ArchiveError::Cancelled) {
                                    warn!(height, error = %err, "block upload failed");
                                }
                                slot.report(err);
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                    match height.checked_add(workers as u32).filter(|h| *h < end) {
                        Some(next) => height = next,
                        None => break,
                    }
                }
                uploaded
            });
        }
        drop(slot);

        let mut uploaded = Vec::new();
        loop {
            tokio::select! {
                biased;
                Some(err) = errors.recv() => {
                    cancel.cancel();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
                joined = tasks.join_next() => match joined {
                    Some(done) => uploaded.extend(done?),
                    None => break,
                },
            }
        }
        if let Some(err) = errors.take() {
            return Err(err);
        }

        uploaded.sort_unstable_by_key(|(height, _)| *height);
        Ok(uploaded)
    }
}
