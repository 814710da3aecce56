//! Index-file assembly and resume-point discovery.
//!
//! An index file covers the run `[k * S, (k + 1) * S)` and stores the object
//! id of each block in slot `height - k * S`. When the store holds more than
//! one object for a height, the slot goes to whichever read completes first.
//! That choice is not stable between runs; the audit pass later removes the
//! objects the index does not point to.

use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{collections::HashSet, pin::pin, sync::Arc};
use tracing::{debug, info, warn};

use super::{
    block_uploader::known_blocks,
    checksum::payload_checksums,
    object_store::{ObjectStore, search_all},
    retry::RetryExecutor,
    search::RangeSearch,
};
use crate::{
    config::{ArchiveConfig, AttributeKeys, ResumePolicy},
    errors::{ArchiveError, ArchiveResult},
    models::{
        index_file::IndexBuffer,
        object::{Attribute, ObjectHeader, ObjectId, SearchFilter, SearchRequest},
    },
};

#[derive(Clone)]
pub struct IndexBuilder {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    search: RangeSearch,
    container: String,
    owner: String,
    keys: Arc<AttributeKeys>,
    index_size: u32,
    batch_size: u32,
    readers: usize,
    homomorphic: bool,
}

impl IndexBuilder {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        config: &ArchiveConfig,
        homomorphic: bool,
    ) -> Self {
        let search = RangeSearch::new(
            store.clone(),
            retry.clone(),
            config.container.clone(),
            config.batch_size,
            config.search_workers,
        );
        Self {
            store,
            retry,
            search,
            container: config.container.clone(),
            owner: config.owner.clone(),
            keys: Arc::new(config.keys.clone()),
            index_size: config.index_size,
            batch_size: config.batch_size,
            readers: config.search_workers.max(1),
            homomorphic,
        }
    }

    fn run_bounds(&self, index_id: u32) -> ArchiveResult<(u32, u32)> {
        index_id
            .checked_mul(self.index_size)
            .and_then(|start| Some((start, start.checked_add(self.index_size)?)))
            .ok_or_else(|| ArchiveError::Config(format!("index {index_id} is out of height range")))
    }

    /// Build and upload the index file for run `index_id`.
    ///
    /// `buffer` is cleared before returning, whatever the outcome.
    pub async fn build(&self, index_id: u32, buffer: &mut IndexBuffer) -> ArchiveResult<ObjectId> {
        if buffer.size() != self.index_size {
            return Err(ArchiveError::Config(format!(
                "index buffer holds {} slots, index size is {}",
                buffer.size(),
                self.index_size
            )));
        }
        let result = self.fill_and_upload(index_id, buffer).await;
        buffer.clear();
        result
    }

    async fn fill_and_upload(&self, index_id: u32, buffer: &mut IndexBuffer) -> ArchiveResult<ObjectId> {
        let (start, end) = self.run_bounds(index_id)?;
        buffer.clear();

        self.scan(start, end, buffer).await?;

        if !buffer.is_complete() {
            let gaps = buffer.empty_slots();
            debug!(index_id, gaps = gaps.len(), "repairing index slots");
            self.repair(start, &gaps, buffer).await?;
        }
        if let Some(slot) = buffer.empty_slots().first() {
            return Err(ArchiveError::MissingBlock {
                height: start + slot,
                index_id,
            });
        }

        self.upload(index_id, buffer).await
    }

    /// Range-search the run and claim a slot for every hit.
    async fn scan(&self, start: u32, end: u32, buffer: &mut IndexBuffer) -> ArchiveResult<()> {
        let hits = self.search.search(&self.keys.block, start, end, Vec::new());
        let hits = stream::unfold(hits, |mut hits| async move {
            hits.next().await.map(|item| (item, hits))
        });
        let mut reads = pin!(
            hits.map(|item| async move {
                let id = item?.id;
                let height = self.read_height(id).await?;
                Ok::<_, ArchiveError>((height, id))
            })
            .buffer_unordered(self.readers)
        );

        while let Some(read) = reads.next().await {
            let (height, id) = read?;
            if !(start..end).contains(&height) {
                warn!(height, %id, start, end, "search returned a block outside the run");
                continue;
            }
            if !buffer.claim(height - start, id) {
                debug!(height, %id, "second object for height, keeping the first");
            }
        }
        Ok(())
    }

    async fn read_height(&self, id: ObjectId) -> ArchiveResult<u32> {
        let header = self
            .retry
            .retry(&format!("head {id}"), || async {
                self.store
                    .head(&self.container, id)
                    .await
                    .map_err(ArchiveError::from)
            })
            .await?;
        header
            .numeric_attribute(&self.keys.block)
            .and_then(|h| u32::try_from(h).ok())
            .ok_or_else(|| ArchiveError::Malformed {
                id,
                what: format!("{} attribute", self.keys.block),
            })
    }

    /// Query each empty slot on its own and take the first hit.
    async fn repair(&self, start: u32, gaps: &[u32], buffer: &mut IndexBuffer) -> ArchiveResult<()> {
        let single = self.search.with_parallelism(1);
        for &slot in gaps {
            let height = start + slot;
            let mut hits = single.search(&self.keys.block, height, height + 1, Vec::new());
            if let Some(item) = hits.next().await.transpose()? {
                info!(height, id = %item.id, "repaired index slot");
                buffer.claim(slot, item.id);
            }
        }
        Ok(())
    }

    async fn upload(&self, index_id: u32, buffer: &IndexBuffer) -> ArchiveResult<ObjectId> {
        let payload = Bytes::copy_from_slice(buffer.as_bytes());
        let (checksum, homomorphic) = payload_checksums(&payload, self.homomorphic);
        let mut header = ObjectHeader::new(&self.container, &self.owner);
        header.attributes = vec![
            Attribute::new(&self.keys.index, index_id),
            Attribute::new(&self.keys.index_size, self.index_size),
        ];
        header.checksum = Some(checksum);
        header.homomorphic_checksum = homomorphic;

        let id = self
            .retry
            .retry(&format!("put index {index_id}"), || {
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
                what: format!("index {index_id}"),
            });
        }
        info!(index_id, %id, "uploaded index file");
        Ok(id)
    }

    /// Every stored index file for `index_id`, in search order.
    pub async fn index_objects(&self, index_id: u32) -> ArchiveResult<Vec<ObjectId>> {
        let request = SearchRequest {
            filters: vec![
                SearchFilter::equal(&self.keys.index, index_id),
                SearchFilter::equal(&self.keys.index_size, self.index_size),
            ],
            ..Default::default()
        };
        let items = self
            .retry
            .retry(&format!("search index {index_id}"), || async {
                search_all(self.store.as_ref(), &self.container, request.clone())
                    .await
                    .map_err(ArchiveError::from)
            })
            .await?;
        Ok(items.into_iter().map(|item| item.id).collect())
    }

    /// Start of the lowest incomplete or absent stretch below `chain_height`.
    ///
    /// The index-count policy returns a run start, the batch-search policy a
    /// batch start; either way everything below the returned height is
    /// archived.
    pub async fn resume_point(&self, chain_height: u32, policy: ResumePolicy) -> ArchiveResult<u32> {
        let resume = match policy {
            ResumePolicy::IndexCount => self.resume_by_index_count(chain_height).await?,
            ResumePolicy::BatchSearch => self.resume_by_batch_search(chain_height).await?,
        };
        info!(?policy, resume, chain_height, "found resume point");
        Ok(resume)
    }

    async fn resume_by_index_count(&self, chain_height: u32) -> ArchiveResult<u32> {
        let mut index_id = 0u32;
        loop {
            let (start, end) = self.run_bounds(index_id)?;
            if end > chain_height || self.index_objects(index_id).await?.is_empty() {
                return Ok(start);
            }
            index_id += 1;
        }
    }

    async fn resume_by_batch_search(&self, chain_height: u32) -> ArchiveResult<u32> {
        if chain_height == 0 {
            return Ok(0);
        }
        let mut batch_start = (chain_height - 1) / self.batch_size * self.batch_size;
        loop {
            let batch_end = batch_start.saturating_add(self.batch_size).min(chain_height);
            let found = known_blocks(&self.search, &self.keys.block, batch_start, batch_end).await?;
            let heights: HashSet<u32> = found.into_keys().collect();
            if heights.len() as u32 == batch_end - batch_start {
                return Ok(batch_end);
            }
            debug!(batch_start, present = heights.len(), "batch incomplete, stepping back");
            match batch_start.checked_sub(self.batch_size) {
                Some(previous) => batch_start = previous,
                None => return Ok(0),
            }
        }
    }
}
