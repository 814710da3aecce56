//! Top-level workflows: upload, audit and state export.
//!
//! Each workflow first checks that the container belongs to the chain being
//! archived. Upload then walks the chain batch by batch from the resume
//! point; a batch only starts once the previous one, and the index file it
//! may have completed, are stored.

use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    auditor::{AuditReport, Auditor},
    block_uploader::{BlockUploader, known_blocks},
    index_builder::IndexBuilder,
    ledger::Ledger,
    object_store::{ContainerInfo, MAGIC_ATTR, ObjectStore, search_all},
    retry::RetryExecutor,
    search::RangeSearch,
    state_uploader::StateUploader,
};
use crate::{
    config::{ArchiveConfig, AttributeKeys},
    errors::{ArchiveError, ArchiveResult},
    models::{
        index_file::IndexBuffer,
        object::{ObjectId, SearchFilter, SearchRequest},
    },
};

/// Outcome of one upload run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub chain_height: u32,
    pub resumed_from: u32,
    pub blocks_uploaded: u64,
    pub indexes_uploaded: u64,
}

pub struct Archiver {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    config: ArchiveConfig,
}

impl Archiver {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        config: ArchiveConfig,
        cancel: CancellationToken,
    ) -> Self {
        let retry = RetryExecutor::new(config.retry_config(), cancel);
        Self {
            ledger,
            store,
            retry,
            config,
        }
    }

    /// Fail unless the configuration is usable, the container exists and
    /// its magic matches the chain.
    pub async fn check_container(&self) -> ArchiveResult<ContainerInfo> {
        self.config.validate()?;
        let container = self
            .retry
            .retry("fetch container", || async {
                self.store
                    .container(&self.config.container)
                    .await
                    .map_err(ArchiveError::from)
            })
            .await?;
        let magic = self
            .retry
            .retry("fetch network magic", || async {
                self.ledger.network_magic().await.map_err(ArchiveError::from)
            })
            .await?;
        let found = container.attribute(MAGIC_ATTR);
        if found != Some(magic.to_string().as_str()) {
            return Err(ArchiveError::MagicMismatch {
                container: container.id.clone(),
                expected: magic,
                found: found.map(str::to_string),
            });
        }
        Ok(container)
    }

    async fn chain_height(&self) -> ArchiveResult<u32> {
        self.retry
            .retry("fetch block count", || async {
                self.ledger.block_count().await.map_err(ArchiveError::from)
            })
            .await
    }

    /// Archive every block below the chain height and index each completed run.
    pub async fn run_upload(&self) -> ArchiveResult<UploadReport> {
        let container = self.check_container().await?;
        let homomorphic = container.homomorphic_hashing() && !self.config.disable_homomorphic;
        let config = &self.config;
        let chain_height = self.chain_height().await?;

        let builder = IndexBuilder::new(self.store.clone(), self.retry.clone(), config, homomorphic);
        let uploader = BlockUploader::new(
            self.ledger.clone(),
            self.store.clone(),
            self.retry.clone(),
            config.container.clone(),
            config.owner.clone(),
            Arc::new(config.keys.clone()),
            homomorphic,
        );
        let search = RangeSearch::new(
            self.store.clone(),
            self.retry.clone(),
            config.container.clone(),
            config.batch_size,
            config.search_workers,
        );

        let resume = builder.resume_point(chain_height, config.resume_policy).await?;
        let mut report = UploadReport {
            chain_height,
            resumed_from: resume,
            ..Default::default()
        };
        let index_size = config.index_size;
        let mut buffer = IndexBuffer::new(index_size);

        // The run just below the resume point may have all its blocks but
        // no index file yet.
        if resume >= index_size && resume % index_size == 0 {
            let previous = resume / index_size - 1;
            if self.ensure_index(&builder, previous, &mut buffer).await? {
                report.indexes_uploaded += 1;
            }
        }

        let mut start = resume;
        while start < chain_height {
            if self.retry.cancel_token().is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let end = (start - start % config.batch_size)
                .saturating_add(config.batch_size)
                .min(chain_height);

            let known = known_blocks(&search, &config.keys.block, start, end).await?;
            let uploaded = uploader
                .upload_batch(start, end, Arc::new(known), config.upload_workers)
                .await?;
            report.blocks_uploaded += uploaded.len() as u64;
            info!(start, end, uploaded = uploaded.len(), "batch archived");

            if end % index_size == 0 {
                let index_id = end / index_size - 1;
                if self.ensure_index(&builder, index_id, &mut buffer).await? {
                    report.indexes_uploaded += 1;
                }
            }
            start = end;
        }

        info!(?report, "upload finished");
        Ok(report)
    }

    /// Build the index file for `index_id` unless one is stored already.
    async fn ensure_index(
        &self,
        builder: &IndexBuilder,
        index_id: u32,
        buffer: &mut IndexBuffer,
    ) -> ArchiveResult<bool> {
        if !builder.index_objects(index_id).await?.is_empty() {
            return Ok(false);
        }
        builder.build(index_id, buffer).await?;
        Ok(true)
    }

    /// Audit index runs `[from_index, to_index)`. The upper bound defaults
    /// to the number of complete runs on the chain.
    pub async fn run_audit(
        &self,
        from_index: Option<u32>,
        to_index: Option<u32>,
        dry_run: bool,
    ) -> ArchiveResult<AuditReport> {
        self.check_container().await?;
        let from = from_index.unwrap_or(0);
        let to = match to_index {
            Some(to) => to,
            None => self.chain_height().await? / self.config.index_size,
        };
        if from > to {
            return Err(ArchiveError::Config(format!(
                "audit range [{from}, {to}) is empty"
            )));
        }
        info!(from, to, dry_run, "auditing index runs");
        Auditor::new(self.store.clone(), self.retry.clone(), &self.config, dry_run)
            .audit(from, to)
            .await
    }

    /// Export every missing state snapshot.
    pub async fn run_state_upload(&self) -> ArchiveResult<Vec<(u32, ObjectId)>> {
        self.config.validate()?;
        if !self.ledger.keeps_full_state() {
            return Err(ArchiveError::StateNotRetained);
        }
        self.check_container().await?;
        StateUploader::new(
            self.ledger.clone(),
            self.store.clone(),
            self.retry.clone(),
            &self.config,
        )
        .upload_pending()
        .await
    }
}

/// Object counts of an archive container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStatus {
    pub container: String,
    pub blocks: usize,
    pub indexes: usize,
    pub states: usize,
    /// Lowest index id without an index file.
    pub first_absent_index: u32,
}

impl ArchiveStatus {
    pub async fn collect(
        store: &dyn ObjectStore,
        container: &str,
        keys: &AttributeKeys,
    ) -> ArchiveResult<Self> {
        store.container(container).await?;
        let tagged = |key: &str| SearchRequest {
            filters: vec![SearchFilter::greater_or_equal(key, 0)],
            attributes: vec![key.to_string()],
            cursor: None,
        };
        let blocks = search_all(store, container, tagged(&keys.block)).await?;
        let indexes = search_all(store, container, tagged(&keys.index)).await?;
        let states = search_all(store, container, tagged(&keys.state)).await?;

        let index_ids: BTreeSet<u32> = indexes
            .iter()
            .filter_map(|item| item.attributes.first()?.parse().ok())
            .collect();
        let first_absent_index = (0u32..)
            .find(|id| !index_ids.contains(id))
            .unwrap_or(u32::MAX);

        Ok(Self {
            container: container.to_string(),
            blocks: blocks.len(),
            indexes: indexes.len(),
            states: states.len(),
            first_absent_index,
        })
    }
}
