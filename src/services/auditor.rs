//! Reconciles stored block objects against the index files that name them.
//!
//! Per height the audit ends in one of two states: CONFIRMED when the
//! object the index file names is found, MISSING when it is not. Any other
//! object carrying the height is an orphan and is deleted (or only logged
//! in dry-run mode). Missing blocks are warnings; the audit carries on.

use serde::Serialize;
use std::{collections::HashSet, ops::AddAssign, sync::Arc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{
    index_builder::IndexBuilder,
    object_store::{ObjectStore, StoreError},
    retry::RetryExecutor,
    search::RangeSearch,
};
use crate::{
    config::{ArchiveConfig, AttributeKeys},
    errors::{ArchiveError, ArchiveResult, ErrorSlot},
    models::{
        index_file::decode_index_payload,
        object::{ObjectId, SearchItem},
    },
};

/// Totals of one audit run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub indexes_checked: u64,
    pub indexes_absent: u64,
    /// Surplus index files for an already covered index id.
    pub index_orphans: u64,
    pub confirmed: u64,
    pub missing: u64,
    /// Block objects other than the indexed one.
    pub orphans: u64,
    pub deleted: u64,
}

impl AddAssign for AuditReport {
    fn add_assign(&mut self, other: Self) {
        self.indexes_checked += other.indexes_checked;
        self.indexes_absent += other.indexes_absent;
        self.index_orphans += other.index_orphans;
        self.confirmed += other.confirmed;
        self.missing += other.missing;
        self.orphans += other.orphans;
        self.deleted += other.deleted;
    }
}

#[derive(Clone)]
pub struct Auditor {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    indexes: IndexBuilder,
    search: RangeSearch,
    container: String,
    keys: Arc<AttributeKeys>,
    index_size: u32,
    workers: usize,
    dry_run: bool,
}

/// What one worker knows about its slice of a run.
struct Slice {
    run_start: u32,
    lo: u32,
    hi: u32,
    expected: Arc<Vec<ObjectId>>,
    confirmed: HashSet<u32>,
    seen: HashSet<ObjectId>,
    report: AuditReport,
}

impl Auditor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        config: &ArchiveConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            indexes: IndexBuilder::new(store.clone(), retry.clone(), config, false),
            search: RangeSearch::new(
                store.clone(),
                retry.clone(),
                config.container.clone(),
                config.batch_size,
                1,
            ),
            store,
            retry,
            container: config.container.clone(),
            keys: Arc::new(config.keys.clone()),
            index_size: config.index_size,
            workers: config.delete_workers.max(1),
            dry_run,
        }
    }

    /// Audit the runs of index ids `[from_index, to_index)`.
    pub async fn audit(&self, from_index: u32, to_index: u32) -> ArchiveResult<AuditReport> {
        let mut report = AuditReport::default();
        for index_id in from_index..to_index {
            let Some(expected) = self.expected_ids(index_id, &mut report).await? else {
                continue;
            };
            let run_start = index_id
                .checked_mul(self.index_size)
                .ok_or_else(|| ArchiveError::Config(format!("index {index_id} is out of height range")))?;
            report.indexes_checked += 1;
            report += self.reconcile_run(run_start, Arc::new(expected)).await?;
            info!(index_id, "index run audited");
        }
        info!(?report, dry_run = self.dry_run, "audit finished");
        Ok(report)
    }

    /// Pick the index file to trust for `index_id` and orphan the others.
    ///
    /// The first candidate, in search order, whose payload decodes wins.
    async fn expected_ids(
        &self,
        index_id: u32,
        report: &mut AuditReport,
    ) -> ArchiveResult<Option<Vec<ObjectId>>> {
        let candidates = self.indexes.index_objects(index_id).await?;
        if candidates.is_empty() {
            warn!(index_id, "index file is absent");
            report.indexes_absent += 1;
            return Ok(None);
        }

        let mut expected = None;
        for id in candidates {
            if expected.is_none() {
                let (_, payload) = self
                    .retry
                    .retry(&format!("get index {index_id}"), || async {
                        self.store
                            .get(&self.container, id)
                            .await
                            .map_err(ArchiveError::from)
                    })
                    .await?;
                match decode_index_payload(&payload, self.index_size) {
                    Some(ids) => {
                        expected = Some(ids);
                        continue;
                    }
                    None => warn!(index_id, %id, "index file payload is malformed"),
                }
            } else {
                warn!(index_id, %id, "duplicate index file");
            }
            report.index_orphans += 1;
            if self.remove(id).await? {
                report.deleted += 1;
            }
        }
        if expected.is_none() {
            report.indexes_absent += 1;
        }
        Ok(expected)
    }

    /// Split the run into one disjoint height range per worker.
    async fn reconcile_run(
        &self,
        run_start: u32,
        expected: Arc<Vec<ObjectId>>,
    ) -> ArchiveResult<AuditReport> {
        let size = expected.len() as u32;
        let step = size.div_ceil(self.workers as u32).max(1);
        let (slot, mut errors) = ErrorSlot::new();
        let cancel = self.retry.cancel_token().child_token();
        let mut tasks = JoinSet::new();

        for offset in (0..size).step_by(step as usize) {
            let lo = run_start + offset;
            let hi = run_start + (offset + step).min(size);
            let retry = self.retry.with_token(cancel.clone());
            let auditor = Auditor {
                search: self.search.with_retry(retry.clone()),
                retry,
                ..self.clone()
            };
            let mut slice = Slice {
                run_start,
                lo,
                hi,
                expected: expected.clone(),
                confirmed: HashSet::new(),
                seen: HashSet::new(),
                report: AuditReport::default(),
            };
            let slot = slot.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                match auditor.reconcile_slice(&mut slice).await {
                    Ok(()) => slice.report,
                    Err(err) => {
                        slot.report(err);
                        cancel.cancel();
                        slice.report
                    }
                }
            });
        }
        drop(slot);

        let mut report = AuditReport::default();
        loop {
            tokio::select! {
                biased;
                Some(err) = errors.recv() => {
                    cancel.cancel();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
                joined = tasks.join_next() => match joined {
                    Some(done) => report += done?,
                    None => break,
                },
            }
        }
        match errors.take() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn reconcile_slice(&self, slice: &mut Slice) -> ArchiveResult<()> {
        let key = &self.keys.block;
        let mut hits = self.search.search(key, slice.lo, slice.hi, vec![key.clone()]);
        while let Some(item) = hits.next().await {
            self.classify(item?, slice).await?;
        }
        drop(hits);

        // Re-ask per height before calling a block missing; range searches
        // may under-deliver.
        for height in slice.lo..slice.hi {
            if slice.confirmed.contains(&height) {
                continue;
            }
            let mut hits = self.search.search(key, height, height + 1, vec![key.clone()]);
            while let Some(item) = hits.next().await {
                self.classify(item?, slice).await?;
            }
            if !slice.confirmed.contains(&height) {
                let expected = slice.expected[(height - slice.run_start) as usize];
                warn!(height, %expected, "block is missing from the store");
                slice.report.missing += 1;
            }
        }
        Ok(())
    }

    async fn classify(&self, item: SearchItem, slice: &mut Slice) -> ArchiveResult<()> {
        let Some(height) = item.attributes.first().and_then(|v| v.parse::<u32>().ok()) else {
            warn!(id = %item.id, "block object without a readable height");
            return Ok(());
        };
        if !(slice.lo..slice.hi).contains(&height) || !slice.seen.insert(item.id) {
            return Ok(());
        }
        let expected = slice.expected[(height - slice.run_start) as usize];
        if item.id == expected {
            slice.confirmed.insert(height);
            slice.report.confirmed += 1;
            return Ok(());
        }

        slice.report.orphans += 1;
        if self.remove(item.id).await? {
            slice.report.deleted += 1;
            info!(height, id = %item.id, %expected, "deleted orphan block object");
        }
        Ok(())
    }

    /// Delete `id`, or log it in dry-run mode. Returns whether it was deleted.
    async fn remove(&self, id: ObjectId) -> ArchiveResult<bool> {
        if self.dry_run {
            warn!(%id, "dry run, would delete object");
            return Ok(false);
        }
        let deleted = self
            .retry
            .retry(&format!("delete {id}"), || async {
                self.store
                    .delete(&self.container, id)
                    .await
                    .map_err(ArchiveError::from)
            })
            .await;
        match deleted {
            Ok(()) => Ok(true),
            Err(ArchiveError::Store(StoreError::NotFound(_))) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            index_file::IndexBuffer,
            object::{Attribute, ObjectHeader},
        },
        test_utils::{MemoryStore, fast_retry, put_block_object},
    };
    use bytes::Bytes;

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            container: "blocks".into(),
            owner: "owner".into(),
            batch_size: 4,
            index_size: 8,
            search_workers: 2,
            delete_workers: 3,
            ..Default::default()
        }
    }

    /// Blocks `0..16` with both index files built.
    async fn archived_store() -> (Arc<MemoryStore>, Vec<ObjectId>) {
        let store = Arc::new(MemoryStore::new("blocks"));
        let mut ids = Vec::new();
        for height in 0..16 {
            ids.push(put_block_object(&store, height).await);
        }
        let builder = IndexBuilder::new(store.clone(), fast_retry(), &config(), false);
        let mut buffer = IndexBuffer::new(8);
        builder.build(0, &mut buffer).await.unwrap();
        builder.build(1, &mut buffer).await.unwrap();
        (store, ids)
    }

    fn auditor(store: &Arc<MemoryStore>, dry_run: bool) -> Auditor {
        Auditor::new(store.clone(), fast_retry(), &config(), dry_run)
    }

    #[tokio::test]
    async fn clean_archive_is_fully_confirmed() {
        let (store, _) = archived_store().await;
        let report = auditor(&store, false).audit(0, 2).await.unwrap();
        assert_eq!(report.indexes_checked, 2);
        assert_eq!(report.confirmed, 16);
        assert_eq!(report.orphans, 0);
        assert_eq!(store.delete_count(), 0);
    }

    #[tokio::test]
    async fn orphans_are_deleted_leaving_the_indexed_object() {
        let (store, ids) = archived_store().await;
        for _ in 0..3 {
            put_block_object(&store, 5).await;
        }
        put_block_object(&store, 12).await;

        let report = auditor(&store, false).audit(0, 2).await.unwrap();

        assert_eq!(report.orphans, 4);
        assert_eq!(report.deleted, 4);
        assert_eq!(report.confirmed, 16);
        for height in 0..16 {
            assert_eq!(store.ids_with("Block", height), vec![ids[height as usize]]);
        }
    }

    #[tokio::test]
    async fn dry_run_reports_but_keeps_everything() {
        let (store, _) = archived_store().await;
        for _ in 0..3 {
            put_block_object(&store, 5).await;
        }

        let report = auditor(&store, true).audit(0, 2).await.unwrap();

        assert_eq!(report.orphans, 3);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.ids_with("Block", 5).len(), 4);
        assert_eq!(store.delete_count(), 0);
    }

    #[tokio::test]
    async fn missing_block_is_a_warning_not_an_error() {
        let (store, ids) = archived_store().await;
        store.delete("blocks", ids[9]).await.unwrap();

        let report = auditor(&store, false).audit(0, 2).await.unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.confirmed, 15);
    }

    #[tokio::test]
    async fn object_hidden_from_range_search_is_still_confirmed() {
        let (store, ids) = archived_store().await;
        store.hide_from_range_search(ids[3]);
        let report = auditor(&store, false).audit(0, 1).await.unwrap();
        assert_eq!(report.confirmed, 8);
        assert_eq!(report.missing, 0);
    }

    #[tokio::test]
    async fn absent_index_file_is_skipped() {
        let (store, _) = archived_store().await;
        let report = auditor(&store, false).audit(0, 3).await.unwrap();
        assert_eq!(report.indexes_checked, 2);
        assert_eq!(report.indexes_absent, 1);
    }

    #[tokio::test]
    async fn duplicate_index_file_is_orphaned() {
        let (store, _) = archived_store().await;
        let index = store.ids_with("Index", 1)[0];
        let (header, payload) = store.get("blocks", index).await.unwrap();
        store.put(header, payload).await.unwrap();

        let mut junk = ObjectHeader::new("blocks", "owner");
        junk.attributes = vec![
            Attribute::new("Index", 0),
            Attribute::new("IndexSize", 8),
        ];
        store.put(junk, Bytes::from_static(b"not an index")).await.unwrap();

        let report = auditor(&store, false).audit(0, 2).await.unwrap();
        assert_eq!(report.index_orphans, 2);
        assert_eq!(report.indexes_checked, 2);
        assert_eq!(report.confirmed, 16);
        assert_eq!(store.ids_with("Index", 0).len(), 1);
        assert_eq!(store.ids_with("Index", 1).len(), 1);
    }

    #[tokio::test]
    async fn index_with_unfilled_slot_is_not_trusted() {
        let store = Arc::new(MemoryStore::new("blocks"));
        let mut buffer = IndexBuffer::new(8);
        for height in 0..8 {
            let id = put_block_object(&store, height).await;
            if height != 5 {
                buffer.claim(height, id);
            }
        }
        let mut header = ObjectHeader::new("blocks", "owner");
        header.attributes = vec![
            Attribute::new("Index", 0),
            Attribute::new("IndexSize", 8),
        ];
        store
            .put(header, Bytes::copy_from_slice(buffer.as_bytes()))
            .await
            .unwrap();

        let report = auditor(&store, false).audit(0, 1).await.unwrap();

        assert_eq!(report.index_orphans, 1);
        assert_eq!(report.indexes_absent, 1);
        assert_eq!(report.indexes_checked, 0);
        assert_eq!(report.orphans, 0);
        assert!(store.ids_with("Index", 0).is_empty());
        for height in 0..8 {
            assert_eq!(store.ids_with("Block", height).len(), 1);
        }
    }

    #[tokio::test]
    async fn duplicate_before_indexing_keeps_the_indexed_copy() {
        let store = Arc::new(MemoryStore::new("blocks"));
        for height in 0..8 {
            put_block_object(&store, height).await;
        }
        put_block_object(&store, 2).await;
        assert_eq!(store.ids_with("Block", 2).len(), 2);

        let builder = IndexBuilder::new(store.clone(), fast_retry(), &config(), false);
        builder.build(0, &mut IndexBuffer::new(8)).await.unwrap();
        let index = store.ids_with("Index", 0)[0];
        let slots = decode_index_payload(&store.payload(index).unwrap(), 8).unwrap();

        let report = auditor(&store, false).audit(0, 1).await.unwrap();

        assert_eq!(report.confirmed, 8);
        assert_eq!(report.orphans, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(store.ids_with("Block", 2), vec![slots[2]]);
    }
}
