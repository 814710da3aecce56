//! In-memory collaborators for tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::{self, BoxStream}};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    io,
    sync::{
        Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    models::{
        block::{Block, Hash256},
        object::{
            Attribute, MatchType, ObjectHeader, ObjectId, SearchFilter, SearchItem, SearchPage,
            SearchRequest,
        },
    },
    services::{
        ledger::{Ledger, LedgerError, LedgerResult, StateEntry},
        object_store::{ContainerInfo, ObjectStore, PayloadStream, StoreError, StoreResult},
        retry::{RetryConfig, RetryExecutor},
    },
};

pub const TEST_MAGIC: u32 = 42;

/// Numeric comparison when both sides parse, string comparison otherwise.
pub(crate) fn filter_matches(filter: &SearchFilter, candidate: &str) -> bool {
    match (candidate.parse::<u64>(), filter.value.parse::<u64>()) {
        (Ok(have), Ok(want)) => match filter.op {
            MatchType::Equal => have == want,
            MatchType::GreaterOrEqual => have >= want,
            MatchType::LessThan => have < want,
        },
        _ => match filter.op {
            MatchType::Equal => candidate == filter.value,
            MatchType::GreaterOrEqual => candidate >= filter.value.as_str(),
            MatchType::LessThan => candidate < filter.value.as_str(),
        },
    }
}

pub fn fast_retry() -> RetryExecutor {
    RetryExecutor::new(
        RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(5),
        },
        CancellationToken::new(),
    )
}

pub fn make_block(index: u32) -> Block {
    let mut prev_hash = [0u8; 32];
    prev_hash[..4].copy_from_slice(&index.wrapping_sub(1).to_le_bytes());
    Block {
        version: 0,
        prev_hash,
        merkle_root: [index as u8; 32],
        timestamp: 1_600_000_000_000 + u64::from(index) * 15_000,
        nonce: u64::from(index) * 7,
        index,
        primary_index: (index % 7) as u8,
        transactions: vec![index.to_le_bytes().to_vec()],
    }
}

/// Upload a bare block object tagged only with its height.
pub async fn put_block_object(store: &MemoryStore, height: u32) -> ObjectId {
    let mut header = ObjectHeader::new(store.container_id(), "tester");
    header.attributes.push(Attribute::new("Block", height));
    store
        .put(header, Bytes::from(make_block(height).encode()))
        .await
        .unwrap()
}

/// An [`ObjectStore`] held in memory, with fault injection.
pub struct MemoryStore {
    container: ContainerInfo,
    objects: Mutex<BTreeMap<ObjectId, (ObjectHeader, Bytes)>>,
    page_size: usize,
    hidden: Mutex<HashSet<ObjectId>>,
    search_failures: AtomicU32,
    put_failures: AtomicU32,
    ghost_puts: AtomicU32,
    puts: AtomicU32,
    deletes: AtomicU32,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new(container: &str) -> Self {
        Self::with_attributes(container, vec![Attribute::new("Magic", TEST_MAGIC)])
    }

    pub fn with_attributes(container: &str, attributes: Vec<Attribute>) -> Self {
        Self {
            container: ContainerInfo {
                id: container.to_string(),
                owner: "tester".into(),
                attributes,
            },
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            hidden: Mutex::new(HashSet::new()),
            search_failures: AtomicU32::new(0),
            put_failures: AtomicU32::new(0),
            ghost_puts: AtomicU32::new(0),
            puts: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn container_id(&self) -> &str {
        &self.container.id
    }

    /// Leave `id` out of searches spanning more than one value, the way an
    /// under-delivering search node would. Single-value queries still see it.
    pub fn hide_from_range_search(&self, id: ObjectId) {
        self.hidden.lock().unwrap().insert(id);
    }

    pub fn fail_next_searches(&self, n: u32) {
        self.search_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` puts store the object but report a transient failure.
    pub fn ghost_next_puts(&self, n: u32) {
        self.ghost_puts.store(n, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Identifiers of objects whose attribute `key` equals `value`.
    pub fn ids_with(&self, key: &str, value: u32) -> Vec<ObjectId> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (h, _))| h.numeric_attribute(key) == Some(u64::from(value)))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn payload(&self, id: ObjectId) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .map(|(_, payload)| payload.clone())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_container(&self, container: &str) -> StoreResult<()> {
        if container == self.container.id {
            Ok(())
        } else {
            Err(StoreError::ContainerNotFound(container.to_string()))
        }
    }

    fn spans_range(request: &SearchRequest) -> bool {
        let bound = |op: MatchType| {
            request
                .filters
                .iter()
                .find(|f| f.op == op)
                .and_then(|f| f.value.parse::<u64>().ok())
        };
        match (bound(MatchType::GreaterOrEqual), bound(MatchType::LessThan)) {
            (Some(lo), Some(hi)) => hi.saturating_sub(lo) > 1,
            _ => !request.filters.iter().any(|f| f.op == MatchType::Equal),
        }
    }

    fn store_object(&self, header: ObjectHeader, payload: Bytes) -> ObjectId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = ObjectId(Sha256::digest(n.to_le_bytes()).into());
        self.objects.lock().unwrap().insert(id, (header, payload));
        self.puts.fetch_add(1, Ordering::SeqCst);
        id
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn container(&self, container: &str) -> StoreResult<ContainerInfo> {
        self.check_container(container)?;
        Ok(self.container.clone())
    }

    async fn search(&self, container: &str, request: &SearchRequest) -> StoreResult<SearchPage> {
        self.check_container(container)?;
        if Self::take_failure(&self.search_failures) {
            return Err(StoreError::Unavailable("search node timed out".into()));
        }
        let after: Option<ObjectId> = match &request.cursor {
            Some(c) => Some(
                c.parse()
                    .map_err(|_| StoreError::InvalidCursor(c.clone()))?,
            ),
            None => None,
        };
        let hide = Self::spans_range(request);
        let hidden = self.hidden.lock().unwrap().clone();
        let objects = self.objects.lock().unwrap();

        let mut matching = objects
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| **id > a))
            .filter(|(id, _)| !(hide && hidden.contains(*id)))
            .filter(|(_, (header, _))| {
                request.filters.iter().all(|f| {
                    header
                        .attribute(&f.key)
                        .is_some_and(|value| filter_matches(f, value))
                })
            });

        let mut items = Vec::new();
        for (id, (header, _)) in matching.by_ref().take(self.page_size) {
            items.push(SearchItem {
                id: *id,
                attributes: request
                    .attributes
                    .iter()
                    .map(|key| header.attribute(key).unwrap_or_default().to_string())
                    .collect(),
            });
        }
        let cursor = match matching.next() {
            Some(_) => items.last().map(|item| item.id.to_string()),
            None => None,
        };
        Ok(SearchPage { items, cursor })
    }

    async fn put(&self, header: ObjectHeader, payload: Bytes) -> StoreResult<ObjectId> {
        self.check_container(&header.container)?;
        if Self::take_failure(&self.put_failures) {
            return Err(StoreError::Unavailable("put timed out".into()));
        }
        let id = self.store_object(header, payload);
        if Self::take_failure(&self.ghost_puts) {
            return Err(StoreError::Unavailable("put timed out after commit".into()));
        }
        Ok(id)
    }

    async fn put_stream(
        &self,
        header: ObjectHeader,
        mut payload: PayloadStream,
    ) -> StoreResult<ObjectId> {
        self.check_container(&header.container)?;
        let mut data = Vec::new();
        while let Some(chunk) = payload.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(self.store_object(header, Bytes::from(data)))
    }

    async fn head(&self, container: &str, id: ObjectId) -> StoreResult<ObjectHeader> {
        self.check_container(container)?;
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .map(|(header, _)| header.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn get(&self, container: &str, id: ObjectId) -> StoreResult<(ObjectHeader, Bytes)> {
        self.check_container(container)?;
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, container: &str, id: ObjectId) -> StoreResult<()> {
        self.check_container(container)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StateAt {
    root: Hash256,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// A [`Ledger`] over generated blocks and explicitly installed states.
pub struct MemoryLedger {
    blocks: Vec<Block>,
    states: BTreeMap<u32, StateAt>,
    full_state: bool,
    block_failures: AtomicU32,
    broken_state_after: Option<usize>,
}

impl MemoryLedger {
    /// Blocks `0..count`.
    pub fn new(count: u32) -> Self {
        Self {
            blocks: (0..count).map(make_block).collect(),
            states: BTreeMap::new(),
            full_state: true,
            block_failures: AtomicU32::new(0),
            broken_state_after: None,
        }
    }

    /// Install the state at `height`; the root is derived from the entries.
    pub fn with_state(mut self, height: u32, entries: &[(&[u8], &[u8])]) -> Self {
        let entries: BTreeMap<Vec<u8>, Vec<u8>> = entries
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(height.to_le_bytes());
        for (k, v) in &entries {
            hasher.update(k);
            hasher.update(v);
        }
        let root = hasher.finalize().into();
        self.states.insert(height, StateAt { root, entries });
        self
    }

    pub fn without_full_state(mut self) -> Self {
        self.full_state = false;
        self
    }

    /// State traversal fails after yielding `n` entries.
    pub fn break_state_traversal_after(mut self, n: usize) -> Self {
        self.broken_state_after = Some(n);
        self
    }

    pub fn fail_next_block_reads(&self, n: u32) {
        self.block_failures.store(n, Ordering::SeqCst);
    }

    pub fn root_at(&self, height: u32) -> Option<Hash256> {
        self.states.get(&height).map(|s| s.root)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn network_magic(&self) -> LedgerResult<u32> {
        Ok(TEST_MAGIC)
    }

    async fn block_count(&self) -> LedgerResult<u32> {
        Ok(self.blocks.len() as u32)
    }

    async fn block(&self, index: u32) -> LedgerResult<Block> {
        if MemoryStore::take_failure(&self.block_failures) {
            return Err(LedgerError::Io(io::Error::new(io::ErrorKind::TimedOut, "rpc timeout")));
        }
        self.blocks
            .get(index as usize)
            .cloned()
            .ok_or(LedgerError::BlockNotFound(index))
    }

    async fn state_root(&self, index: u32) -> LedgerResult<Hash256> {
        self.root_at(index)
            .ok_or(LedgerError::BlockNotFound(index))
    }

    fn seek_states(&self, root: Hash256, prefix: &[u8]) -> BoxStream<'static, LedgerResult<StateEntry>> {
        let entries: Vec<LedgerResult<StateEntry>> = match self
            .states
            .values()
            .find(|state| state.root == root)
        {
            Some(state) => {
                let mut out: Vec<LedgerResult<StateEntry>> = state
                    .entries
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| Ok((k.clone(), v.clone())))
                    .collect();
                if let Some(n) = self.broken_state_after {
                    out.truncate(n);
                    out.push(Err(LedgerError::Io(io::Error::other("trie node missing"))));
                }
                out
            }
            None => vec![Err(LedgerError::Inconsistent("unknown state root".into()))],
        };
        Box::pin(stream::iter(entries))
    }

    fn keeps_full_state(&self) -> bool {
        self.full_state
    }
}
