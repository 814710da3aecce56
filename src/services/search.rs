//! Parallel, batched attribute-range search.
//!
//! `[lo, hi)` is cut into sub-batches of `batch_size` heights. Up to
//! `parallelism` sub-batches are queried at once, each following its
//! cursor to the end before the next group starts. Hits from all
//! sub-batches are funneled into one buffered channel, so ordering across
//! sub-batches is arbitrary. The same object can show up more than once
//! and consumers have to cope with that.

use futures::{StreamExt, stream::FuturesUnordered};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{object_store::ObjectStore, retry::RetryExecutor};
use crate::{
    errors::{ArchiveError, ArchiveResult, ErrorSlot, ErrorSlotReceiver},
    models::object::{SearchFilter, SearchItem, SearchRequest},
};

const RESULT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct RangeSearch {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    container: String,
    batch_size: u32,
    parallelism: usize,
}

impl RangeSearch {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        container: impl Into<String>,
        batch_size: u32,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            retry,
            container: container.into(),
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Same store and policy, different number of concurrent sub-batches.
    pub fn with_parallelism(&self, parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            ..self.clone()
        }
    }

    /// Same query shape under a different retry policy or cancellation token.
    pub fn with_retry(&self, retry: RetryExecutor) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    /// Stream every object whose numeric attribute `key` lies in `[lo, hi)`.
    ///
    /// Each hit carries the values of `attributes`, in order. The search runs
    /// in a background task that stops at the first error or when the
    /// returned [`SearchResults`] is dropped.
    pub fn search(&self, key: &str, lo: u32, hi: u32, attributes: Vec<String>) -> SearchResults {
        let (tx, items) = mpsc::channel(RESULT_BUFFER);
        let (slot, errors) = ErrorSlot::new();
        let cancel = self.retry.cancel_token().child_token();

        let sub_batches: Vec<(u32, u32)> = (lo..hi)
            .step_by(self.batch_size as usize)
            .map(|start| (start, start.saturating_add(self.batch_size).min(hi)))
            .collect();

        let store = self.store.clone();
        let retry = self.retry.with_token(cancel.clone());
        let container = self.container.clone();
        let key = key.to_string();
        let parallelism = self.parallelism;
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            for group in sub_batches.chunks(parallelism) {
                if task_cancel.is_cancelled() {
                    return;
                }
                let mut queries: FuturesUnordered<_> = group
                    .iter()
                    .map(|&(start, end)| {
                        search_sub_batch(
                            store.as_ref(),
                            &retry,
                            &container,
                            &key,
                            start,
                            end,
                            &attributes,
                            &tx,
                        )
                    })
                    .collect();
                // Returning drops the sibling queries still in flight.
                while let Some(result) = queries.next().await {
                    match result {
                        Ok(()) => {}
                        // The consumer went away; nobody is listening.
                        Err(ArchiveError::Cancelled) if tx.is_closed() => return,
                        Err(err) => {
                            slot.report(err);
                            task_cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });

        SearchResults {
            items,
            errors,
            cancel,
            task,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn search_sub_batch(
    store: &dyn ObjectStore,
    retry: &RetryExecutor,
    container: &str,
    key: &str,
    start: u32,
    end: u32,
    attributes: &[String],
    tx: &mpsc::Sender<SearchItem>,
) -> ArchiveResult<()> {
    let mut request = SearchRequest {
        filters: vec![
            SearchFilter::greater_or_equal(key, start),
            SearchFilter::less_than(key, end),
        ],
        attributes: attributes.to_vec(),
        cursor: None,
    };
    let operation = format!("search {key} in [{start}, {end})");
    loop {
        let page = retry
            .retry(&operation, || async {
                store
                    .search(container, &request)
                    .await
                    .map_err(ArchiveError::from)
            })
            .await?;
        debug!(key, start, end, hits = page.items.len(), "search page");
        for item in page.items {
            tx.send(item).await.map_err(|_| ArchiveError::Cancelled)?;
        }
        match page.cursor {
            Some(cursor) => request.cursor = Some(cursor),
            None => return Ok(()),
        }
    }
}

/// Receiving side of a [`RangeSearch::search`].
pub struct SearchResults {
    items: mpsc::Receiver<SearchItem>,
    errors: ErrorSlotReceiver,
    cancel: CancellationToken,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

impl SearchResults {
    /// Next hit, or the search error. `None` once the search is exhausted.
    pub async fn next(&mut self) -> Option<ArchiveResult<SearchItem>> {
        tokio::select! {
            biased;
            Some(err) = self.errors.recv() => Some(Err(err)),
            item = self.items.recv() => match item {
                Some(item) => Some(Ok(item)),
                None => self.errors.take().map(Err),
            },
        }
    }

    /// Drain the whole search into memory.
    #[cfg(test)]
    pub async fn collect(mut self) -> ArchiveResult<Vec<SearchItem>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Drop for SearchResults {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
