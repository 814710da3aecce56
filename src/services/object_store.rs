//! The object-store collaborator: put/get/search/delete with attribute
//! filters and cursor-paged search results.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

use crate::models::object::{
    Attribute, ObjectHeader, ObjectId, SearchItem, SearchPage, SearchRequest,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("invalid search cursor `{0}`")]
    InvalidCursor(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Integrity failure; retrying cannot fix it.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Sqlx(_) | StoreError::Io(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Payload stream accepted by streaming uploads. An `Err` item aborts the
/// upload and the store discards whatever it received.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

/// Container attribute carrying the network magic of the archived chain.
pub const MAGIC_ATTR: &str = "Magic";

/// Container attribute that turns off homomorphic hashing.
pub const HOMOMORPHIC_DISABLED_ATTR: &str = "HomomorphicHashingDisabled";

/// Container metadata.
#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub id: String,
    pub owner: String,
    pub attributes: Vec<Attribute>,
}

impl ContainerInfo {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }

    /// Whether objects in this container carry a homomorphic checksum.
    pub fn homomorphic_hashing(&self) -> bool {
        self.attribute(HOMOMORPHIC_DISABLED_ATTR) != Some("true")
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn container(&self, container: &str) -> StoreResult<ContainerInfo>;

    /// Return one page of objects matching every filter of `request`.
    async fn search(&self, container: &str, request: &SearchRequest) -> StoreResult<SearchPage>;

    async fn put(&self, header: ObjectHeader, payload: Bytes) -> StoreResult<ObjectId>;

    /// Upload a payload of unknown length. The object only becomes visible
    /// once the stream ends without error.
    async fn put_stream(&self, header: ObjectHeader, payload: PayloadStream)
    -> StoreResult<ObjectId>;

    async fn head(&self, container: &str, id: ObjectId) -> StoreResult<ObjectHeader>;

    async fn get(&self, container: &str, id: ObjectId) -> StoreResult<(ObjectHeader, Bytes)>;

    async fn delete(&self, container: &str, id: ObjectId) -> StoreResult<()>;
}

/// Follow the search cursor until the result set is exhausted.
pub async fn search_all(
    store: &dyn ObjectStore,
    container: &str,
    mut request: SearchRequest,
) -> StoreResult<Vec<SearchItem>> {
    let mut items = Vec::new();
    loop {
        let page = store.search(container, &request).await?;
        items.extend(page.items);
        match page.cursor {
            Some(cursor) => request.cursor = Some(cursor),
            None => return Ok(items),
        }
    }
}
