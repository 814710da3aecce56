//! src/services/local_store.rs
//!
//! LocalObjectStore — an [`ObjectStore`] backed by SQLite for headers and
//! attributes and local disk for payloads. Payloads are sharded beneath
//! `base_path/{container}/{shard}/{shard}/{object-id}`.
//!
//! Like the networked stores it stands in for, it never deduplicates: every
//! put yields a fresh object id, even for identical payloads.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use sha2::{Digest, Sha256};
use sqlx::{
    FromRow, QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    checksum::TzHasher,
    object_store::{ContainerInfo, ObjectStore, PayloadStream, StoreError, StoreResult},
};
use crate::models::object::{
    Attribute, MatchType, ObjectHeader, ObjectId, SearchItem, SearchPage, SearchRequest,
};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");
const MAX_CONTAINER_ID_LEN: usize = 64;
const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(FromRow)]
struct ObjectRow {
    id: String,
    container_id: String,
    owner: String,
    payload_size: i64,
    checksum: String,
    homomorphic_checksum: Option<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    page_size: usize,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Open (creating if needed) the SQLite database at `database_url` and
    /// the payload directory at `base_path`.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("file:");
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                debug!("created missing directory {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool), base_path))
    }

    /// Single-connection in-memory database, for tests.
    #[cfg(test)]
    pub async fn in_memory(base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool), base_path);
        store.migrate().await?;
        Ok(store)
    }

    /// Number of items returned per search page.
    #[cfg(test)]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Create a container with the given attributes and its payload folder.
    pub async fn create_container(
        &self,
        id: &str,
        owner: &str,
        attributes: &[Attribute],
    ) -> StoreResult<ContainerInfo> {
        ensure_container_id_safe(id)?;
        fs::create_dir_all(self.container_root(id)).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO containers (id, owner, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(owner)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        for attr in attributes {
            sqlx::query(
                "INSERT INTO container_attributes (container_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(&attr.key)
            .bind(&attr.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(ContainerInfo {
            id: id.to_string(),
            owner: owner.to_string(),
            attributes: attributes.to_vec(),
        })
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Two-level shard directories from MD5(container/id), keeping the
    /// file count per directory low.
    fn object_shards(container: &str, id: &ObjectId) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: &str, id: &ObjectId) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, id);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    async fn fetch_object(&self, container: &str, id: ObjectId) -> StoreResult<ObjectHeader> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT id, container_id, owner, payload_size, checksum, homomorphic_checksum, created_at
             FROM objects
             WHERE id = ? AND container_id = ? AND is_deleted = 0",
        )
        .bind(id.to_string())
        .bind(container)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(id),
            other => StoreError::Sqlx(other),
        })?;

        let attributes = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM object_attributes WHERE object_id = ? ORDER BY position ASC",
        )
        .bind(&row.id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|(key, value)| Attribute { key, value })
        .collect();

        Ok(ObjectHeader {
            container: row.container_id,
            owner: row.owner,
            attributes,
            payload_size: row.payload_size as u64,
            checksum: Some(row.checksum),
            homomorphic_checksum: row.homomorphic_checksum,
        })
    }

    /// Recursively remove empty directories up to the container root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn container(&self, container: &str) -> StoreResult<ContainerInfo> {
        ensure_container_id_safe(container)?;
        let owner = sqlx::query_scalar::<_, String>("SELECT owner FROM containers WHERE id = ?")
            .bind(container)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::ContainerNotFound(container.to_string()),
                other => StoreError::Sqlx(other),
            })?;
        let attributes = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM container_attributes WHERE container_id = ? ORDER BY key",
        )
        .bind(container)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|(key, value)| Attribute { key, value })
        .collect();
        Ok(ContainerInfo {
            id: container.to_string(),
            owner,
            attributes,
        })
    }

    /// Objects are returned in ascending id order; the cursor is the last id
    /// of the page, base64 encoded.
    async fn search(&self, container: &str, request: &SearchRequest) -> StoreResult<SearchPage> {
        let fetch_limit = self.page_size + 1;

        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT o.id FROM objects o WHERE o.container_id = ");
        builder.push_bind(container.to_string());
        builder.push(" AND o.is_deleted = 0");

        for filter in &request.filters {
            builder.push(
                " AND EXISTS (SELECT 1 FROM object_attributes a WHERE a.object_id = o.id AND a.key = ",
            );
            builder.push_bind(filter.key.clone());
            let op = match filter.op {
                MatchType::Equal => " = ",
                MatchType::GreaterOrEqual => " >= ",
                MatchType::LessThan => " < ",
            };
            match filter.value.parse::<u64>() {
                Ok(number) => {
                    builder.push(
                        " AND a.value <> '' AND a.value NOT GLOB '*[^0-9]*' AND CAST(a.value AS INTEGER)",
                    );
                    builder.push(op);
                    builder.push_bind(i64::try_from(number).unwrap_or(i64::MAX));
                }
                Err(_) => {
                    builder.push(" AND a.value");
                    builder.push(op);
                    builder.push_bind(filter.value.clone());
                }
            }
            builder.push(")");
        }

        if let Some(cursor) = &request.cursor {
            builder.push(" AND o.id > ");
            builder.push_bind(decode_cursor(cursor)?.to_string());
        }

        builder.push(" ORDER BY o.id ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut ids: Vec<String> = builder.build_query_scalar().fetch_all(&*self.db).await?;

        let mut cursor = None;
        if ids.len() == fetch_limit {
            ids.pop();
            if let Some(last) = ids.last() {
                cursor = Some(URL_SAFE_NO_PAD.encode(last));
            }
        }

        let mut values: HashMap<String, HashMap<String, String>> = HashMap::new();
        if !request.attributes.is_empty() && !ids.is_empty() {
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT object_id, key, value FROM object_attributes WHERE object_id IN (",
            );
            let mut separated = query.separated(", ");
            for id in &ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(") ORDER BY position ASC");
            let rows: Vec<(String, String, String)> =
                query.build_query_as().fetch_all(&*self.db).await?;
            for (object_id, key, value) in rows {
                values
                    .entry(object_id)
                    .or_default()
                    .entry(key)
                    .or_insert(value);
            }
        }

        let items = ids
            .into_iter()
            .map(|raw| {
                let id = parse_stored_id(&raw)?;
                let attrs = values.get(&raw);
                let attributes = request
                    .attributes
                    .iter()
                    .map(|key| {
                        attrs
                            .and_then(|a| a.get(key))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect();
                Ok(SearchItem { id, attributes })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(SearchPage { items, cursor })
    }

    async fn put(&self, header: ObjectHeader, payload: Bytes) -> StoreResult<ObjectId> {
        self.put_stream(header, Box::pin(stream::once(async move { Ok::<_, io::Error>(payload) })))
            .await
    }

    /// Stream the payload into a temporary file while hashing it, verify any
    /// checksums the caller supplied, then rename into place and record the
    /// header. A failing stream leaves nothing behind.
    async fn put_stream(
        &self,
        header: ObjectHeader,
        mut payload: PayloadStream,
    ) -> StoreResult<ObjectId> {
        let container = self.container(&header.container).await?;
        let homomorphic = container.homomorphic_hashing();

        let root = self.container_root(&container.id);
        fs::create_dir_all(&root).await?;
        let tmp_path = root.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut sha = Sha256::new();
        let mut tz = homomorphic.then(TzHasher::new);
        while let Some(chunk) = payload.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size += chunk.len() as u64;
            sha.update(&chunk);
            if let Some(tz) = tz.as_mut() {
                tz.update(&chunk);
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        let checksum = hex::encode(sha.finalize());
        let homomorphic_checksum = tz.map(|tz| hex::encode(tz.finalize()));
        let mismatch = header.checksum.as_ref().is_some_and(|c| *c != checksum)
            || header
                .homomorphic_checksum
                .as_ref()
                .is_some_and(|c| Some(c) != homomorphic_checksum.as_ref());
        if mismatch {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Corrupt(format!(
                "payload checksum mismatch for {} bytes",
                size
            )));
        }

        let id = {
            let mut hasher = Sha256::new();
            hasher.update(Uuid::new_v4().as_bytes());
            hasher.update(container.id.as_bytes());
            hasher.update(checksum.as_bytes());
            ObjectId(hasher.finalize().into())
        };

        let file_path = self.object_path(&container.id, &id);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let recorded = async {
            let mut tx = self.db.begin().await?;
            sqlx::query(
                "INSERT INTO objects (
                    id, container_id, owner, payload_size, checksum,
                    homomorphic_checksum, created_at, is_deleted
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(id.to_string())
            .bind(&container.id)
            .bind(&header.owner)
            .bind(size as i64)
            .bind(&checksum)
            .bind(&homomorphic_checksum)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            for (position, attr) in header.attributes.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO object_attributes (object_id, position, key, value)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(id.to_string())
                .bind(position as i64)
                .bind(&attr.key)
                .bind(&attr.value)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        }
        .await;

        match recorded {
            Ok(()) => Ok(id),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    async fn head(&self, container: &str, id: ObjectId) -> StoreResult<ObjectHeader> {
        self.fetch_object(container, id).await
    }

    async fn get(&self, container: &str, id: ObjectId) -> StoreResult<(ObjectHeader, Bytes)> {
        let header = self.fetch_object(container, id).await?;
        let payload = fs::read(self.object_path(container, &id))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound(id)
                } else {
                    StoreError::Io(err)
                }
            })?;
        Ok((header, Bytes::from(payload)))
    }

    /// Soft-delete the header and remove the payload best-effort. Deleting
    /// an already deleted object reports `NotFound`.
    async fn delete(&self, container: &str, id: ObjectId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE objects SET is_deleted = 1
             WHERE id = ? AND container_id = ? AND is_deleted = 0",
        )
        .bind(id.to_string())
        .bind(container)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        let file_path = self.object_path(container, &id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.container_root(container))
                .await;
        }
        Ok(())
    }
}

/// Container ids become directory names: keep them to a safe alphabet.
fn ensure_container_id_safe(id: &str) -> StoreResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_CONTAINER_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::ContainerNotFound(id.to_string()))
    }
}

fn decode_cursor(cursor: &str) -> StoreResult<ObjectId> {
    URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::InvalidCursor(cursor.to_string()))
}

fn parse_stored_id(raw: &str) -> StoreResult<ObjectId> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("object id `{}` in metadata", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ArchiveError, models::object::SearchFilter, services::checksum::sha256_hex,
        services::object_store::search_all, test_utils::fast_retry,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn store(dir: &Path) -> LocalObjectStore {
        let store = LocalObjectStore::in_memory(dir).await.unwrap();
        store
            .create_container("blocks", "owner", &[Attribute::new("Magic", 5)])
            .await
            .unwrap();
        store
    }

    fn block_header(height: u32) -> ObjectHeader {
        let mut header = ObjectHeader::new("blocks", "owner");
        header.attributes.push(Attribute::new("Block", height));
        header
    }

    #[tokio::test]
    async fn put_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let id = store
            .put(block_header(3), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let (header, payload) = store.get("blocks", id).await.unwrap();
        assert_eq!(&payload[..], b"payload");
        assert_eq!(header.numeric_attribute("Block"), Some(3));
        assert_eq!(header.checksum, Some(sha256_hex(b"payload")));
        assert!(header.homomorphic_checksum.is_some());

        store.delete("blocks", id).await.unwrap();
        assert!(matches!(
            store.head("blocks", id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("blocks", id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn identical_payloads_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let a = store.put(block_header(1), Bytes::from_static(b"x")).await.unwrap();
        let b = store.put(block_header(1), Bytes::from_static(b"x")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn numeric_range_search_pages_with_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await.with_page_size(2);
        for height in 0..7u32 {
            store
                .put(block_header(height), Bytes::from(height.to_string()))
                .await
                .unwrap();
        }

        let request = SearchRequest {
            filters: vec![
                SearchFilter::greater_or_equal("Block", 2),
                SearchFilter::less_than("Block", 10),
            ],
            attributes: vec!["Block".into()],
            cursor: None,
        };
        let first = store.search("blocks", &request).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.cursor.is_some());

        let mut heights: Vec<u32> = search_all(&store, "blocks", request)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.attributes[0].parse().unwrap())
            .collect();
        heights.sort();
        assert_eq!(heights, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::Other, "traversal failed")),
        ];
        let err = store
            .put_stream(block_header(9), Box::pin(stream::iter(chunks)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let found = search_all(
            &store,
            "blocks",
            SearchRequest {
                filters: vec![SearchFilter::equal("Block", 9)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut header = block_header(1);
        header.checksum = Some(sha256_hex(b"something else"));

        let attempts = AtomicU32::new(0);
        let err = fast_retry()
            .retry("put block 1", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let header = header.clone();
                let store = &store;
                async move {
                    store
                        .put(header, Bytes::from_static(b"payload"))
                        .await
                        .map_err(ArchiveError::from)
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Store(StoreError::Corrupt(_))), "{err}");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let found = search_all(
            &store,
            "blocks",
            SearchRequest {
                filters: vec![SearchFilter::equal("Block", 1)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn bad_cursor_and_unknown_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let request = SearchRequest {
            cursor: Some("!!".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.search("blocks", &request).await,
            Err(StoreError::InvalidCursor(_))
        ));
        assert!(matches!(
            store.container("missing").await,
            Err(StoreError::ContainerNotFound(_))
        ));
        assert!(matches!(
            store.container("../etc").await,
            Err(StoreError::ContainerNotFound(_))
        ));
    }
}
