//! Static-Content Store (C3): chunked upload/download/delete of opaque
//! archive bytes, keyed by `userFacingUrlPrefix`.

use async_trait::async_trait;
use md5::{Digest, Md5};

use crate::error::{FrontendError, Result};

/// Target chunk size in bytes. Kept a plain constant rather than threaded
/// through every call; `Config::static_chunk_mb` is converted into this unit
/// by the caller that constructs a `StaticContentStore`.
const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

fn chunk_column(index: usize) -> String {
    format!("chunk_{index:010}")
}

/// MD5 hex digest used as the content hash throughout the static-content
/// pipeline, matching the column the Store records alongside each bundle.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Row-capability seam the Static-Content Store is built against, mirroring
/// the column-family scan semantics of the shared blob store.
#[async_trait]
pub trait ChunkedRowStore: Send + Sync {
    async fn put_column(&self, key: &str, column: &str, value: Vec<u8>) -> Result<()>;
    async fn get_column(&self, key: &str, column: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_columns(&self, key: &str, columns: &[String]) -> Result<()>;
    /// `(key, hash)` for every row that has a `hash` column.
    async fn scan_hashes(&self) -> Result<Vec<(String, String)>>;
}

pub struct StaticContentStore {
    store: Box<dyn ChunkedRowStore>,
    chunk_size: usize,
}

impl StaticContentStore {
    #[must_use]
    pub fn new(store: Box<dyn ChunkedRowStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
        }
    }

    fn hash_of(bytes: &[u8]) -> String {
        hash_bytes(bytes)
    }

    /// Deletes any existing bundle under `key`, then writes `hash`,
    /// `nofchunks`, and the chunk rows.
    pub async fn put_file(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.delete_file(key).await?;
        let hash = Self::hash_of(bytes);
        let nofchunks = bytes.len().div_ceil(self.chunk_size).max(1);
        self.store.put_column(key, "hash", hash.clone().into_bytes()).await?;
        self.store
            .put_column(key, "nofchunks", nofchunks.to_string().into_bytes())
            .await?;
        for (index, chunk) in bytes.chunks(self.chunk_size).enumerate() {
            self.store.put_column(key, &chunk_column(index), chunk.to_vec()).await?;
        }
        Ok(hash)
    }

    /// Reads chunks `0..nofchunks` in order and concatenates them. A short
    /// read (fewer chunks present than recorded) is logged; the partial
    /// result is returned only if non-empty.
    pub async fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(nofchunks_bytes) = self.store.get_column(key, "nofchunks").await? else {
            return Ok(None);
        };
        let nofchunks: usize = String::from_utf8_lossy(&nofchunks_bytes)
            .parse()
            .map_err(|e| FrontendError::StaticContentError(format!("corrupt nofchunks for {key}: {e}")))?;

        let mut out = Vec::new();
        for index in 0..nofchunks {
            match self.store.get_column(key, &chunk_column(index)).await? {
                Some(mut chunk) => out.append(&mut chunk),
                None => {
                    tracing::warn!(key, index, nofchunks, "short read assembling static content file");
                    break;
                }
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    /// Tombstones `hash`, `nofchunks`, and `chunk_0..N-1` for `key`, if present.
    pub async fn delete_file(&self, key: &str) -> Result<()> {
        let Some(nofchunks_bytes) = self.store.get_column(key, "nofchunks").await? else {
            return Ok(());
        };
        let nofchunks: usize = String::from_utf8_lossy(&nofchunks_bytes).parse().unwrap_or(0);
        let mut columns: Vec<String> = vec!["hash".into(), "nofchunks".into()];
        columns.extend((0..nofchunks).map(chunk_column));
        self.store.delete_columns(key, &columns).await
    }

    /// `(key, hash)` for every key with a `hash` column, used at startup to
    /// populate the in-memory index.
    pub async fn get_attributes(&self) -> Result<Vec<(String, String)>> {
        self.store.scan_hashes().await
    }

    /// No-op on this implementation: the in-process backend never drops its
    /// connection. Kept so callers written against a real blob-store client
    /// retry transient failures the same way.
    pub async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct InMemoryChunkedStore {
        rows: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    }

    #[async_trait]
    impl ChunkedRowStore for InMemoryChunkedStore {
        async fn put_column(&self, key: &str, column: &str, value: Vec<u8>) -> Result<()> {
            self.rows
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .insert(column.to_string(), value);
            Ok(())
        }
        async fn get_column(&self, key: &str, column: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().await.get(key).and_then(|row| row.get(column)).cloned())
        }
        async fn delete_columns(&self, key: &str, columns: &[String]) -> Result<()> {
            if let Some(row) = self.rows.lock().await.get_mut(key) {
                for column in columns {
                    row.remove(column);
                }
            }
            Ok(())
        }
        async fn scan_hashes(&self) -> Result<Vec<(String, String)>> {
            Ok(self
                .rows
                .lock()
                .await
                .iter()
                .filter_map(|(key, row)| {
                    row.get("hash")
                        .map(|h| (key.clone(), String::from_utf8_lossy(h).to_string()))
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_across_multiple_chunks() {
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 4);
        let bytes = b"0123456789abcdef".to_vec();
        let hash = store.put_file("app/foo", &bytes).await.unwrap();
        assert_eq!(hash.len(), 32);
        let got = store.get_file("app/foo").await.unwrap().unwrap();
        assert_eq!(got, bytes);
    }

    #[tokio::test]
    async fn put_overwrites_prior_bundle() {
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        store.put_file("app/foo", b"first").await.unwrap();
        store.put_file("app/foo", b"second").await.unwrap();
        let got = store.get_file("app/foo").await.unwrap().unwrap();
        assert_eq!(got, b"second");
    }

    #[tokio::test]
    async fn get_on_absent_key_returns_none() {
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        assert!(store.get_file("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_all_columns() {
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 4);
        store.put_file("app/foo", b"0123456789").await.unwrap();
        store.delete_file("app/foo").await.unwrap();
        assert!(store.get_file("app/foo").await.unwrap().is_none());
        assert!(store.get_attributes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_attributes_lists_hash_per_key() {
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        store.put_file("app/foo", b"abc").await.unwrap();
        store.put_file("app/bar", b"xyz").await.unwrap();
        let mut attrs = store.get_attributes().await.unwrap();
        attrs.sort();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, "app/bar");
        assert_eq!(attrs[1].0, "app/foo");
    }
}
