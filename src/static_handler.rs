//! Static-Content Handler (C4): reconciles the Static-Content Store's
//! authoritative hashes against what the currently-live static directory
//! holds, extracting fresh archives into the inactive half of the
//! double-buffered static tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{FrontendError, Result};
use crate::registration::ContentServiceType;
use crate::static_store::StaticContentStore;

const HYBRID_STATIC_SUBDIR: &str = "ezbappstatic";
const MAX_CONTENT_BYTES_DEFAULT: u64 = 64 * 1024 * 1024;

/// One submitted static-content upload (§4.4 `addStaticContent`).
pub struct StaticContentUpload {
    pub prefix: String,
    pub bytes: Vec<u8>,
}

struct Dirs {
    root: PathBuf,
    a: PathBuf,
    b: PathBuf,
    current_link: PathBuf,
}

impl Dirs {
    fn other_half(&self, current: &Path) -> PathBuf {
        if current == self.a { self.b.clone() } else { self.a.clone() }
    }
}

pub struct StaticContentHandler {
    store: StaticContentStore,
    dirs: Dirs,
    max_content_bytes: u64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Authoritative: what the Store currently has per prefix.
    sfs_hash: HashMap<String, String>,
    /// What the live static directory currently holds per prefix.
    sc_hash: HashMap<String, String>,
    cur_dir: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    populated: bool,
}

impl StaticContentHandler {
    #[must_use]
    pub fn new(store: StaticContentStore, static_root: PathBuf, max_content_bytes: Option<u64>) -> Self {
        let a = static_root.join("staticA");
        let b = static_root.join("staticB");
        let current_link = static_root.join("staticCurrent");
        Self {
            store,
            dirs: Dirs { root: static_root, a, b, current_link },
            max_content_bytes: max_content_bytes.unwrap_or(MAX_CONTENT_BYTES_DEFAULT),
            state: Mutex::new(State::default()),
        }
    }

    async fn current_live_dir(&self) -> Result<PathBuf> {
        match tokio::fs::read_link(&self.dirs.current_link).await {
            Ok(target) => Ok(if target.is_absolute() { target } else { self.dirs.root.join(target) }),
            Err(_) => Ok(self.dirs.a.clone()),
        }
    }

    /// Invoked at the start of a Configure pass (§4.6 step 2): picks the
    /// inactive half as `buildDir`, refreshes `sfsHash` from the Store on
    /// first run only, and rebuilds `scHash` by scanning `curDir`.
    #[tracing::instrument(skip(self))]
    pub async fn update_static_contents_dict(&self) -> Result<()> {
        let cur_dir = self.current_live_dir().await?;
        let build_dir = self.dirs.other_half(&cur_dir);
        tokio::fs::create_dir_all(&build_dir).await?;

        let mut state = self.state.lock().await;
        state.cur_dir = Some(cur_dir.clone());
        state.build_dir = Some(build_dir);

        if !state.populated {
            state.sfs_hash = self.store.get_attributes().await?.into_iter().collect();
            state.populated = true;
        }

        let mut sc_hash = HashMap::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&cur_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some((prefix, hash)) = name.rsplit_once('_') {
                    sc_hash.insert(prefix.to_string(), hash.to_string());
                }
            }
        }
        state.sc_hash = sc_hash;
        Ok(())
    }

    /// Called per registration needing static content (§4.4). Returns
    /// `false` when the Store has no record for `prefix`.
    #[tracing::instrument(skip(self))]
    pub async fn update_static_dir(&self, prefix: &str, content_type: ContentServiceType) -> Result<bool> {
        let (build_dir, cur_dir, wanted_hash, live_hash) = {
            let state = self.state.lock().await;
            let Some(wanted_hash) = state.sfs_hash.get(prefix).cloned() else {
                return Ok(false);
            };
            let build_dir = state.build_dir.clone().ok_or_else(|| {
                FrontendError::StaticContentError("update_static_contents_dict not called before update_static_dir".into())
            })?;
            let cur_dir = state.cur_dir.clone().unwrap_or_else(|| self.dirs.a.clone());
            (build_dir, cur_dir, wanted_hash.clone(), state.sc_hash.get(prefix).cloned())
        };

        let entry_name = format!("{prefix}_{wanted_hash}");
        let dest = build_dir.join(&entry_name);

        if live_hash.as_deref() == Some(wanted_hash.as_str()) {
            let src = cur_dir.join(&entry_name);
            if src.exists() {
                copy_dir_recursive(&src, &dest).await?;
                return Ok(true);
            }
        }

        let Some(bytes) = self.store.get_file(prefix).await? else {
            tracing::warn!(prefix, "static content store has no bytes for a prefix it hashed");
            return Ok(false);
        };
        if !is_valid_tar(&bytes) {
            return Err(FrontendError::StaticContentError(format!("archive for {prefix} is not a valid tar")));
        }

        let mut extract_path = dest.join(prefix);
        if content_type == ContentServiceType::Hybrid {
            extract_path = extract_path.join(HYBRID_STATIC_SUBDIR);
        }
        tokio::fs::create_dir_all(&extract_path).await?;
        extract_tar(&bytes, &extract_path)?;
        Ok(true)
    }

    /// Validates, writes via the Store, and records the new hash.
    /// Duplicate hash is a no-op (§4.4, an intentional divergence from the
    /// source's raising guard, documented in DESIGN.md).
    #[tracing::instrument(skip(self, uploads))]
    pub async fn add_static_content(&self, uploads: Vec<StaticContentUpload>) -> Result<()> {
        for upload in uploads {
            if upload.bytes.is_empty() {
                return Err(FrontendError::StaticContentError(format!("upload for {} is empty", upload.prefix)));
            }
            if upload.bytes.len() as u64 > self.max_content_bytes {
                return Err(FrontendError::StaticContentError(format!(
                    "upload for {} exceeds configured max static content size",
                    upload.prefix
                )));
            }
            if !is_valid_tar(&upload.bytes) {
                return Err(FrontendError::StaticContentError(format!("upload for {} is not a valid tar", upload.prefix)));
            }

            let candidate_hash = crate::static_store::hash_bytes(&upload.bytes);
            let mut state = self.state.lock().await;
            if state.sfs_hash.get(&upload.prefix) == Some(&candidate_hash) {
                continue;
            }
            drop(state);

            let hash = self.store.put_file(&upload.prefix, &upload.bytes).await?;
            self.state.lock().await.sfs_hash.insert(upload.prefix, hash);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, prefixes))]
    pub async fn remove_static_content(&self, prefixes: Vec<String>) -> Result<()> {
        for prefix in prefixes {
            self.store.delete_file(&prefix).await?;
            self.state.lock().await.sfs_hash.remove(&prefix);
        }
        Ok(())
    }

    /// Whether the Store currently has a bundle for `prefix`, per the
    /// in-memory authoritative hash dict (kept current by `add_static_content`/
    /// `remove_static_content` regardless of whether a configure pass ran).
    pub async fn contains_prefix(&self, prefix: &str) -> bool {
        self.state.lock().await.sfs_hash.contains_key(prefix)
    }

    /// Deletes the prior `curDir` tree and atomically relinks
    /// `staticCurrent` to `buildDir` (§4.6 step 7).
    #[tracing::instrument(skip(self))]
    pub async fn update_static_dir_link(&self) -> Result<()> {
        let (cur_dir, build_dir) = {
            let state = self.state.lock().await;
            (
                state.cur_dir.clone().unwrap_or_else(|| self.dirs.a.clone()),
                state.build_dir.clone().ok_or_else(|| {
                    FrontendError::StaticContentError("update_static_contents_dict not called before update_static_dir_link".into())
                })?,
            )
        };

        if cur_dir.exists() {
            tokio::fs::remove_dir_all(&cur_dir).await?;
        }
        let tmp_link = self.dirs.root.join("staticCurrent.tmp");
        if tmp_link.exists() {
            tokio::fs::remove_file(&tmp_link).await.ok();
        }
        #[cfg(unix)]
        tokio::fs::symlink(&build_dir, &tmp_link).await?;
        tokio::fs::rename(&tmp_link, &self.dirs.current_link).await?;
        Ok(())
    }
}

fn is_valid_tar(bytes: &[u8]) -> bool {
    let mut archive = tar::Archive::new(bytes);
    archive.entries().and_then(|mut entries| {
        // Force at least the header of the first entry to be parsed.
        if let Some(first) = entries.next() {
            first?;
        }
        Ok(())
    }).is_ok()
}

fn extract_tar(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .unpack(dest)
        .map_err(|e| FrontendError::StaticContentError(format!("extracting archive into {}: {e}", dest.display())))
}

fn copy_dir_recursive<'a>(src: &'a Path, dest: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dest_path = dest.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dest_path).await?;
            } else {
                tokio::fs::copy(entry.path(), dest_path).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_store::ChunkedRowStore;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct InMemoryChunkedStore {
        rows: TokioMutex<StdHashMap<String, StdHashMap<String, Vec<u8>>>>,
    }

    #[async_trait]
    impl ChunkedRowStore for InMemoryChunkedStore {
        async fn put_column(&self, key: &str, column: &str, value: Vec<u8>) -> Result<()> {
            self.rows.lock().await.entry(key.to_string()).or_default().insert(column.to_string(), value);
            Ok(())
        }
        async fn get_column(&self, key: &str, column: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().await.get(key).and_then(|r| r.get(column)).cloned())
        }
        async fn delete_columns(&self, key: &str, columns: &[String]) -> Result<()> {
            if let Some(row) = self.rows.lock().await.get_mut(key) {
                for c in columns {
                    row.remove(c);
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
                .filter_map(|(k, r)| r.get("hash").map(|h| (k.clone(), String::from_utf8_lossy(h).to_string())))
                .collect())
        }
    }

    fn make_tar(path_in_archive: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, path_in_archive, contents).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn update_static_dir_returns_false_when_store_has_no_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        let handler = StaticContentHandler::new(store, tmp.path().to_path_buf(), None);
        handler.update_static_contents_dict().await.unwrap();
        assert!(!handler.update_static_dir("app/foo", ContentServiceType::StaticOnly).await.unwrap());
    }

    #[tokio::test]
    async fn add_then_update_extracts_tar_into_build_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        let handler = StaticContentHandler::new(store, tmp.path().to_path_buf(), None);
        let archive = make_tar("index.html", b"<html></html>");
        handler
            .add_static_content(vec![StaticContentUpload { prefix: "app/foo".into(), bytes: archive }])
            .await
            .unwrap();
        handler.update_static_contents_dict().await.unwrap();
        assert!(handler.update_static_dir("app/foo", ContentServiceType::StaticOnly).await.unwrap());
    }

    #[tokio::test]
    async fn add_static_content_rejects_empty_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        let handler = StaticContentHandler::new(store, tmp.path().to_path_buf(), None);
        let err = handler
            .add_static_content(vec![StaticContentUpload { prefix: "app/foo".into(), bytes: vec![] }])
            .await
            .unwrap_err();
        assert!(matches!(err, FrontendError::StaticContentError(_)));
    }

    #[tokio::test]
    async fn remove_static_content_clears_store_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StaticContentStore::new(Box::new(InMemoryChunkedStore::default()), 1024);
        let handler = StaticContentHandler::new(store, tmp.path().to_path_buf(), None);
        let archive = make_tar("index.html", b"<html></html>");
        handler
            .add_static_content(vec![StaticContentUpload { prefix: "app/foo".into(), bytes: archive }])
            .await
            .unwrap();
        handler.remove_static_content(vec!["app/foo".into()]).await.unwrap();
        handler.update_static_contents_dict().await.unwrap();
        assert!(!handler.update_static_dir("app/foo", ContentServiceType::StaticOnly).await.unwrap());
    }
}
