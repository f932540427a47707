//! A single cache generation on disk
//!
//! Each generation is a directory holding one JSON file per entry plus an
//! `index.json` that records the keys in insertion order. The index is the
//! source of truth for what the generation contains and in which order
//! entries are evicted.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use super::StoreError;
use crate::request::{CacheKey, Request, Response};

/// Name of the insertion-order index inside a generation directory
const INDEX_FILE: &str = "index.json";

/// Wrapper struct for a response stored on disk
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    /// Body bytes, base64 encoded
    body: String,
    cached_at: DateTime<Utc>,
}

/// One line of the insertion-order index
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: CacheKey,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreIndex {
    /// Oldest first
    entries: VecDeque<IndexEntry>,
}

impl StoreIndex {
    fn position(&self, key: &CacheKey) -> Option<usize> {
        self.entries.iter().position(|e| &e.key == key)
    }
}

/// Result of reading from a generation, including when the entry was stored
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// The stored response
    pub response: Response,
    /// When the response was written
    pub cached_at: DateTime<Utc>,
}

/// Handle to one named cache generation
///
/// Clones share the same in-memory index, so every handle obtained from the
/// same [`CacheStorage`](super::CacheStorage) sees the same contents. Each
/// operation holds the index lock for its whole duration, which makes
/// individual get/put/delete calls atomic with respect to each other.
#[derive(Debug, Clone)]
pub struct CacheStore {
    name: String,
    dir: PathBuf,
    index: Arc<Mutex<StoreIndex>>,
}

impl CacheStore {
    /// Loads the generation stored in `dir`, or an empty one if nothing is
    /// there yet. Does not create the directory.
    pub(crate) async fn load(name: &str, dir: PathBuf) -> Result<Self, StoreError> {
        let index = match fs::read_to_string(dir.join(INDEX_FILE)).await {
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: dir.join(INDEX_FILE),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreIndex::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            name: name.to_string(),
            dir,
            index: Arc::new(Mutex::new(index)),
        })
    }

    /// Creates `dir` holding an empty generation, or loads the one already
    /// there. The index file marks the directory as a generation.
    pub(crate) async fn create(name: &str, dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).await?;
        let store = Self::load(name, dir).await?;
        if !is_generation(&store.dir).await? {
            let index = store.index.lock().await;
            store.write_index(&index).await?;
        }
        Ok(store)
    }

    /// The generation tag this store was opened under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding the entry for `key`
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let digest = Sha256::digest(key.as_str().as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Looks up the stored response for a request
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        Ok(self
            .get(&request.cache_key())
            .await?
            .map(|cached| cached.response))
    }

    /// Reads an entry
    ///
    /// Returns `None` if the key is not in the index. An entry file that has
    /// gone missing underneath the index is also reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError> {
        let index = self.index.lock().await;
        if index.position(key).is_none() {
            return Ok(None);
        }

        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(generation = %self.name, %key, "indexed entry has no file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        drop(index);

        let entry: StoredEntry =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt { path, source })?;
        let body = STANDARD.decode(entry.body.as_bytes())?;

        Ok(Some(CachedResponse {
            response: Response {
                status: entry.status,
                status_text: entry.status_text,
                headers: entry.headers,
                body: body.into(),
            },
            cached_at: entry.cached_at,
        }))
    }

    /// Stores a response under `key`, replacing any existing entry
    ///
    /// A replaced entry moves to the newest position in insertion order.
    pub async fn put(&self, key: CacheKey, response: &Response) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;

        let now = Utc::now();
        let entry = StoredEntry {
            key: key.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: STANDARD.encode(&response.body),
            cached_at: now,
        };
        let json = serde_json::to_string(&entry).map_err(|source| StoreError::Corrupt {
            path: self.entry_path(&key),
            source,
        })?;
        write_atomic(&self.entry_path(&key), json.as_bytes()).await?;

        let mut next = index.clone();
        if let Some(pos) = next.position(&key) {
            next.entries.remove(pos);
        }
        next.entries.push_back(IndexEntry {
            key,
            inserted_at: now,
        });
        self.write_index(&next).await?;
        *index = next;

        Ok(())
    }

    /// Removes an entry, returning whether it existed
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut index = self.index.lock().await;
        let Some(pos) = index.position(key) else {
            return Ok(false);
        };

        let mut next = index.clone();
        next.entries.remove(pos);
        self.write_index(&next).await?;
        *index = next;
        remove_if_exists(&self.entry_path(key)).await?;

        Ok(true)
    }

    /// All keys, oldest first
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.index
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.key.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    /// Evicts oldest-inserted entries until at most `limit` remain
    ///
    /// Returns the evicted keys, oldest first.
    pub async fn trim(&self, limit: usize) -> Result<Vec<CacheKey>, StoreError> {
        let mut index = self.index.lock().await;
        if index.entries.len() <= limit {
            return Ok(Vec::new());
        }

        let mut next = index.clone();
        let mut evicted = Vec::new();
        while next.entries.len() > limit {
            if let Some(oldest) = next.entries.pop_front() {
                evicted.push(oldest.key);
            }
        }
        self.write_index(&next).await?;
        *index = next;

        for key in &evicted {
            remove_if_exists(&self.entry_path(key)).await?;
        }
        Ok(evicted)
    }

    async fn write_index(&self, index: &StoreIndex) -> Result<(), StoreError> {
        let path = self.dir.join(INDEX_FILE);
        let json = serde_json::to_string_pretty(index).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, json.as_bytes()).await
    }
}

/// Whether `dir` holds a generation written by this crate
pub(crate) async fn is_generation(dir: &Path) -> Result<bool, StoreError> {
    Ok(fs::try_exists(dir.join(INDEX_FILE)).await?)
}

/// Writes `contents` next to `path` and renames it into place
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use url::Url;

    /// Helper to create an empty store in a temp directory
    async fn create_test_store() -> (CacheStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let dir = temp_dir.path().join("mutapa-img-v1");
        fs::create_dir_all(&dir).await.unwrap();
        let store = CacheStore::load("mutapa-img-v1", dir).await.unwrap();
        (store, temp_dir)
    }

    fn key(path: &str) -> CacheKey {
        Request::get(Url::parse(&format!("https://www.mutapatimes.com{}", path)).unwrap()).cache_key()
    }

    #[tokio::test]
    async fn test_get_returns_none_for_missing_key() {
        let (store, _temp_dir) = create_test_store().await;
        assert!(store.get(&key("/img/a.png")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get_returns_same_response() {
        let (store, _temp_dir) = create_test_store().await;
        let response = Response::ok(vec![0u8, 159, 146, 150])
            .with_header("Content-Type", "image/png");

        store.put(key("/img/a.png"), &response).await.unwrap();

        let cached = store.get(&key("/img/a.png")).await.unwrap().unwrap();
        assert_eq!(cached.response, response);
    }

    #[tokio::test]
    async fn test_put_overwrites_and_moves_to_newest() {
        let (store, _temp_dir) = create_test_store().await;
        store.put(key("/img/a.png"), &Response::ok("a1")).await.unwrap();
        store.put(key("/img/b.png"), &Response::ok("b")).await.unwrap();
        store.put(key("/img/a.png"), &Response::ok("a2")).await.unwrap();

        assert_eq!(store.keys().await, vec![key("/img/b.png"), key("/img/a.png")]);
        let cached = store.get(&key("/img/a.png")).await.unwrap().unwrap();
        assert_eq!(cached.response.body.as_ref(), b"a2");
    }

    #[tokio::test]
    async fn test_delete_removes_entry_and_file() {
        let (store, _temp_dir) = create_test_store().await;
        store.put(key("/img/a.png"), &Response::ok("a")).await.unwrap();
        let path = store.entry_path(&key("/img/a.png"));
        assert!(path.exists());

        assert!(store.delete(&key("/img/a.png")).await.unwrap());
        assert!(!path.exists());
        assert_eq!(store.len().await, 0);
        assert!(!store.delete(&key("/img/a.png")).await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_evicts_oldest_first() {
        let (store, _temp_dir) = create_test_store().await;
        for i in 0..5 {
            store
                .put(key(&format!("/img/{}.png", i)), &Response::ok("x"))
                .await
                .unwrap();
        }

        let evicted = store.trim(3).await.unwrap();

        assert_eq!(evicted, vec![key("/img/0.png"), key("/img/1.png")]);
        assert_eq!(store.len().await, 3);
        assert!(store.get(&key("/img/0.png")).await.unwrap().is_none());
        assert!(store.get(&key("/img/4.png")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_trim_within_limit_is_noop() {
        let (store, _temp_dir) = create_test_store().await;
        store.put(key("/img/a.png"), &Response::ok("a")).await.unwrap();
        assert!(store.trim(100).await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_insertion_order_survives_reload() {
        let (store, _temp_dir) = create_test_store().await;
        store.put(key("/img/b.png"), &Response::ok("b")).await.unwrap();
        store.put(key("/img/a.png"), &Response::ok("a")).await.unwrap();

        let reloaded = CacheStore::load("mutapa-img-v1", store.dir().to_path_buf())
            .await
            .unwrap();

        assert_eq!(reloaded.keys().await, vec![key("/img/b.png"), key("/img/a.png")]);
        let cached = reloaded.get(&key("/img/a.png")).await.unwrap().unwrap();
        assert_eq!(cached.response.body.as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_missing_entry_file_reads_as_miss() {
        let (store, _temp_dir) = create_test_store().await;
        store.put(key("/img/a.png"), &Response::ok("a")).await.unwrap();
        fs::remove_file(store.entry_path(&key("/img/a.png"))).await.unwrap();

        assert!(store.get(&key("/img/a.png")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_index_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("broken");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(INDEX_FILE), "not json").await.unwrap();

        let result = CacheStore::load("broken", dir).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
