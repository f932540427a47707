//! Registry of named cache generations
//!
//! `CacheStorage` owns generations under the cache root directory. A
//! subdirectory is a generation only if it carries an index file, so other
//! data sharing the root is never listed or deleted. Dot-prefixed
//! directories are staging areas for an install in progress, or a replaced
//! generation waiting to be removed, and are never reported as generations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use tokio::fs;
use tokio::sync::Mutex;

use super::store::is_generation;
use super::{CacheStore, StoreError};

/// Prefix of directories holding a generation that is still being filled
const STAGING_PREFIX: &str = ".staging-";

/// Prefix of a generation moved aside while a staged one replaces it
const RETIRED_PREFIX: &str = ".retired-";

/// Manages the set of cache generations under one root directory
///
/// Stores opened through the same `CacheStorage` (or any of its clones) are
/// shared, so concurrent requests observe each other's writes.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    /// Directory where generations are stored
    root: PathBuf,
    /// Generations opened so far
    open: Arc<Mutex<HashMap<String, CacheStore>>>,
}

impl CacheStorage {
    /// Creates a CacheStorage using the XDG-compliant cache directory
    ///
    /// Uses `~/.cache/mutapa-worker/` on Linux, or the platform equivalent.
    /// Returns `None` if the cache directory cannot be determined (e.g., no
    /// home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "mutapa-worker")?;
        Some(Self::with_dir(project_dirs.cache_dir().to_path_buf()))
    }

    /// Creates a CacheStorage rooted at a custom directory
    pub fn with_dir(root: PathBuf) -> Self {
        Self {
            root,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The directory all generations live under
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", STAGING_PREFIX, name))
    }

    fn retired_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", RETIRED_PREFIX, name))
    }

    /// Opens a generation, creating it if it does not exist
    pub async fn open(&self, name: &str) -> Result<CacheStore, StoreError> {
        validate_name(name)?;
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(name) {
            return Ok(store.clone());
        }

        let store = CacheStore::create(name, self.generation_dir(name)).await?;
        open.insert(name.to_string(), store.clone());
        tracing::debug!(generation = name, "opened cache generation");
        Ok(store)
    }

    /// Opens a generation only if it already exists
    pub async fn lookup(&self, name: &str) -> Result<Option<CacheStore>, StoreError> {
        validate_name(name)?;
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(name) {
            return Ok(Some(store.clone()));
        }

        let dir = self.generation_dir(name);
        if !is_generation(&dir).await? {
            return Ok(None);
        }
        let store = CacheStore::load(name, dir).await?;
        open.insert(name.to_string(), store.clone());
        Ok(Some(store))
    }

    /// Whether a generation with this name exists
    pub async fn has(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        is_generation(&self.generation_dir(name)).await
    }

    /// Names of all committed generations, sorted
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && is_generation(&entry.path()).await? {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes a generation and everything in it, returning whether it existed
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        let mut open = self.open.lock().await;
        open.remove(name);

        let dir = self.generation_dir(name);
        if !is_generation(&dir).await? {
            return Ok(false);
        }
        match fs::remove_dir_all(dir).await {
            Ok(()) => {
                tracing::debug!(generation = name, "deleted cache generation");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Starts filling a generation that stays invisible until committed
    ///
    /// Any leftover staging area for the same name is discarded first.
    pub async fn stage(&self, name: &str) -> Result<StagedGeneration, StoreError> {
        validate_name(name)?;
        let dir = self.staging_dir(name);
        remove_dir_if_exists(&dir).await?;
        let store = CacheStore::create(name, dir).await?;

        Ok(StagedGeneration {
            storage: self.clone(),
            name: name.to_string(),
            store,
        })
    }

    /// Removes staging areas left behind by interrupted installs
    ///
    /// Returns how many were removed.
    pub async fn sweep_staging(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) && entry.file_type().await?.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
                tracing::info!(staging = %name, "removed abandoned install");
                removed += 1;
            }
        }
        self.recover_retired().await?;
        Ok(removed)
    }

    /// Finishes commits that were interrupted between their two renames
    ///
    /// A retired generation whose replacement is in place is deleted; one
    /// whose replacement never arrived is moved back. Returns how many
    /// generations were restored.
    pub async fn recover_retired(&self) -> Result<usize, StoreError> {
        let mut restored = 0;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let _open = self.open.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_prefix(RETIRED_PREFIX) else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let target = self.generation_dir(name);
            if is_generation(&target).await? {
                fs::remove_dir_all(entry.path()).await?;
            } else {
                remove_dir_if_exists(&target).await?;
                fs::rename(entry.path(), &target).await?;
                tracing::warn!(generation = name, "restored generation after interrupted commit");
                restored += 1;
            }
        }
        Ok(restored)
    }
}

/// A generation being populated off to the side
///
/// Nothing written here is visible through [`CacheStorage::open`] or
/// [`CacheStorage::keys`] until [`commit`](Self::commit) renames it into
/// place. Dropping it without committing leaves a staging directory that
/// [`CacheStorage::sweep_staging`] cleans up later.
#[derive(Debug)]
pub struct StagedGeneration {
    storage: CacheStorage,
    name: String,
    store: CacheStore,
}

impl StagedGeneration {
    /// The store to write entries into
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Publishes the staged generation under its name, replacing any
    /// existing generation with that name
    ///
    /// An existing generation is renamed aside before the staged one takes
    /// its place, so there is always a complete generation on disk for
    /// [`CacheStorage::recover_retired`] to fall back to.
    pub async fn commit(self) -> Result<CacheStore, StoreError> {
        let mut open = self.storage.open.lock().await;
        let target = self.storage.generation_dir(&self.name);
        let retired = self.storage.retired_dir(&self.name);

        remove_dir_if_exists(&retired).await?;
        let replacing = match fs::rename(&target, &retired).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        fs::rename(self.store.dir(), &target).await?;
        if replacing {
            fs::remove_dir_all(&retired).await?;
        }

        let store = CacheStore::load(&self.name, target).await?;
        open.insert(self.name.clone(), store.clone());
        Ok(store)
    }

    /// Throws the staged contents away
    pub async fn discard(self) -> Result<(), StoreError> {
        remove_dir_if_exists(self.store.dir()).await
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Generation names become directory names
fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, Response};
    use tempfile::TempDir;
    use url::Url;

    fn create_test_storage() -> (CacheStorage, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = CacheStorage::with_dir(temp_dir.path().to_path_buf());
        (storage, temp_dir)
    }

    fn request(path: &str) -> Request {
        Request::get(Url::parse(&format!("https://www.mutapatimes.com{}", path)).unwrap())
    }

    #[tokio::test]
    async fn test_open_creates_generation() {
        let (storage, temp_dir) = create_test_storage();
        storage.open("mutapa-v3").await.unwrap();

        assert!(temp_dir.path().join("mutapa-v3").is_dir());
        assert_eq!(storage.keys().await.unwrap(), vec!["mutapa-v3".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_does_not_create() {
        let (storage, temp_dir) = create_test_storage();
        assert!(storage.lookup("mutapa-v3").await.unwrap().is_none());
        assert!(!temp_dir.path().join("mutapa-v3").exists());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_handles_share_contents() {
        let (storage, _temp_dir) = create_test_storage();
        let a = storage.open("mutapa-data-v1").await.unwrap();
        let b = storage.clone().open("mutapa-data-v1").await.unwrap();

        let req = request("/data/news.json");
        a.put(req.cache_key(), &Response::ok("[]")).await.unwrap();

        assert!(b.match_request(&req).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_generation() {
        let (storage, _temp_dir) = create_test_storage();
        storage.open("mutapa-v2").await.unwrap();
        storage.open("mutapa-v3").await.unwrap();

        assert!(storage.delete("mutapa-v2").await.unwrap());
        assert!(!storage.delete("mutapa-v2").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["mutapa-v3".to_string()]);
    }

    #[tokio::test]
    async fn test_staged_generation_hidden_until_commit() {
        let (storage, _temp_dir) = create_test_storage();
        let staged = storage.stage("mutapa-v4").await.unwrap();
        let req = request("/index.html");
        staged
            .store()
            .put(req.cache_key(), &Response::ok("<html>"))
            .await
            .unwrap();

        assert!(storage.keys().await.unwrap().is_empty());
        assert!(storage.lookup("mutapa-v4").await.unwrap().is_none());

        let store = staged.commit().await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["mutapa-v4".to_string()]);
        assert!(store.match_request(&req).await.unwrap().is_some());
        let reopened = storage.open("mutapa-v4").await.unwrap();
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing_behind() {
        let (storage, temp_dir) = create_test_storage();
        let staged = storage.stage("mutapa-v4").await.unwrap();
        staged.discard().await.unwrap();

        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_abandoned_staging() {
        let (storage, _temp_dir) = create_test_storage();
        let staged = storage.stage("mutapa-v4").await.unwrap();
        drop(staged);
        storage.open("mutapa-img-v1").await.unwrap();

        assert_eq!(storage.sweep_staging().await.unwrap(), 1);
        assert_eq!(storage.keys().await.unwrap(), vec!["mutapa-img-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_foreign_directories_are_not_generations() {
        let (storage, temp_dir) = create_test_storage();
        let notes = temp_dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(notes.join("todo.txt"), "keep me").unwrap();
        storage.open("mutapa-v3").await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["mutapa-v3".to_string()]);
        assert!(!storage.has("notes").await.unwrap());
        assert!(storage.lookup("notes").await.unwrap().is_none());
        assert!(!storage.delete("notes").await.unwrap());
        assert!(notes.join("todo.txt").exists());
    }

    #[tokio::test]
    async fn test_commit_replaces_existing_generation() {
        let (storage, temp_dir) = create_test_storage();
        let req = request("/index.html");
        let old = storage.open("mutapa-v3").await.unwrap();
        old.put(req.cache_key(), &Response::ok("old")).await.unwrap();

        let staged = storage.stage("mutapa-v3").await.unwrap();
        staged
            .store()
            .put(req.cache_key(), &Response::ok("new"))
            .await
            .unwrap();
        let store = staged.commit().await.unwrap();

        let served = store.match_request(&req).await.unwrap().unwrap();
        assert_eq!(served.body.as_ref(), b"new");
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["mutapa-v3".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupted_commit_restores_previous_generation() {
        let (storage, temp_dir) = create_test_storage();
        let req = request("/index.html");
        let old = storage.open("mutapa-v3").await.unwrap();
        old.put(req.cache_key(), &Response::ok("old")).await.unwrap();
        // Crash after the live generation was moved aside
        std::fs::rename(
            temp_dir.path().join("mutapa-v3"),
            temp_dir.path().join(".retired-mutapa-v3"),
        )
        .unwrap();

        let fresh = CacheStorage::with_dir(temp_dir.path().to_path_buf());
        assert!(fresh.keys().await.unwrap().is_empty());
        assert_eq!(fresh.recover_retired().await.unwrap(), 1);

        let store = fresh.lookup("mutapa-v3").await.unwrap().unwrap();
        let served = store.match_request(&req).await.unwrap().unwrap();
        assert_eq!(served.body.as_ref(), b"old");
        assert!(!temp_dir.path().join(".retired-mutapa-v3").exists());
    }

    #[tokio::test]
    async fn test_retired_copy_dropped_when_replacement_landed() {
        let (storage, temp_dir) = create_test_storage();
        storage.open("mutapa-v3").await.unwrap();
        let retired = temp_dir.path().join(".retired-mutapa-v3");
        std::fs::create_dir_all(&retired).unwrap();
        std::fs::write(retired.join("index.json"), r#"{"entries":[]}"#).unwrap();

        assert_eq!(storage.recover_retired().await.unwrap(), 0);
        assert!(!retired.exists());
        assert!(storage.has("mutapa-v3").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (storage, _temp_dir) = create_test_storage();
        for name in ["", ".hidden", "a/b", ".."] {
            assert!(matches!(
                storage.open(name).await,
                Err(StoreError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_new_creates_xdg_compliant_path() {
        if let Some(storage) = CacheStorage::new() {
            let path_str = storage.root().to_string_lossy();
            assert!(
                path_str.contains("mutapa-worker"),
                "Cache path should contain project name"
            );
        }
        // Test passes if new() returns None (e.g., no home directory in CI)
    }
}
