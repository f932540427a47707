//! Worker versions and their cache generations
//!
//! A [`Worker`] is one deployed version. Installing it pre-caches the whole
//! app shell into a fresh shell generation, all or nothing; activating it
//! deletes every generation the version does not keep and takes control of
//! the open pages. [`Registration`] remembers which version is active across
//! process restarts.

mod registration;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cache::{CacheStorage, StoreError};
use crate::clients::ClientList;
use crate::config::{ConfigError, WorkerConfig};
use crate::fetch::{FetchError, Fetcher};
use crate::request::Request;
use crate::router::CacheRouter;

pub use registration::{Registration, RegistrationRecord, VersionRecord};

/// Errors that can occur while installing or activating a worker
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// An app-shell resource could not be fetched
    #[error("failed to pre-cache {url}: {source}")]
    ManifestFetch {
        url: String,
        #[source]
        source: FetchError,
    },

    /// An app-shell resource answered with a non-2xx status
    #[error("failed to pre-cache {url}: HTTP {status}")]
    ManifestStatus { url: String, status: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The registration record could not be read or written
    #[error("registration record is unusable: {0}")]
    Record(String),

    /// The operation does not apply in the worker's current state
    #[error("worker {version} is {state}, expected {expected}")]
    InvalidState {
        version: String,
        state: WorkerState,
        expected: WorkerState,
    },

    /// `activate` was requested but no installed version is waiting
    #[error("no installed worker is waiting to activate version {0}")]
    NothingWaiting(String),
}

/// Where a worker version is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Installing,
    /// Shell generation is complete; waiting to take over
    Installed,
    Activating,
    Activated,
    /// Terminal: the app shell could not be cached
    InstallFailed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::InstallFailed => "install-failed",
        };
        f.write_str(name)
    }
}

/// What activation cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// Generations deleted because the new version does not keep them
    pub deleted: Vec<String>,
    /// Pages that came under the worker's control
    pub claimed: usize,
}

/// One deployed version of the worker
#[derive(Debug)]
pub struct Worker {
    config: Arc<WorkerConfig>,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    state: WorkerState,
}

impl Worker {
    /// A worker about to be installed
    pub fn new(config: Arc<WorkerConfig>, storage: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            storage,
            fetcher,
            state: WorkerState::Installing,
        }
    }

    /// A worker whose shell generation was committed by an earlier install
    pub(crate) fn installed(
        config: Arc<WorkerConfig>,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            state: WorkerState::Installed,
            ..Self::new(config, storage, fetcher)
        }
    }

    /// The shell generation tag of this version
    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn expect_state(&self, expected: WorkerState) -> Result<(), LifecycleError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState {
                version: self.version().to_string(),
                state: self.state,
                expected,
            })
        }
    }

    /// Pre-caches the app shell into this version's shell generation
    ///
    /// Every manifest URL is fetched concurrently into a staging area that
    /// is only published once all of them succeeded. Any failure discards
    /// the staging area and leaves the worker in
    /// [`WorkerState::InstallFailed`]; existing generations are untouched.
    pub async fn install(&mut self) -> Result<(), LifecycleError> {
        self.expect_state(WorkerState::Installing)?;
        tracing::info!(version = self.version(), "installing worker");

        match self.populate_shell().await {
            Ok(entries) => {
                self.state = WorkerState::Installed;
                tracing::info!(version = self.version(), entries, "app shell cached");
                Ok(())
            }
            Err(e) => {
                self.state = WorkerState::InstallFailed;
                tracing::warn!(version = self.version(), error = %e, "install failed");
                Err(e)
            }
        }
    }

    async fn populate_shell(&self) -> Result<usize, LifecycleError> {
        self.storage.sweep_staging().await?;
        let urls = self.config.app_shell_urls()?;
        let staged = self.storage.stage(self.version()).await?;
        let store = staged.store().clone();

        let fetches = urls.into_iter().map(|url| {
            let store = store.clone();
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let request = Request::get(url);
                let response =
                    fetcher
                        .fetch(&request)
                        .await
                        .map_err(|source| LifecycleError::ManifestFetch {
                            url: request.url().to_string(),
                            source,
                        })?;
                if !response.is_success() {
                    return Err(LifecycleError::ManifestStatus {
                        url: request.url().to_string(),
                        status: response.status,
                    });
                }
                store.put(request.cache_key(), &response).await?;
                Ok::<_, LifecycleError>(())
            }
        });

        if let Err(e) = futures::future::try_join_all(fetches).await {
            if let Err(discard) = staged.discard().await {
                tracing::warn!(error = %discard, "failed to discard staged shell");
            }
            return Err(e);
        }

        let committed = staged.commit().await?;
        Ok(committed.len().await)
    }

    /// Takes over: deletes generations outside the keep-set and claims every
    /// open page
    pub async fn activate(&mut self, clients: &ClientList) -> Result<ActivationReport, LifecycleError> {
        self.expect_state(WorkerState::Installed)?;
        self.state = WorkerState::Activating;

        let keep = self.config.keep_set();
        let mut deleted = Vec::new();
        for name in self.storage.keys().await? {
            if !keep.contains(&name.as_str()) {
                self.storage.delete(&name).await?;
                tracing::info!(generation = %name, "deleted stale cache generation");
                deleted.push(name);
            }
        }

        let claimed = clients.claim().await;
        self.state = WorkerState::Activated;
        tracing::info!(version = self.version(), claimed, "worker activated");

        Ok(ActivationReport { deleted, claimed })
    }

    /// Router serving requests with this version's shell generation
    pub fn router(&self) -> Result<CacheRouter, ConfigError> {
        CacheRouter::new(
            Arc::clone(&self.config),
            self.version(),
            self.storage.clone(),
            Arc::clone(&self.fetcher),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetch::mock::MockFetcher;
    use crate::request::Response;
    use tempfile::TempDir;

    /// Serves every app-shell path of `config` from the mock site
    pub(crate) async fn serve_shell(fetcher: &MockFetcher, config: &WorkerConfig) {
        for url in config.app_shell_urls().unwrap() {
            let body = format!("shell:{}:{}", config.version, url.path());
            fetcher.serve(url.as_str(), Response::ok(body)).await;
        }
    }

    pub(crate) fn config(version: &str) -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig {
            version: version.to_string(),
            ..Default::default()
        })
    }

    fn setup() -> (CacheStorage, Arc<MockFetcher>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = CacheStorage::with_dir(temp_dir.path().to_path_buf());
        (storage, Arc::new(MockFetcher::new()), temp_dir)
    }

    #[tokio::test]
    async fn test_install_caches_whole_manifest() {
        let (storage, fetcher, _temp_dir) = setup();
        let config = config("mutapa-v3");
        serve_shell(&fetcher, &config).await;

        let mut worker = Worker::new(config.clone(), storage.clone(), fetcher.clone());
        worker.install().await.unwrap();

        assert_eq!(worker.state(), WorkerState::Installed);
        let shell = storage.lookup("mutapa-v3").await.unwrap().unwrap();
        assert_eq!(shell.len().await, 31);
        let offline = shell
            .match_request(&Request::get(config.offline_url().unwrap()))
            .await
            .unwrap();
        assert!(offline.is_some());
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let (storage, fetcher, _temp_dir) = setup();
        let config = config("mutapa-v4");
        serve_shell(&fetcher, &config).await;
        fetcher
            .remove("https://www.mutapatimes.com/js/people.js")
            .await;

        let mut worker = Worker::new(config, storage.clone(), fetcher.clone());
        let result = worker.install().await;

        assert!(matches!(result, Err(LifecycleError::ManifestFetch { .. })));
        assert_eq!(worker.state(), WorkerState::InstallFailed);
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(storage.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let (storage, fetcher, _temp_dir) = setup();
        let config = config("mutapa-v4");
        serve_shell(&fetcher, &config).await;
        fetcher
            .serve(
                "https://www.mutapatimes.com/css/main.css",
                Response::new(404, "missing"),
            )
            .await;

        let mut worker = Worker::new(config, storage.clone(), fetcher.clone());
        let result = worker.install().await;

        assert!(matches!(
            result,
            Err(LifecycleError::ManifestStatus { status: 404, .. })
        ));
        assert!(storage.lookup("mutapa-v4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let (storage, fetcher, _temp_dir) = setup();
        let config = config("mutapa-v3");
        serve_shell(&fetcher, &config).await;

        let mut worker = Worker::new(config, storage, fetcher.clone());
        worker.install().await.unwrap();

        assert!(matches!(
            worker.install().await,
            Err(LifecycleError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_activate_keeps_only_current_generations() {
        let (storage, fetcher, _temp_dir) = setup();
        for old in ["mutapa-v1", "mutapa-v2", "mutapa-data-v1", "mutapa-img-v1"] {
            storage.open(old).await.unwrap();
        }
        let config = config("mutapa-v3");
        serve_shell(&fetcher, &config).await;
        let clients = ClientList::new();
        clients.add("https://www.mutapatimes.com/").await;

        let mut worker = Worker::new(config, storage.clone(), fetcher.clone());
        worker.install().await.unwrap();
        let report = worker.activate(&clients).await.unwrap();

        assert_eq!(worker.state(), WorkerState::Activated);
        assert_eq!(report.deleted, vec!["mutapa-v1".to_string(), "mutapa-v2".to_string()]);
        assert_eq!(report.claimed, 1);
        assert_eq!(
            storage.keys().await.unwrap(),
            vec![
                "mutapa-data-v1".to_string(),
                "mutapa-img-v1".to_string(),
                "mutapa-v3".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let (storage, fetcher, _temp_dir) = setup();
        let mut worker = Worker::new(config("mutapa-v3"), storage, fetcher);

        let result = worker.activate(&ClientList::new()).await;

        assert!(matches!(
            result,
            Err(LifecycleError::InvalidState {
                state: WorkerState::Installing,
                expected: WorkerState::Installed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_install_sweeps_abandoned_staging() {
        let (storage, fetcher, _temp_dir) = setup();
        drop(storage.stage("mutapa-v2").await.unwrap());
        let config = config("mutapa-v3");
        serve_shell(&fetcher, &config).await;

        let mut worker = Worker::new(config, storage.clone(), fetcher.clone());
        worker.install().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(storage.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["mutapa-v3".to_string()]);
    }

    #[test]
    fn test_worker_state_display() {
        assert_eq!(WorkerState::InstallFailed.to_string(), "install-failed");
        assert_eq!(WorkerState::Activated.to_string(), "activated");
    }
}
