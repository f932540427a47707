//! The persisted registration: which version is active and which is waiting

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{ActivationReport, LifecycleError, Worker, WorkerState};
use crate::cache::CacheStorage;
use crate::clients::ClientList;
use crate::config::{ConfigError, WorkerConfig};
use crate::fetch::Fetcher;
use crate::router::CacheRouter;

const REGISTRATION_FILE: &str = "registration.json";

/// One installed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Contents of `registration.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Version currently serving requests
    pub active: Option<VersionRecord>,
    /// Installed version waiting for `activate`
    pub waiting: Option<VersionRecord>,
}

/// Registration of the worker for one cache directory
///
/// Drives updates the way a browser does: the new version installs next to
/// the active one, and only takes over once its install succeeded. A failed
/// install leaves the active version and its generations in place.
#[derive(Debug)]
pub struct Registration {
    path: PathBuf,
    record: RegistrationRecord,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    clients: ClientList,
}

impl Registration {
    /// Loads the registration stored under the storage root, if any
    ///
    /// Generations left half-replaced by an interrupted install are put back
    /// first, so the active version always finds its shell generation.
    pub async fn open(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        clients: ClientList,
    ) -> Result<Self, LifecycleError> {
        storage.recover_retired().await?;
        let path = storage.root().join(REGISTRATION_FILE);
        let record = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                LifecycleError::Record(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistrationRecord::default(),
            Err(e) => return Err(LifecycleError::Record(format!("{}: {}", path.display(), e))),
        };

        Ok(Self {
            path,
            record,
            storage,
            fetcher,
            clients,
        })
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    pub fn active(&self) -> Option<&VersionRecord> {
        self.record.active.as_ref()
    }

    pub fn waiting(&self) -> Option<&VersionRecord> {
        self.record.waiting.as_ref()
    }

    async fn save(&self) -> Result<(), LifecycleError> {
        let record_error = |e: std::io::Error| {
            LifecycleError::Record(format!("{}: {}", self.path.display(), e))
        };
        let json = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| LifecycleError::Record(e.to_string()))?;

        fs::create_dir_all(self.storage.root())
            .await
            .map_err(record_error)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await.map_err(record_error)?;
        fs::rename(&tmp, &self.path).await.map_err(record_error)?;
        Ok(())
    }

    /// Installs the version described by `config`
    ///
    /// With `skip_waiting` set the new version is activated straight away;
    /// otherwise it is recorded as waiting. Reinstalling the active version
    /// replaces its shell generation in place, so it is reactivated rather
    /// than left waiting. On install failure the record is left as it was
    /// and the error is returned.
    pub async fn update(&mut self, config: Arc<WorkerConfig>) -> Result<Worker, LifecycleError> {
        let mut worker = Worker::new(
            Arc::clone(&config),
            self.storage.clone(),
            Arc::clone(&self.fetcher),
        );
        worker.install().await?;

        let refreshing = self.state_of(worker.version()) == Some(WorkerState::Activated);
        if refreshing {
            tracing::info!(version = worker.version(), "reinstalled active worker");
            self.promote(&mut worker).await?;
            return Ok(worker);
        }

        self.record.waiting = Some(VersionRecord {
            version: worker.version().to_string(),
            installed_at: Utc::now(),
            activated_at: None,
        });

        if config.skip_waiting {
            self.promote(&mut worker).await?;
        } else {
            tracing::info!(version = worker.version(), "installed worker is waiting");
            self.save().await?;
        }
        Ok(worker)
    }

    /// Activates the waiting version, which must match `config.version`
    pub async fn activate_waiting(
        &mut self,
        config: Arc<WorkerConfig>,
    ) -> Result<(Worker, ActivationReport), LifecycleError> {
        let is_waiting = self.state_of(&config.version) == Some(WorkerState::Installed);
        if !is_waiting || !self.storage.has(&config.version).await? {
            return Err(LifecycleError::NothingWaiting(config.version.clone()));
        }

        let mut worker = Worker::installed(config, self.storage.clone(), Arc::clone(&self.fetcher));
        let report = self.promote(&mut worker).await?;
        Ok((worker, report))
    }

    async fn promote(&mut self, worker: &mut Worker) -> Result<ActivationReport, LifecycleError> {
        let report = worker.activate(&self.clients).await?;

        let promoted_waiting = self.waiting().is_some_and(|w| w.version == worker.version());
        let lost_waiting = self
            .waiting()
            .is_some_and(|w| report.deleted.contains(&w.version));
        let installed_at = if promoted_waiting {
            self.record.waiting.take().map(|w| w.installed_at)
        } else {
            if lost_waiting {
                self.record.waiting = None;
            }
            None
        }
        .unwrap_or_else(Utc::now);
        self.record.active = Some(VersionRecord {
            version: worker.version().to_string(),
            installed_at,
            activated_at: Some(Utc::now()),
        });
        self.save().await?;
        Ok(report)
    }

    /// Router for the active version, if one is active
    ///
    /// The shell generation comes from the registration record rather than
    /// `config.version`, so a configured-but-uninstalled version never
    /// takes over serving.
    pub fn router(&self, config: Arc<WorkerConfig>) -> Result<Option<CacheRouter>, ConfigError> {
        match self.active() {
            Some(active) => CacheRouter::new(
                config,
                active.version.clone(),
                self.storage.clone(),
                Arc::clone(&self.fetcher),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// State of `version` as far as this registration knows
    pub fn state_of(&self, version: &str) -> Option<WorkerState> {
        if self.active().is_some_and(|a| a.version == version) {
            Some(WorkerState::Activated)
        } else if self.waiting().is_some_and(|w| w.version == version) {
            Some(WorkerState::Installed)
        } else {
            None
        }
    }
}
