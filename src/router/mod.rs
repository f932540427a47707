//! Request routing over the cache generations
//!
//! The router sits at the network boundary: every request a page issues is
//! classified (see [`classify`]) and then either left alone or satisfied by
//! one of three caching strategies:
//!
//! - network-first for `/data/*.json` (data generation)
//! - stale-while-revalidate for images (image generation, size-bounded)
//! - cache-first for everything else (the version's shell generation),
//!   with the offline page as the last resort for navigations
//!
//! Network failures never escape except where there is nothing at all to
//! serve: a data or image request with no stored copy, a sub-resource
//! missing from the shell, or a navigation when even the offline page is
//! gone.

pub mod classify;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::cache::{CacheStorage, CacheStore};
use crate::config::{ConfigError, WorkerConfig};
use crate::fetch::{FetchError, Fetcher};
use crate::request::{CacheKey, Request, Response};

pub use classify::{Classifier, Strategy};

/// Errors surfaced to the page when a request cannot be satisfied
#[derive(Debug, Error)]
pub enum RouteError {
    /// Network failed and no stored copy exists
    #[error("{url} is unavailable offline: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: FetchError,
    },

    /// A navigation failed and the offline page is not cached either
    #[error("{url} is unavailable and no offline page is cached: {source}")]
    NoOfflinePage {
        url: String,
        #[source]
        source: FetchError,
    },
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::OfflineFallback => "offline-fallback",
        };
        f.write_str(name)
    }
}

/// A response the router produced for a request
#[derive(Debug, Clone)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
    pub strategy: Strategy,
}

impl Served {
    fn new(response: Response, source: ResponseSource, strategy: Strategy) -> Self {
        Self {
            response,
            source,
            strategy,
        }
    }
}

/// Outcome of intercepting a request
#[derive(Debug, Clone)]
pub enum Routed {
    /// The request must go to the network untouched
    Bypass,
    /// The router answered the request
    Served(Served),
}

/// Classifies requests and applies the caching strategies
///
/// Built once per worker version. Background revalidations are owned by the
/// router; dropping it aborts any that are still running, the same way a
/// terminated worker loses unfinished work.
#[derive(Debug)]
pub struct CacheRouter {
    config: Arc<WorkerConfig>,
    /// Shell generation of the version this router serves
    shell_cache: String,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    offline_key: CacheKey,
    revalidations: Mutex<JoinSet<()>>,
}

impl CacheRouter {
    /// Creates a router serving the app shell from `shell_cache`
    pub fn new(
        config: Arc<WorkerConfig>,
        shell_cache: impl Into<String>,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ConfigError> {
        let offline_key = Request::get(config.offline_url()?).cache_key();
        let classifier = Classifier::new(&config.network_only_hosts);

        Ok(Self {
            config,
            shell_cache: shell_cache.into(),
            storage,
            fetcher,
            classifier,
            offline_key,
            revalidations: Mutex::new(JoinSet::new()),
        })
    }

    /// The shell generation this router reads from
    pub fn shell_cache(&self) -> &str {
        &self.shell_cache
    }

    pub fn classify(&self, request: &Request) -> Strategy {
        self.classifier.classify(request)
    }

    /// Intercepts a request
    ///
    /// Returns [`Routed::Bypass`] without touching any cache generation when
    /// the request must go straight to the network.
    pub async fn handle(&self, request: &Request) -> Result<Routed, RouteError> {
        let strategy = self.classify(request);
        tracing::debug!(url = %request.url(), %strategy, "routing request");

        let served = match strategy {
            Strategy::Bypass => return Ok(Routed::Bypass),
            Strategy::NetworkFirst => self.network_first(request).await?,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await?,
            Strategy::CacheFirst => self.cache_first(request).await?,
        };
        Ok(Routed::Served(served))
    }

    /// Intercepts a request and performs the plain network fetch for
    /// bypassed ones
    pub async fn fetch(&self, request: &Request) -> Result<Served, RouteError> {
        match self.handle(request).await? {
            Routed::Served(served) => Ok(served),
            Routed::Bypass => {
                let response =
                    self.fetcher
                        .fetch(request)
                        .await
                        .map_err(|source| RouteError::Unavailable {
                            url: request.url().to_string(),
                            source,
                        })?;
                Ok(Served::new(response, ResponseSource::Network, Strategy::Bypass))
            }
        }
    }

    /// Waits for every background revalidation started so far
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.revalidations.lock().await);
            if pending.is_empty() {
                break;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "revalidation task did not complete");
                }
            }
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Served, RouteError> {
        let key = request.cache_key();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(&self.config.data_cache, key, &response).await;
                }
                Ok(Served::new(
                    response,
                    ResponseSource::Network,
                    Strategy::NetworkFirst,
                ))
            }
            Err(source) => {
                tracing::debug!(url = %request.url(), error = %source, "network failed, trying data cache");
                match self.cached(&self.config.data_cache, &key).await {
                    Some(response) => Ok(Served::new(
                        response,
                        ResponseSource::Cache,
                        Strategy::NetworkFirst,
                    )),
                    None => Err(RouteError::Unavailable {
                        url: request.url().to_string(),
                        source,
                    }),
                }
            }
        }
    }

    async fn stale_while_revalidate(&self, request: &Request) -> Result<Served, RouteError> {
        let store = match self.storage.open(&self.config.image_cache).await {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(generation = %self.config.image_cache, error = %e, "image cache unavailable");
                return self.fetch_uncached(request).await;
            }
        };
        let cached = read_entry(&store, &request.cache_key()).await;
        let refresh = revalidate(
            Arc::clone(&self.fetcher),
            store,
            request.clone(),
            self.config.image_cache_limit,
        );

        match cached {
            Some(response) => {
                let url = request.url().clone();
                let mut tasks = self.revalidations.lock().await;
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move {
                    if let Err(e) = refresh.await {
                        tracing::debug!(%url, error = %e, "background refresh failed");
                    }
                });
                Ok(Served::new(
                    response,
                    ResponseSource::Cache,
                    Strategy::StaleWhileRevalidate,
                ))
            }
            None => match refresh.await {
                Ok(response) => Ok(Served::new(
                    response,
                    ResponseSource::Network,
                    Strategy::StaleWhileRevalidate,
                )),
                Err(source) => Err(RouteError::Unavailable {
                    url: request.url().to_string(),
                    source,
                }),
            },
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Served, RouteError> {
        let key = request.cache_key();
        if let Some(response) = self.cached(&self.shell_cache, &key).await {
            return Ok(Served::new(
                response,
                ResponseSource::Cache,
                Strategy::CacheFirst,
            ));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(&self.shell_cache, key, &response).await;
                }
                Ok(Served::new(
                    response,
                    ResponseSource::Network,
                    Strategy::CacheFirst,
                ))
            }
            Err(source) if request.is_navigation() => {
                match self.cached(&self.shell_cache, &self.offline_key).await {
                    Some(page) => {
                        tracing::info!(url = %request.url(), "serving offline page");
                        Ok(Served::new(
                            page,
                            ResponseSource::OfflineFallback,
                            Strategy::CacheFirst,
                        ))
                    }
                    None => Err(RouteError::NoOfflinePage {
                        url: request.url().to_string(),
                        source,
                    }),
                }
            }
            Err(source) => Err(RouteError::Unavailable {
                url: request.url().to_string(),
                source,
            }),
        }
    }

    /// Network fetch with no caching at all, used when a generation cannot
    /// be opened
    async fn fetch_uncached(&self, request: &Request) -> Result<Served, RouteError> {
        let strategy = self.classify(request);
        self.fetcher
            .fetch(request)
            .await
            .map(|response| Served::new(response, ResponseSource::Network, strategy))
            .map_err(|source| RouteError::Unavailable {
                url: request.url().to_string(),
                source,
            })
    }

    /// Reads an entry from a generation if both exist; storage errors count
    /// as a miss
    async fn cached(&self, generation: &str, key: &CacheKey) -> Option<Response> {
        match self.storage.lookup(generation).await {
            Ok(Some(store)) => read_entry(&store, key).await,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(generation, error = %e, "cache generation unreadable");
                None
            }
        }
    }

    /// Writes a copy of a response; failures are logged and dropped
    async fn store(&self, generation: &str, key: CacheKey, response: &Response) {
        let result = match self.storage.open(generation).await {
            Ok(store) => store.put(key, response).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(generation, error = %e, "failed to store response");
        }
    }
}

async fn read_entry(store: &CacheStore, key: &CacheKey) -> Option<Response> {
    match store.get(key).await {
        Ok(Some(cached)) => {
            tracing::debug!(generation = store.name(), %key, cached_at = %cached.cached_at, "cache hit");
            Some(cached.response)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(generation = store.name(), %key, error = %e, "cache entry unreadable");
            None
        }
    }
}

/// Fetches an image, stores a successful response and bounds the generation
async fn revalidate(
    fetcher: Arc<dyn Fetcher>,
    store: CacheStore,
    request: Request,
    limit: usize,
) -> Result<Response, FetchError> {
    let response = fetcher.fetch(&request).await?;
    if !response.is_success() {
        return Ok(response);
    }

    if let Err(e) = store.put(request.cache_key(), &response).await {
        tracing::warn!(generation = store.name(), error = %e, "failed to store image");
        return Ok(response);
    }
    match store.trim(limit).await {
        Ok(evicted) => {
            for key in evicted {
                tracing::debug!(generation = store.name(), %key, "evicted oldest image");
            }
        }
        Err(e) => tracing::warn!(generation = store.name(), error = %e, "failed to bound image cache"),
    }
    Ok(response)
}
