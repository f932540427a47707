//! Worker configuration with layered loading
//!
//! Uses figment to merge, lowest precedence first:
//!
//! 1. Built-in defaults (the shipped site's manifest, denylist and tags)
//! 2. A TOML file (`--config` or `MUTAPA_WORKER_CONFIG`)
//! 3. Environment variables prefixed with `MUTAPA_WORKER_`
//!
//! Nested keys use a double underscore, e.g. `MUTAPA_WORKER_PUSH__TAG`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "MUTAPA_WORKER_CONFIG";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider could not be read or a value had the wrong type
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    /// A value loaded fine but is not usable
    #[error("invalid configuration for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// A manifest or fallback path cannot be resolved against the origin
    #[error("cannot resolve '{path}' against the site origin: {source}")]
    Resolve {
        path: String,
        #[source]
        source: url::ParseError,
    },
}

/// Settings for notifications raised from push messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    /// Title used when a payload carries none
    pub default_title: String,
    pub icon: String,
    pub badge: String,
    /// Shared tag so a newer notification replaces an unread older one
    pub tag: String,
    /// Page opened on click when a payload carries no URL
    pub default_url: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            default_title: "The Mutapa Times".to_string(),
            icon: "/img/android-icon-192x192.png".to_string(),
            badge: "/img/favicon-96x96.png".to_string(),
            tag: "mutapa-news".to_string(),
            default_url: "/".to_string(),
        }
    }
}

/// Immutable configuration for one worker version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Site the worker is installed for
    pub origin: Url,

    /// Shell generation tag; bump on every deploy that changes shipped files
    pub version: String,

    /// Generation for JSON data responses (stable across deploys)
    pub data_cache: String,

    /// Generation for images (stable across deploys)
    pub image_cache: String,

    /// Maximum number of entries kept in the image generation
    pub image_cache_limit: usize,

    /// Page served to navigations when both cache and network fail
    pub offline_page: String,

    /// Root-relative paths pre-cached at install
    pub app_shell: Vec<String>,

    /// Hostname substrings that are never cached
    pub network_only_hosts: Vec<String>,

    /// Activate straight after install instead of waiting for pages to close
    pub skip_waiting: bool,

    /// HTTP request timeout in milliseconds
    pub timeout_ms: u64,

    /// User-Agent string for HTTP requests
    pub user_agent: String,

    /// Cache root; defaults to the platform cache directory
    pub cache_dir: Option<PathBuf>,

    pub push: PushConfig,
}

/// App shell of the shipped site
const APP_SHELL: &[&str] = &[
    "/",
    "/index.html",
    "/article.html",
    "/articles.html",
    "/economy.html",
    "/people.html",
    "/person.html",
    "/businesses.html",
    "/business.html",
    "/who.html",
    "/what.html",
    "/why.html",
    "/how.html",
    "/terms.html",
    "/offline.html",
    "/css/normalize.css",
    "/css/main.css",
    "/js/vendor/modernizr-3.8.0.min.js",
    "/js/plugins.js",
    "/js/config.js",
    "/js/main.js",
    "/js/gate.js",
    "/js/articles.js",
    "/js/person.js",
    "/js/business.js",
    "/js/businesses.js",
    "/js/people.js",
    "/site.webmanifest",
    "/img/android-icon-192x192.png",
    "/img/favicon-32x32.png",
    "/img/favicon-96x96.png",
];

/// Analytics, third-party APIs and embeds that must always hit the network
const NETWORK_ONLY_HOSTS: &[&str] = &[
    "googletagmanager.com",
    "google-analytics.com",
    "contentsquare.net",
    "api.rss2json.com",
    "api.open-meteo.com",
    "s3.tradingview.com",
    "query.wikidata.org",
    "translate.google.com",
];

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("https://www.mutapatimes.com/").expect("static origin is valid"),
            version: "mutapa-v3".to_string(),
            data_cache: "mutapa-data-v1".to_string(),
            image_cache: "mutapa-img-v1".to_string(),
            image_cache_limit: 100,
            offline_page: "/offline.html".to_string(),
            app_shell: APP_SHELL.iter().map(|s| s.to_string()).collect(),
            network_only_hosts: NETWORK_ONLY_HOSTS.iter().map(|s| s.to_string()).collect(),
            skip_waiting: true,
            timeout_ms: 20_000,
            user_agent: concat!("mutapa-worker/", env!("CARGO_PKG_VERSION")).to_string(),
            cache_dir: None,
            push: PushConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from all sources with layered precedence
    ///
    /// `file` takes priority over `MUTAPA_WORKER_CONFIG` when both are given.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a source cannot be read or parsed, or if the
    /// merged configuration fails validation.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(
            Env::prefixed("MUTAPA_WORKER_")
                .ignore(&["config"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        Self::from_figment(figment)
    }

    /// Extracts and validates a configuration from an assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Timeout as Duration for use with reqwest
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolves a root-relative path against the site origin
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.origin.join(path).map_err(|source| ConfigError::Resolve {
            path: path.to_string(),
            source,
        })
    }

    /// Absolute URL of the offline fallback page
    pub fn offline_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.offline_page)
    }

    /// Absolute URLs of every app-shell entry, in manifest order
    pub fn app_shell_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.app_shell.iter().map(|p| self.resolve(p)).collect()
    }

    /// Generations that survive activation of this version
    pub fn keep_set(&self) -> [&str; 3] {
        [
            self.version.as_str(),
            self.data_cache.as_str(),
            self.image_cache.as_str(),
        ]
    }

    /// Checks the values that would otherwise fail at install or fetch time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(invalid("origin", "must be an http or https URL"));
        }

        let tags = [
            ("version", &self.version),
            ("data_cache", &self.data_cache),
            ("image_cache", &self.image_cache),
        ];
        for (field, tag) in tags {
            if tag.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
            if tag.starts_with('.') || tag.contains(['/', '\\']) {
                return Err(invalid(field, "must be usable as a directory name"));
            }
        }
        if self.version == self.data_cache
            || self.version == self.image_cache
            || self.data_cache == self.image_cache
        {
            return Err(invalid("version", "generation tags must be distinct"));
        }

        if self.image_cache_limit == 0 {
            return Err(invalid("image_cache_limit", "must be at least 1"));
        }
        if self.app_shell.is_empty() {
            return Err(invalid("app_shell", "must list at least one path"));
        }
        if !self.app_shell.contains(&self.offline_page) {
            return Err(invalid(
                "offline_page",
                "must be part of the app shell so it is cached at install",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be greater than zero"));
        }
        // An empty entry is a substring of every host
        if self.network_only_hosts.iter().any(|host| host.trim().is_empty()) {
            return Err(invalid("network_only_hosts", "entries must not be empty"));
        }

        self.offline_url()?;
        self.app_shell_urls()?;
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
