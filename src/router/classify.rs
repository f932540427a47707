//! URL classification rules
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. hostname contains a network-only substring -> [`Strategy::Bypass`]
//! 2. path under `/data/` naming a `.json` file -> [`Strategy::NetworkFirst`]
//! 3. path under `/img/` or with an image extension -> [`Strategy::StaleWhileRevalidate`]
//! 4. anything else -> [`Strategy::CacheFirst`]

use std::fmt;

use reqwest::Method;
use serde::Serialize;

use crate::request::Request;

/// File extensions served as images regardless of directory
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico"];

/// How a request is satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Never touch the caches
    Bypass,
    /// Live response preferred, stored copy on failure (data JSON)
    NetworkFirst,
    /// Stored copy served at once, refreshed in the background (images)
    StaleWhileRevalidate,
    /// Stored copy preferred, network on a miss (app shell)
    CacheFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Bypass => "bypass",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::CacheFirst => "cache-first",
        };
        f.write_str(name)
    }
}

/// Maps requests to strategies
#[derive(Debug, Clone)]
pub struct Classifier {
    network_only_hosts: Vec<String>,
}

impl Classifier {
    pub fn new(network_only_hosts: &[String]) -> Self {
        Self {
            network_only_hosts: network_only_hosts.to_vec(),
        }
    }

    /// Picks the strategy for a request
    ///
    /// Only GET requests can be stored, so anything else bypasses the
    /// caches entirely.
    pub fn classify(&self, request: &Request) -> Strategy {
        if *request.method() != Method::GET {
            return Strategy::Bypass;
        }

        let url = request.url();
        let host = url.host_str().unwrap_or_default();
        if self
            .network_only_hosts
            .iter()
            .any(|pattern| host.contains(pattern.as_str()))
        {
            return Strategy::Bypass;
        }

        let path = url.path();
        if path.starts_with("/data/") && path.contains(".json") {
            return Strategy::NetworkFirst;
        }
        if path.starts_with("/img/") || has_image_extension(path) {
            return Strategy::StaleWhileRevalidate;
        }
        Strategy::CacheFirst
    }
}

fn has_image_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
