//! Request and response snapshots seen by the worker
//!
//! Every fetch a page issues reaches the worker as a [`Request`]; whatever the
//! worker hands back is a [`Response`], whether it came from the network, a
//! cache generation, or the offline fallback.

use std::fmt;

use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the page issued the request
///
/// Only the distinction between a top-level navigation and everything else
/// matters to the router; the other modes are kept so requests read like
/// the ones a browser produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// A request for a full page document
    Navigate,
    /// A same-origin sub-resource (script, stylesheet, JSON)
    SameOrigin,
    /// A cross-origin request made with CORS
    Cors,
}

/// A request intercepted at the network boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    url: Url,
    mode: RequestMode,
}

impl Request {
    /// Creates a GET request for a sub-resource
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::SameOrigin,
        }
    }

    /// Creates a GET request for a top-level page
    pub fn navigate(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Navigate,
        }
    }

    /// Replaces the request method
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Replaces the request mode
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    /// Whether this request loads a full page rather than a sub-resource
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// The key this request is stored under in a cache generation
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

/// Normalized identity of a request inside a cache generation
///
/// Formed from the method and the absolute URL with any fragment removed,
/// so `/article.html#comments` and `/article.html` share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.as_str(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A response snapshot: status line, headers and the full body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    /// Creates a response with the given status and body and no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Creates a `200 OK` response
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status_text: "OK".to_string(),
            ..Self::new(200, body)
        }
    }

    /// Appends a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the status is in the 2xx range; only these are ever cached
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
