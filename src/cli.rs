//! Command-line interface parsing for the Mutapa Times worker
//!
//! Each subcommand delivers one event to the worker (install, activate, a
//! fetch, a push) against the state persisted in the cache directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;
use url::Url;

use crate::config::WorkerConfig;
use crate::request::{Request, RequestMode};

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The fetch target is neither an absolute URL nor a site path
    #[error("Invalid URL: '{0}'. Use an absolute URL or a path starting with '/'")]
    InvalidUrl(String),
}

/// Mutapa Times offline worker
#[derive(Parser, Debug)]
#[command(name = "mutapa-worker")]
#[command(about = "Offline caching and push delivery for The Mutapa Times")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file (also read from MUTAPA_WORKER_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cache directory holding generations and the registration record
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Never reach the network; exercises the offline fallbacks
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Install the configured version, activating it unless skip_waiting is off
    Install,

    /// Activate the installed version that is waiting
    Activate,

    /// Route one request through the active worker
    ///
    /// Examples:
    ///   mutapa-worker fetch /data/weather.json
    ///   mutapa-worker fetch /article.html --navigate
    ///   mutapa-worker fetch https://www.mutapatimes.com/img/banner.png -o banner.png
    Fetch {
        /// Absolute URL or a path on the site
        url: String,

        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,

        /// Write the response body to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List cache generations and their entry counts
    Generations,

    /// Deliver a push payload and print the resulting notification
    Push {
        /// Payload text, normally JSON
        payload: String,

        /// Click the notification after showing it
        #[arg(long)]
        click: bool,

        /// URL of a page that is already open (repeatable)
        #[arg(long = "client", value_name = "URL")]
        clients: Vec<String>,
    },

    /// Print the registration record
    Status,
}

/// Resolves a fetch target against the site origin
///
/// # Arguments
/// * `input` - Absolute URL or a path starting with `/`
/// * `config` - Supplies the origin for paths
///
/// # Returns
/// * `Ok(Url)` with any fragment kept; cache keys strip it later
/// * `Err(CliError::InvalidUrl)` for anything else
pub fn parse_target(input: &str, config: &WorkerConfig) -> Result<Url, CliError> {
    if input.starts_with('/') {
        return config
            .resolve(input)
            .map_err(|_| CliError::InvalidUrl(input.to_string()));
    }
    match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(CliError::InvalidUrl(input.to_string())),
    }
}

/// Builds the request a page would issue for `url`
///
/// Navigations load a page; anything else is a same-origin sub-resource
/// unless it points away from the site origin.
pub fn request_for(url: Url, navigate: bool, config: &WorkerConfig) -> Request {
    if navigate {
        return Request::navigate(url);
    }
    let mode = if url.origin() == config.origin.origin() {
        RequestMode::SameOrigin
    } else {
        RequestMode::Cors
    };
    Request::get(url).with_mode(mode)
}
