//! Mutapa Times worker - drives the offline worker one event at a time
//!
//! State (cache generations and the registration record) lives in the cache
//! directory, so consecutive invocations behave like one long-lived worker.
//! Logging goes to stderr; results are printed on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mutapa_worker::cache::CacheStorage;
use mutapa_worker::cli::{self, Cli, Command};
use mutapa_worker::clients::{ClientList, NotificationCenter};
use mutapa_worker::config::WorkerConfig;
use mutapa_worker::fetch::{Fetcher, HttpFetcher, OfflineFetcher};
use mutapa_worker::lifecycle::Registration;
use mutapa_worker::push::PushSink;
use mutapa_worker::request::Response;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mutapa_worker=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cache directory from the flag, then the config file, then the platform default
fn open_storage(cli: &Cli, config: &WorkerConfig) -> Result<CacheStorage> {
    if let Some(dir) = cli.cache_dir.clone().or_else(|| config.cache_dir.clone()) {
        return Ok(CacheStorage::with_dir(dir));
    }
    CacheStorage::new().context("could not determine a cache directory; pass --cache-dir")
}

fn print_response(response: &Response, how: &str) {
    println!(
        "{} {} [{}] {} bytes, {}",
        response.status,
        response.status_text,
        how,
        response.body.len(),
        response.header("content-type").unwrap_or("no content type")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = Arc::new(WorkerConfig::load(cli.config.as_deref())?);
    let storage = open_storage(&cli, &config)?;
    let fetcher: Arc<dyn Fetcher> = if cli.offline {
        Arc::new(OfflineFetcher)
    } else {
        Arc::new(HttpFetcher::new(&config.user_agent, config.timeout())?)
    };
    let clients = ClientList::new();

    tracing::debug!(root = %storage.root().display(), version = %config.version, "worker starting");

    match cli.command {
        Command::Install => {
            let mut registration =
                Registration::open(storage, Arc::clone(&fetcher), clients).await?;
            let worker = registration
                .update(Arc::clone(&config))
                .await
                .with_context(|| format!("installing {}", config.version))?;
            println!("{} {}", worker.version(), worker.state());
        }

        Command::Activate => {
            let mut registration =
                Registration::open(storage, Arc::clone(&fetcher), clients).await?;
            let (worker, report) = registration.activate_waiting(Arc::clone(&config)).await?;
            println!("{} {}", worker.version(), worker.state());
            for name in report.deleted {
                println!("deleted {}", name);
            }
        }

        Command::Fetch {
            url,
            navigate,
            output,
        } => {
            let target = cli::parse_target(&url, &config)?;
            let request = cli::request_for(target, navigate, &config);

            let registration =
                Registration::open(storage, Arc::clone(&fetcher), clients).await?;
            let response = match registration.router(Arc::clone(&config))? {
                Some(router) => {
                    let served = router.fetch(&request).await;
                    router.settle().await;
                    let served = served?;
                    print_response(
                        &served.response,
                        &format!("{}, {}", served.strategy, served.source),
                    );
                    served.response
                }
                None => {
                    tracing::warn!("no active worker; going straight to the network");
                    let response = fetcher.fetch(&request).await?;
                    print_response(&response, "no worker");
                    response
                }
            };

            if let Some(path) = output {
                tokio::fs::write(&path, &response.body)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }

        Command::Generations => {
            for name in storage.keys().await? {
                let entries = match storage.lookup(&name).await? {
                    Some(store) => store.len().await,
                    None => 0,
                };
                println!("{}\t{}", name, entries);
            }
        }

        Command::Push {
            payload,
            click,
            clients: open_pages,
        } => {
            for url in open_pages {
                clients.add(url).await;
            }
            let sink = PushSink::new(Arc::clone(&config), NotificationCenter::new(), clients);
            let notification = sink.on_push(Some(payload.as_bytes())).await;
            println!("{}", serde_json::to_string_pretty(&notification)?);
            if click {
                let outcome = sink.on_notification_click(&notification).await;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }

        Command::Status => {
            let registration = Registration::open(storage, fetcher, clients).await?;
            println!("{}", serde_json::to_string_pretty(registration.record())?);
        }
    }

    Ok(())
}
