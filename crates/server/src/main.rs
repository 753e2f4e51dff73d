//! synccache daemon entry point.
//!
//! Opens the cache store, spawns the sync worker and consumes the push
//! channel: a WebSocket when `SYNCCACHE_PUSH_URL` is set, newline-delimited
//! JSON on stdin otherwise. Logging goes to stderr so stdin/stdout stay free
//! for the push stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use synccache_client::{CacheManager, FetchClient, FetchConfig, HttpTransport, ManagerConfig};
use synccache_core::{AppConfig, CacheDb, CacheStore};
use synccache_server::{CacheClient, LineSource, SyncWorker, WebSocketSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    tracing::info!(db = %config.db_path.display(), cache = %config.cache_name, "starting synccache daemon");

    let foreground_db = open_db(&config).await?;
    let worker_db = open_db(&config).await?;
    let transport: Arc<dyn HttpTransport> = Arc::new(FetchClient::new(FetchConfig::from(&config))?);
    let manager = |db: CacheDb| {
        CacheManager::new(CacheStore::new(db, config.cache_name.clone()), transport.clone())
            .with_config(ManagerConfig::from(&config))
    };

    let (worker, output) = SyncWorker::spawn(manager(worker_db));
    let client = CacheClient::new(manager(foreground_db), worker, output).with_push_max_age(config.push_max_age());

    if let Some(interval) = config.refresh_interval() {
        client.request_background_refresh(Some(interval)).await?;
    }

    spawn_lifecycle_logger(&client);

    match config.push_url.as_deref() {
        Some(url) => {
            let source = WebSocketSource::connect(url).await?;
            client.run_push(source).await?;
        }
        None => {
            tracing::info!("no push URL configured, reading push messages from stdin");
            let source = LineSource::new(BufReader::new(tokio::io::stdin()));
            client.run_push(source).await?;
        }
    }

    tracing::info!("push channel closed, shutting down");
    Ok(())
}

/// Each context gets its own connection to the shared file.
async fn open_db(config: &AppConfig) -> Result<CacheDb> {
    CacheDb::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))
}

fn spawn_lifecycle_logger(client: &CacheClient) {
    let mut created = client.on_group_created();
    let mut updated = client.on_group_updated();
    let mut deleted = client.on_group_deleted();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(event) = created.recv() => tracing::info!(group = %event.group, "lifecycle: group created"),
                Ok(event) = updated.recv() => {
                    tracing::info!(group = %event.group, members = ?event.members, "lifecycle: group updated");
                }
                Ok(event) = deleted.recv() => {
                    tracing::info!(group = %event.group, members = ?event.members, "lifecycle: group deleted");
                }
                else => break,
            }
        }
    });
}
