//! needlestore-node: entry point for a needlestore server.
//!
//! Loads config, opens the store (recovering volumes and metadata from
//! the catalog), spawns the periodic sync and compaction tasks, then
//! serves the HTTP API on the configured listen address.

use needlestore_api::ApiContext;
use needlestore_storage::catalog::CatalogOptions;
use needlestore_storage::{
    spawn_compaction_task, spawn_sync_task, ChunkManager, CompactorConfig, Store, StoreConfig,
};
use std::sync::Arc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    needlestore_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = needlestore_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            needlestore_config::NodeConfig::default()
        });

    let catalog_options = match config.catalog.engine {
        needlestore_config::CatalogEngine::Sqlite => CatalogOptions::Sqlite {
            path: config.catalog.path.clone(),
        },
        needlestore_config::CatalogEngine::Memory => CatalogOptions::Memory,
    };

    // Open the store; recovery happens here.
    let store = Arc::new(Store::open(StoreConfig {
        data_dir: config.storage.data_dir.clone(),
        max_volume_size: config.storage.max_volume_size,
        read_only: config.storage.read_only,
        catalog: catalog_options,
    })?);

    let chunks = Arc::new(ChunkManager::new(config.storage.data_dir.join("chunks"))?);

    // Spawn periodic volume sync task
    spawn_sync_task(
        store.clone(),
        Duration::from_secs(config.storage.sync_interval_secs),
    );

    // Spawn compaction task
    spawn_compaction_task(
        store.clone(),
        CompactorConfig {
            enabled: config.compaction.enabled,
            interval: Duration::from_secs(config.compaction.interval_secs),
            deleted_threshold: config.compaction.deleted_threshold,
            min_volume_size: config.compaction.min_volume_size,
        },
    );

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{}", metrics_port)
            .parse()
            .expect("valid metrics address");
        tokio::spawn(async move {
            if let Err(e) = needlestore_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let ctx = Arc::new(ApiContext {
        store: store.clone(),
        chunks,
    });

    // Serve with graceful shutdown on Ctrl+C
    tracing::info!("serving HTTP API on {}", config.listen);
    tokio::select! {
        result = needlestore_api::serve(config.listen, ctx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    store.close()?;
    Ok(())
}
