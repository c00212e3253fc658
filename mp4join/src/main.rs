use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mp4join::api::server::{ApiServer, ApiServerConfig, AppState};
use mp4join::config::ServerConfig;
use mp4join::dispatch::{ConcatRunner, Dispatcher, DispatcherConfig};
use mp4join::job::{JobRegistry, RegistryLimits};
use mp4join::storage::PartStore;
use mp4join::stream::{OutputStreamer, StreamConfig};
use mp4join::sweep::{CacheSweeper, SweepConfig};
use mp4join::{logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").ok();
    let _log_guard = logging::init_logging(log_dir.as_deref())?;
    panic_hook::install(log_dir.as_deref());

    let config = ServerConfig::from_env_or_default();
    info!(
        input_dir = %config.input_dir.display(),
        output_dir = %config.output_dir.display(),
        "mp4join starting"
    );

    // Both directories are cleared on startup; jobs do not survive restarts.
    let store = Arc::new(PartStore::new(&config.input_dir, &config.output_dir));
    store.prepare().await?;

    let registry = Arc::new(JobRegistry::new(RegistryLimits {
        max_jobs_per_address: config.max_jobs_per_address,
        max_part_size: config.max_part_size,
    }));
    let streamer = Arc::new(OutputStreamer::new(StreamConfig {
        max_streams: config.max_streams,
        chunk_size: config.stream_chunk_size,
        delete_after_send: config.delete_after_send,
    }));

    let shutdown = CancellationToken::new();

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        store.clone(),
        Arc::new(ConcatRunner::new()),
        DispatcherConfig {
            max_concurrency: config.max_concurrency,
            tick_interval: config.dispatch_interval,
        },
        shutdown.child_token(),
    ));
    dispatcher.start();

    let sweeper = CacheSweeper::new(
        SweepConfig::new()
            .with_retention(config.cache_retention)
            .with_interval(config.sweep_interval),
        registry.clone(),
        store.clone(),
    );
    sweeper.start_background_task(shutdown.child_token());

    let state = AppState::new(registry, store.clone(), streamer.clone());
    let server = ApiServer::new(ApiServerConfig::from(&config), state);

    let server_cancel = server.cancel_token();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {err}");
            return;
        }
        info!("shutdown signal received");
        shutdown_trigger.cancel();
        server_cancel.cancel();
    });

    server.run().await?;

    // The server has drained; stop the background work before exiting.
    shutdown.cancel();
    dispatcher.stop().await;
    streamer.close_all();
    if let Err(err) = store.clear_outputs().await {
        error!("failed to clear outputs at shutdown: {err}");
    }
    info!("mp4join stopped");

    Ok(())
}
