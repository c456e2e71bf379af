pub mod cache;
pub mod codec;
pub mod collection;
pub mod discovery;
pub mod engine;
pub mod feed;
pub mod metrics;
pub mod models;
pub mod resolve;
pub mod settings;
mod utils;

use anyhow::Result;

use cache::CacheStore;
use engine::Engine;
use settings::SettingsStore;

pub use engine::{EngineBuilder, FeedEvent, Subscription};
pub use settings::EngineSettings;

const ENABLE_LOGS: bool = true;

/// Runs one scan from the command line: network discovery only, until
/// the reveal windows pass or ctrl-c.
pub fn run() {
    let level = if settings::debug_enabled() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    log::info!("nearcast starting up...");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(scan_once()) {
        crate::log_error!("Scan failed: {err:#}");
        std::process::exit(1);
    }
}

async fn scan_once() -> Result<()> {
    let data_dir = settings::data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?.effective();
    crate::log_info!("Resolving against {}", settings.endpoint().resolve_url());

    let mut builder = Engine::builder(settings).network_discoverers();
    match CacheStore::open(data_dir.join("cache.sqlite3")) {
        Ok(store) => builder = builder.cache(store),
        Err(err) => crate::log_warn!("Running without a cache: {err:#}"),
    }
    let engine = builder.build()?;
    engine.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => crate::log_info!("Interrupted"),
        _ = engine.idle() => {}
    }

    for (position, record) in engine.ranked_list().await.iter().enumerate() {
        crate::log_info!(
            "{:>2}. {} <{}>",
            position + 1,
            record.title().unwrap_or("(untitled)"),
            record.url()
        );
    }
    let metrics = engine.metrics();
    crate::log_info!("{} sightings this scan", metrics.sighting_count());

    engine.shutdown().await;
    Ok(())
}
