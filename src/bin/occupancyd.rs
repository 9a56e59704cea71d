use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use occupancy_monitor::api::{ApiConfig, ApiServer};
use occupancy_monitor::config::MonitorConfig;
use occupancy_monitor::{
    load_classifier, CancelSignal, DirectoryScreenshotSink, InMemoryOccupancyStore, LogEventSink,
    OccupancyMirror, SourceRouter, SqliteMirror, StreamSupervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Seat occupancy monitor daemon")]
struct Args {
    /// Config file (.toml, otherwise JSON).
    #[arg(long, env = "OCCUPANCY_CONFIG")]
    config: Option<PathBuf>,

    /// API listen address (overrides config).
    #[arg(long)]
    addr: Option<String>,

    /// Seconds between captures per stream (overrides config).
    #[arg(long)]
    interval_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = MonitorConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.api_addr = addr;
    }
    if let Some(secs) = args.interval_secs {
        if secs == 0 {
            return Err(anyhow!("--interval-secs must be greater than zero"));
        }
        cfg.interval = Duration::from_secs(secs);
    }

    let store = Arc::new(InMemoryOccupancyStore::with_ttl(cfg.occupancy_ttl));
    let classifier = load_classifier(&cfg.classifier)?;
    let mut builder = StreamSupervisor::builder(
        store.clone(),
        Arc::new(SourceRouter::new(cfg.timeouts)),
        classifier,
    )
    .events(Arc::new(LogEventSink))
    .interval(cfg.interval)
    .default_regions(cfg.default_regions.clone());

    if let Some(dir) = &cfg.screenshots_dir {
        match DirectoryScreenshotSink::new(dir) {
            Ok(sink) => {
                log::info!("screenshots will be saved to {}", dir.display());
                builder = builder.screenshots(Arc::new(sink));
            }
            Err(err) => log::warn!("screenshots disabled: {:#}", err),
        }
    }

    let mut persisted = Vec::new();
    if let Some(db_path) = &cfg.db_path {
        match SqliteMirror::open(db_path) {
            Ok(mirror) => {
                persisted = mirror.load_streams().unwrap_or_else(|err| {
                    log::warn!("mirror: could not load persisted streams: {:#}", err);
                    Vec::new()
                });
                log::info!("mirroring occupancy to {}", db_path);
                builder = builder.mirror(Arc::new(mirror));
            }
            Err(err) => log::warn!("persistence disabled, cannot open {}: {:#}", db_path, err),
        }
    }

    let supervisor = Arc::new(builder.build());

    for stream in persisted {
        let id = stream.id.clone();
        if let Err(err) = supervisor.restore_stream(stream) {
            log::warn!("stream {} not restored: {:#}", id, err);
        }
    }
    for request in cfg.streams.clone() {
        let url = request.url.clone();
        if let Err(err) = supervisor.ensure_stream(request) {
            log::warn!("configured stream {} not started: {:#}", url, err);
        }
    }

    let purge_stop = Arc::new(CancelSignal::new());
    let purge_thread = cfg.occupancy_ttl.map(|ttl| {
        let store = store.clone();
        let stop = purge_stop.clone();
        let every = ttl.min(cfg.interval);
        std::thread::spawn(move || {
            while !stop.wait_timeout(every) {
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => log::info!("dropped {} stale occupancy entries", n),
                    Err(err) => log::warn!("occupancy purge failed: {:#}", err),
                }
            }
        })
    });

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        supervisor.clone(),
    )
    .spawn()?;

    log::info!(
        "occupancyd running: api={} interval={}s classifier={} streams={}",
        api_handle.addr,
        cfg.interval.as_secs(),
        supervisor.classifier_name(),
        supervisor.active_count()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("occupancyd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    purge_stop.cancel();
    if let Some(handle) = purge_thread {
        let _ = handle.join();
    }
    supervisor.shutdown();
    Ok(())
}
