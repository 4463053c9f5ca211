use clap::Parser;
use log::info;

use std::error::Error;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use shmcache::cache::{self, CacheContext, CachedConfig};
use shmcache::shutdown::install_drain_handler;
use shmcache::store::FileStore;

#[derive(Parser)]
#[clap(name = "shmcached", about = "Cache process for the shared-memory file cache")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmcached.toml")]
    config: String,
    #[clap(short = 'm', long = "store-map")]
    store_map: Option<String>,
    #[clap(short = 't', long = "thread-count")]
    thread_count: Option<usize>,
    #[clap(short = 'd', long = "delay")]
    lookup_delay_us: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts: Opts = Opts::parse();
    let mut cfg: CachedConfig = confy::load_path(&opts.config)?;
    if let Some(map) = opts.store_map {
        cfg.store_map = map;
    }
    if let Some(threads) = opts.thread_count {
        cfg.worker_threads = threads;
    }
    if let Some(delay) = opts.lookup_delay_us {
        cfg.lookup_delay_us = delay;
    }
    cfg.validate()?;

    let store = Arc::new(FileStore::load(
        Path::new(&cfg.store_map),
        cfg.lookup_delay_us,
    )?);
    info!("store map {} holds {} entries", cfg.store_map, store.len());

    let shutdown = Arc::new(AtomicBool::new(false));
    install_drain_handler(Arc::clone(&shutdown), || {})?;

    let ctx = Arc::new(CacheContext {
        store,
        ipc: cfg.ipc.clone(),
        shutdown,
    });
    cache::run(ctx, cfg.worker_threads)?;
    info!("cache drained, channel removed");
    Ok(())
}
