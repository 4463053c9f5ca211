use clap::Parser;
use log::info;

use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use shmcache::proxy::{CacheHandler, ProxyConfig, ProxyContext};
use shmcache::server::FileServer;
use shmcache::shutdown::install_drain_handler;

#[derive(Parser)]
#[clap(name = "webproxy", about = "Front-end proxy for the shared-memory file cache")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "webproxy.toml")]
    config: String,
    #[clap(short = 'p', long = "listen-port")]
    listen_port: Option<u16>,
    #[clap(short = 'n', long = "segment-count")]
    segment_count: Option<usize>,
    #[clap(short = 'z', long = "segment-size")]
    segment_size: Option<usize>,
    #[clap(short = 't', long = "thread-count")]
    thread_count: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts: Opts = Opts::parse();
    let mut cfg: ProxyConfig = confy::load_path(&opts.config)?;
    if let Some(port) = opts.listen_port {
        cfg.listen_port = port;
    }
    if let Some(count) = opts.segment_count {
        cfg.segment_count = count;
    }
    if let Some(size) = opts.segment_size {
        cfg.segment_size = size;
    }
    if let Some(threads) = opts.thread_count {
        cfg.worker_threads = threads;
    }
    cfg.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctx = Arc::new(ProxyContext::new(&cfg, Arc::clone(&shutdown))?);

    {
        let ctx = Arc::clone(&ctx);
        install_drain_handler(Arc::clone(&shutdown), move || {
            let _ = ctx.pool.shutdown();
        })?;
    }

    let server = FileServer::new(cfg.listen_port, cfg.worker_threads, cfg.max_pending);
    server.serve(
        Arc::new(CacheHandler::new(Arc::clone(&ctx))),
        Arc::clone(&shutdown),
    )?;

    // Every in-flight handshake has bounded waits, so this terminates even
    // if the cache process is gone.
    let segments = ctx.pool.drain_all()?;
    info!("drained {} segments, removing shared mappings", segments.len());
    drop(segments);
    Ok(())
}
