use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use shmcache::cache::{self, CacheContext};
use shmcache::core::IpcConfig;
use shmcache::pool::SegmentPool;
use shmcache::proxy::{CacheHandler, ProxyContext};
use shmcache::server::{ClientContext, Status, Worker};
use shmcache::store::FileStore;
use shmcache::IpcError;

#[derive(Parser)]
#[clap(name = "handshake_bench")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "handshake-bench.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BenchConfig {
    requests: usize,
    file_size: usize,
    segment_size: usize,
    ipc: IpcConfig,
}

impl Default for BenchConfig {
    fn default() -> BenchConfig {
        BenchConfig {
            requests: 10_000,
            file_size: 5_000,
            segment_size: 1_000,
            ipc: IpcConfig::default(),
        }
    }
}

/// Counts bytes and drops them; the bench measures handshake round trips,
/// not socket throughput.
struct DiscardClient {
    bytes: usize,
}

impl ClientContext for DiscardClient {
    fn send_header(&mut self, _status: Status, _length: u64) -> Result<(), IpcError> {
        Ok(())
    }

    fn send_body(&mut self, bytes: &[u8]) -> Result<usize, IpcError> {
        self.bytes += bytes.len();
        Ok(bytes.len())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let mut cfg: BenchConfig = confy::load_path(&opts.config)?;
    // Keep bench runs isolated from any live deployment.
    cfg.ipc.name_prefix = format!("bench-{}", std::process::id());
    cfg.ipc.channel_name = format!("bench-chan-{}", std::process::id());
    println!("{:?}", &cfg);

    let dir = tempfile::tempdir()?;
    let data_path = dir.path().join("payload");
    File::create(&data_path)?.write_all(&vec![0xa5u8; cfg.file_size])?;
    let map_path = dir.path().join("locals.txt");
    File::create(&map_path)?.write_all(format!("/payload {}\n", data_path.display()).as_bytes())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let cache_ctx = Arc::new(CacheContext {
        store: Arc::new(FileStore::load(&map_path, 0)?),
        ipc: cfg.ipc.clone(),
        shutdown: Arc::clone(&shutdown),
    });
    let cache_thread = {
        let cache_ctx = Arc::clone(&cache_ctx);
        thread::spawn(move || cache::run(cache_ctx, 1))
    };

    let proxy_ctx = Arc::new(ProxyContext {
        pool: SegmentPool::new(&cfg.ipc.name_prefix, 1, cfg.segment_size)?,
        ipc: cfg.ipc.clone(),
        shutdown: Arc::new(AtomicBool::new(false)),
    });
    let handler = CacheHandler::new(proxy_ctx);

    let start = Instant::now();
    let mut total_bytes = 0usize;
    for x in 0..cfg.requests {
        let mut client = DiscardClient { bytes: 0 };
        let sent = handler.handle("/payload", &mut client)?;
        total_bytes += sent;
        if x % 1000 == 0 {
            println!("{}", x);
        }
    }
    let duration = start.elapsed();

    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    cache_thread.join().expect("cache thread panicked")?;

    let iops = ((cfg.requests as f64) / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "IOPS : {:#?}K, bytes: {}, time: {:#?}",
        (iops / 1000f64) as u64,
        total_bytes,
        duration
    );
    Ok(())
}
