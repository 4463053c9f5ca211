use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::channel::{RequestChannel, RequestDescriptor};
use crate::core::{IpcConfig, SegmentWriter};
use crate::errors::IpcError;
use crate::store::{Store, MAX_LOOKUP_DELAY_US};

pub const MAX_CACHE_THREADS: usize = 512;

/// Startup configuration for the cache process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedConfig {
    /// Map file naming the resources this cache can serve.
    pub store_map: String,
    pub worker_threads: usize,
    /// Artificial per-lookup delay in microseconds, for load testing.
    pub lookup_delay_us: u64,
    pub ipc: IpcConfig,
}

impl Default for CachedConfig {
    fn default() -> CachedConfig {
        CachedConfig {
            store_map: "locals.txt".to_string(),
            worker_threads: 10,
            lookup_delay_us: 0,
            ipc: IpcConfig::default(),
        }
    }
}

impl CachedConfig {
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.store_map.is_empty() {
            return Err(IpcError::Config("store_map must be set".to_string()));
        }
        if self.worker_threads < 1 || self.worker_threads > MAX_CACHE_THREADS {
            return Err(IpcError::Config(format!(
                "worker_threads must be in 1..={}",
                MAX_CACHE_THREADS
            )));
        }
        if self.lookup_delay_us > MAX_LOOKUP_DELAY_US {
            return Err(IpcError::Config(format!(
                "lookup_delay_us must be at most {}",
                MAX_LOOKUP_DELAY_US
            )));
        }
        self.ipc.validate()
    }
}

/// In-process descriptor queue between the channel reader and the workers.
/// Blocked workers observe shutdown on a timed wait, so the flag alone is
/// enough to wake the whole pool.
struct WorkQueue {
    queue: Mutex<VecDeque<RequestDescriptor>>,
    cond: Condvar,
}

impl WorkQueue {
    fn new() -> WorkQueue {
        WorkQueue {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, descriptor: RequestDescriptor) -> Result<(), IpcError> {
        let mut queue = self.queue.lock()?;
        queue.push_back(descriptor);
        self.cond.notify_one();
        Ok(())
    }

    /// `None` means shutdown: anything still queued is discarded, per the
    /// drain contract. The proxy side owns every segment either way.
    fn pop(&self, shutdown: &AtomicBool) -> Result<Option<RequestDescriptor>, IpcError> {
        let mut queue = self.queue.lock()?;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if let Some(descriptor) = queue.pop_front() {
                return Ok(Some(descriptor));
            }
            let (guard, _) = self.cond.wait_timeout(queue, Duration::from_millis(100))?;
            queue = guard;
        }
    }
}

/// Everything the cache side shares, built once in main.
pub struct CacheContext {
    pub store: Arc<dyn Store>,
    pub ipc: IpcConfig,
    pub shutdown: Arc<AtomicBool>,
}

/// Runs the cache process service loop: binds the request channel, fans
/// descriptors out to `worker_threads` producer threads, and drains on
/// shutdown. Returns once every worker has exited; dropping the channel
/// endpoint afterwards removes the channel name.
pub fn run(ctx: Arc<CacheContext>, worker_threads: usize) -> Result<(), IpcError> {
    let channel = RequestChannel::bind(&ctx.ipc)?;
    info!(
        "request channel bound ({} slots)",
        channel.capacity()
    );

    let queue = Arc::new(WorkQueue::new());
    let mut handles = Vec::with_capacity(worker_threads);
    for id in 0..worker_threads {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        handles.push(thread::spawn(move || worker_loop(id, &queue, &ctx)));
    }

    loop {
        match channel.recv(&ctx.shutdown) {
            Ok(descriptor) => queue.push(descriptor)?,
            Err(IpcError::Shutdown) => break,
            Err(e) => {
                // A corrupt descriptor poisons one request, not the reader.
                error!("request channel receive failed: {}", e);
            }
        }
    }

    info!("channel reader stopped, waiting for {} workers", handles.len());
    queue.cond.notify_all();
    for handle in handles {
        if handle.join().is_err() {
            error!("cache worker panicked");
        }
    }
    // Channel endpoint drops here; as the owner it unlinks the name.
    Ok(())
}

fn worker_loop(id: usize, queue: &WorkQueue, ctx: &CacheContext) {
    loop {
        let descriptor = match queue.pop(&ctx.shutdown) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                debug!("worker {} exiting on shutdown", id);
                return;
            }
            Err(e) => {
                error!("worker {}: queue broken: {}", id, e);
                return;
            }
        };
        // Any failure past this point abandons one request. The proxy's
        // handshake timeout keeps its handler from waiting forever.
        if let Err(e) = serve_request(&descriptor, ctx) {
            warn!(
                "worker {}: request for {} via {} abandoned: {}",
                id, descriptor.path, descriptor.segment_name, e
            );
        }
    }
}

/// The producer side of the handshake, one descriptor start to finish.
fn serve_request(descriptor: &RequestDescriptor, ctx: &CacheContext) -> Result<(), IpcError> {
    let mut writer = SegmentWriter::attach(
        &descriptor.segment_name,
        descriptor.segment_capacity as usize,
    )?;

    let entry = match ctx.store.resolve(&descriptor.path) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            debug!("{} not in store", descriptor.path);
            return writer.post_file_len(-1);
        }
        Err(e) => {
            warn!("resolving {} failed: {}", descriptor.path, e);
            return writer.post_file_len(-1);
        }
    };

    let file_len = entry.len();
    writer.post_file_len(file_len as i64)?;
    debug!(
        "serving {} ({} bytes) via {}",
        descriptor.path, file_len, descriptor.segment_name
    );

    let mut offset: u64 = 0;
    while offset < file_len {
        // The first pass consumes the permit the pool pre-seeded; every
        // later pass waits for the consumer to drain the previous chunk.
        writer.wait_write_permit(ctx.ipc.handshake_timeout())?;
        match entry.read_chunk(offset, writer.payload_mut()) {
            Ok(0) => {
                warn!("{} truncated at {} of {}", descriptor.path, offset, file_len);
                writer.commit_chunk(0)?;
                break;
            }
            Ok(n) => {
                writer.commit_chunk(n as i64)?;
                offset += n as u64;
            }
            Err(e) => {
                warn!("read error on {} at {}: {}", descriptor.path, offset, e);
                writer.commit_chunk(-1)?;
                break;
            }
        }
    }
    Ok(())
}
