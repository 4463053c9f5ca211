use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::channel::{RequestChannel, RequestDescriptor};
use crate::core::{IpcConfig, Segment, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use crate::errors::IpcError;
use crate::pool::SegmentPool;
use crate::server::{ClientContext, Status, Worker};

pub const MAX_PROXY_THREADS: usize = 418;

/// Startup configuration for the proxy process. Invalid values are fatal
/// at startup; nothing is clamped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub worker_threads: usize,
    pub segment_count: usize,
    /// Payload bytes per segment; the mapping adds a fixed overhead.
    pub segment_size: usize,
    pub max_pending: usize,
    pub ipc: IpcConfig,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            listen_port: 25464,
            worker_threads: 30,
            segment_count: 8,
            segment_size: 5712,
            max_pending: 187,
            ipc: IpcConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.listen_port == 0 {
            return Err(IpcError::Config("listen_port must be nonzero".to_string()));
        }
        if self.worker_threads < 1 || self.worker_threads > MAX_PROXY_THREADS {
            return Err(IpcError::Config(format!(
                "worker_threads must be in 1..={}",
                MAX_PROXY_THREADS
            )));
        }
        if self.segment_count < 1 {
            return Err(IpcError::Config(
                "segment_count must be positive".to_string(),
            ));
        }
        if self.segment_size < MIN_SEGMENT_SIZE || self.segment_size > MAX_SEGMENT_SIZE {
            return Err(IpcError::Config(format!(
                "segment_size must be in {}..={}",
                MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if self.max_pending < 1 {
            return Err(IpcError::Config("max_pending must be positive".to_string()));
        }
        self.ipc.validate()
    }
}

/// Everything the proxy side shares across handler threads, built once in
/// main and passed by reference from there on.
pub struct ProxyContext {
    pub pool: SegmentPool,
    pub ipc: IpcConfig,
    pub shutdown: Arc<AtomicBool>,
}

impl ProxyContext {
    pub fn new(cfg: &ProxyConfig, shutdown: Arc<AtomicBool>) -> Result<ProxyContext, IpcError> {
        let pool = SegmentPool::new(&cfg.ipc.name_prefix, cfg.segment_count, cfg.segment_size)?;
        info!(
            "created {} segments of {} payload bytes",
            cfg.segment_count, cfg.segment_size
        );
        Ok(ProxyContext {
            pool,
            ipc: cfg.ipc.clone(),
            shutdown,
        })
    }
}

/// How long a handler sleeps between attempts to reach the request
/// channel. The retry itself is unbounded; only shutdown stops it.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The per-request worker on the proxy side: checks a segment out, asks
/// the cache process to fill it, and streams it to the client one chunk
/// at a time.
pub struct CacheHandler {
    ctx: Arc<ProxyContext>,
}

impl CacheHandler {
    pub fn new(ctx: Arc<ProxyContext>) -> CacheHandler {
        CacheHandler { ctx }
    }

    /// Opens the request channel, retrying for as long as it takes. The
    /// cache process may be restarting; treating absence as transient is
    /// what lets the two processes restart independently.
    fn connect_channel(&self) -> Result<RequestChannel, IpcError> {
        loop {
            if self.ctx.shutdown.load(Ordering::Relaxed) {
                return Err(IpcError::Shutdown);
            }
            match RequestChannel::connect(&self.ctx.ipc) {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    debug!("request channel not reachable yet: {}", e);
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
    }

    fn stream_from_cache(
        &self,
        segment: &Segment,
        path: &str,
        ctx: &mut dyn ClientContext,
    ) -> Result<usize, IpcError> {
        let channel = match self.connect_channel() {
            Ok(channel) => channel,
            Err(IpcError::Shutdown) => return Ok(0),
            Err(e) => return Err(e),
        };
        let descriptor = RequestDescriptor {
            path: path.to_string(),
            segment_name: segment.name().to_string(),
            segment_capacity: segment.capacity() as u64,
        };
        match channel.send(&descriptor, &self.ctx.shutdown) {
            Ok(()) => {}
            Err(IpcError::Shutdown) => return Ok(0),
            Err(e) => return Err(e),
        }

        let file_len = segment.await_file_len(self.ctx.ipc.handshake_timeout())?;
        if file_len < 0 {
            ctx.send_header(Status::NotFound, 0)?;
            return Ok(0);
        }
        ctx.send_header(Status::Ok, file_len as u64)?;

        let mut sent: usize = 0;
        while (sent as i64) < file_len {
            let content_len = segment.await_chunk_len(self.ctx.ipc.handshake_timeout())?;
            if content_len <= 0 {
                // The producer hit a read error after the header committed
                // to a length. Nothing to do for the client but cut the
                // stream short.
                warn!(
                    "short stream for {}: {} of {} bytes, producer reported {}",
                    path, sent, file_len, content_len
                );
                break;
            }
            let chunk = segment.chunk(content_len as usize)?;
            let mut written = 0;
            while written < chunk.len() {
                let n = ctx.send_body(&chunk[written..])?;
                if n == 0 {
                    return Err(IpcError::Logic("client sink made no progress".to_string()));
                }
                written += n;
            }
            sent += chunk.len();
            segment.grant_write()?;
        }
        Ok(sent)
    }
}

impl Worker for CacheHandler {
    /// One client request, end to end. The segment goes back to the pool
    /// on every exit path; a zero-byte success with no header means the
    /// pool was already draining for shutdown.
    fn handle(&self, path: &str, ctx: &mut dyn ClientContext) -> Result<usize, IpcError> {
        let segment = match self.ctx.pool.acquire() {
            Ok(segment) => segment,
            Err(IpcError::Shutdown) => return Ok(0),
            Err(e) => return Err(e),
        };
        let outcome = self.stream_from_cache(&segment, path, ctx);
        self.ctx.pool.release(segment)?;
        outcome
    }
}
