use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::errors::IpcError;

/// Client-visible outcomes. Everything a handler can go wrong on is
/// collapsed to one of these before it reaches the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Error,
}

impl Status {
    fn token(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOTFOUND",
            Status::Error => "ERROR",
        }
    }
}

/// Per-request send capability handed to the worker. The header goes out
/// exactly once, then any number of body writes.
pub trait ClientContext {
    fn send_header(&mut self, status: Status, length: u64) -> Result<(), IpcError>;
    fn send_body(&mut self, bytes: &[u8]) -> Result<usize, IpcError>;
}

/// The per-request callback, injected into the server at startup.
pub trait Worker: Send + Sync {
    fn handle(&self, path: &str, ctx: &mut dyn ClientContext) -> Result<usize, IpcError>;
}

struct TcpClientContext {
    stream: TcpStream,
    header_sent: bool,
}

impl ClientContext for TcpClientContext {
    fn send_header(&mut self, status: Status, length: u64) -> Result<(), IpcError> {
        if self.header_sent {
            return Err(IpcError::Logic("header already sent".to_string()));
        }
        self.header_sent = true;
        self.stream
            .write_all(format!("{} {}\r\n", status.token(), length).as_bytes())?;
        Ok(())
    }

    fn send_body(&mut self, bytes: &[u8]) -> Result<usize, IpcError> {
        if !self.header_sent {
            return Err(IpcError::Logic("body before header".to_string()));
        }
        let n = self.stream.write(bytes)?;
        Ok(n)
    }
}

/// How long the accept loop sleeps between polls of the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Clients that connect and then go silent are cut loose after this long.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingQueue {
    queue: Mutex<VecDeque<TcpStream>>,
    cond: Condvar,
    max_pending: usize,
}

impl PendingQueue {
    fn push(&self, stream: TcpStream) -> Result<(), IpcError> {
        let mut queue = self.queue.lock()?;
        if queue.len() >= self.max_pending {
            // Refusing beats queueing without bound; the client sees a
            // closed connection, same as the listener backlog overflowing.
            warn!("pending queue full ({}), refusing connection", self.max_pending);
            return Ok(());
        }
        queue.push_back(stream);
        self.cond.notify_one();
        Ok(())
    }

    fn pop(&self, shutdown: &AtomicBool) -> Result<Option<TcpStream>, IpcError> {
        let mut queue = self.queue.lock()?;
        loop {
            if let Some(stream) = queue.pop_front() {
                return Ok(Some(stream));
            }
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let (guard, _) = self.cond.wait_timeout(queue, Duration::from_millis(100))?;
            queue = guard;
        }
    }
}

/// Minimal preemptive-thread request server: an accept loop feeding a
/// bounded connection queue drained by a fixed set of handler threads.
/// The protocol is one request line, `GET <path>`, answered with
/// `<STATUS> <length>` and raw body bytes.
pub struct FileServer {
    port: u16,
    worker_threads: usize,
    max_pending: usize,
}

impl FileServer {
    pub fn new(port: u16, worker_threads: usize, max_pending: usize) -> FileServer {
        FileServer {
            port,
            worker_threads,
            max_pending,
        }
    }

    /// Serves until the shutdown flag flips, then joins every handler
    /// thread and returns. In-flight requests run to completion.
    pub fn serve(
        &self,
        worker: Arc<dyn Worker>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), IpcError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        info!(
            "listening on port {} with {} worker threads",
            self.port, self.worker_threads
        );

        let pending = Arc::new(PendingQueue {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            max_pending: self.max_pending,
        });

        let mut handles = Vec::with_capacity(self.worker_threads);
        for id in 0..self.worker_threads {
            let pending = Arc::clone(&pending);
            let worker = Arc::clone(&worker);
            let shutdown = Arc::clone(&shutdown);
            handles.push(thread::spawn(move || {
                handler_loop(id, &pending, worker.as_ref(), &shutdown);
            }));
        }

        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    pending.push(stream)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        info!("accept loop stopped, waiting for handler threads");
        pending.cond.notify_all();
        for handle in handles {
            if handle.join().is_err() {
                error!("handler thread panicked");
            }
        }
        Ok(())
    }
}

fn handler_loop(id: usize, pending: &PendingQueue, worker: &dyn Worker, shutdown: &AtomicBool) {
    loop {
        let stream = match pending.pop(shutdown) {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(e) => {
                error!("handler {}: pending queue broken: {}", id, e);
                return;
            }
        };
        if let Err(e) = serve_connection(stream, worker) {
            debug!("handler {}: request failed: {}", id, e);
        }
    }
}

fn serve_connection(stream: TcpStream, worker: &dyn Worker) -> Result<(), IpcError> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let path = match parse_request_line(&line) {
        Some(path) => path.to_string(),
        None => {
            let mut ctx = TcpClientContext {
                stream,
                header_sent: false,
            };
            ctx.send_header(Status::Error, 0)?;
            return Err(IpcError::Logic(format!("malformed request {:?}", line)));
        }
    };

    let mut ctx = TcpClientContext {
        stream,
        header_sent: false,
    };
    match worker.handle(&path, &mut ctx) {
        Ok(bytes) => {
            debug!("served {} ({} bytes)", path, bytes);
            Ok(())
        }
        Err(e) => {
            if !ctx.header_sent {
                // Best effort; the client may already be gone.
                let _ = ctx.send_header(Status::Error, 0);
            }
            Err(e)
        }
    }
}

fn parse_request_line(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    let rest = line.strip_prefix("GET ")?;
    let path = rest.trim();
    if path.is_empty() || !path.starts_with('/') {
        return None;
    }
    Some(path)
}
