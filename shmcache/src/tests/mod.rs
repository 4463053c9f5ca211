//! Cross-thread tests that run both sides of the handshake protocol in one
//! process: a real segment pool and request channel, the cache service loop
//! on background threads, and handler calls recorded through an in-memory
//! client.


use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use tempfile::TempDir;

use crate::cache::{self, CacheContext};
use crate::core::tests::unique_prefix;
use crate::core::IpcConfig;
use crate::errors::IpcError;
use crate::server::{ClientContext, Status};
use crate::store::{FileStore, Store};

pub(crate) fn test_ipc_config(tag: &str) -> IpcConfig {
    IpcConfig {
        name_prefix: unique_prefix(tag),
        channel_name: unique_prefix(tag),
        channel_capacity: 16,
        handshake_timeout_ms: 5_000,
    }
}

/// Writes the given resources plus a map file and loads a store over them.
pub(crate) fn temp_store(entries: &[(&str, &[u8])]) -> (TempDir, Arc<FileStore>) {
    let dir = tempfile::tempdir().unwrap();
    let mut map = String::new();
    for (index, (path, contents)) in entries.iter().enumerate() {
        let local = dir.path().join(format!("file-{}", index));
        File::create(&local).unwrap().write_all(contents).unwrap();
        map.push_str(&format!("{} {}\n", path, local.display()));
    }
    let map_path = dir.path().join("locals.txt");
    File::create(&map_path)
        .unwrap()
        .write_all(map.as_bytes())
        .unwrap();
    let store = Arc::new(FileStore::load(&map_path, 0).unwrap());
    (dir, store)
}

/// A cache process stand-in: `cache::run` on a background thread with its
/// own shutdown flag, stopped and joined by `stop`.
pub(crate) struct CacheRig {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), IpcError>>>,
}

impl CacheRig {
    pub(crate) fn start(store: Arc<dyn Store>, ipc: IpcConfig, workers: usize) -> CacheRig {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(CacheContext {
            store,
            ipc,
            shutdown: Arc::clone(&shutdown),
        });
        let handle = std::thread::spawn(move || cache::run(ctx, workers));
        CacheRig {
            shutdown,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(mut self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for CacheRig {
    fn drop(&mut self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Records what a client connection would have seen.
#[derive(Default)]
pub(crate) struct RecordingClient {
    pub(crate) header: Option<(Status, u64)>,
    pub(crate) body: Vec<u8>,
    pub(crate) body_calls: usize,
}

impl ClientContext for RecordingClient {
    fn send_header(&mut self, status: Status, length: u64) -> Result<(), IpcError> {
        assert!(self.header.is_none(), "header sent twice");
        self.header = Some((status, length));
        Ok(())
    }

    fn send_body(&mut self, bytes: &[u8]) -> Result<usize, IpcError> {
        self.body.extend_from_slice(bytes);
        self.body_calls += 1;
        Ok(bytes.len())
    }
}

pub(crate) fn file_of(pattern: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| pattern.wrapping_add(i as u8)).collect()
}

pub(crate) fn open_readable(path: &Path) -> File {
    File::open(path).unwrap()
}
