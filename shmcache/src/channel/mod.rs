use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::core::{IpcConfig, MAX_SEGMENT_NAME_LEN};
use crate::errors::IpcError;

pub const MAX_PATH_LEN: usize = 1024;

/// Worst-case encoded descriptor: two length-prefixed strings plus the
/// capacity word.
pub const DESCRIPTOR_WIRE_MAX: usize = 2 + MAX_PATH_LEN + 2 + MAX_SEGMENT_NAME_LEN + 8;

/// The message a proxy handler sends for the segment it just checked out.
/// The segment name is the whole rendezvous: the events travel inside the
/// segment mapping, so nothing else needs to be named.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub path: String,
    pub segment_name: String,
    pub segment_capacity: u64,
}

impl RequestDescriptor {
    /// Little-endian framing: u16 path length, path bytes, u16 segment name
    /// length, name bytes, u64 capacity. Returns the encoded length.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, IpcError> {
        let path = self.path.as_bytes();
        let name = self.segment_name.as_bytes();
        if path.is_empty() || path.len() > MAX_PATH_LEN {
            return Err(IpcError::Logic(format!(
                "request path must be 1..={} bytes, got {}",
                MAX_PATH_LEN,
                path.len()
            )));
        }
        if name.is_empty() || name.len() > MAX_SEGMENT_NAME_LEN {
            return Err(IpcError::Logic(format!(
                "segment name must be 1..={} bytes, got {}",
                MAX_SEGMENT_NAME_LEN,
                name.len()
            )));
        }
        let need = 2 + path.len() + 2 + name.len() + 8;
        if buf.len() < need {
            return Err(IpcError::Logic("descriptor buffer too small".to_string()));
        }
        let mut at = 0;
        buf[at..at + 2].copy_from_slice(&(path.len() as u16).to_le_bytes());
        at += 2;
        buf[at..at + path.len()].copy_from_slice(path);
        at += path.len();
        buf[at..at + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        at += 2;
        buf[at..at + name.len()].copy_from_slice(name);
        at += name.len();
        buf[at..at + 8].copy_from_slice(&self.segment_capacity.to_le_bytes());
        at += 8;
        Ok(at)
    }

    pub fn decode(buf: &[u8]) -> Result<RequestDescriptor, IpcError> {
        fn take<'a>(buf: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8], IpcError> {
            let end = at
                .checked_add(n)
                .filter(|&end| end <= buf.len())
                .ok_or_else(|| IpcError::Logic("truncated descriptor".to_string()))?;
            let out = &buf[*at..end];
            *at = end;
            Ok(out)
        }

        let mut at = 0;
        let path_len = u16::from_le_bytes(take(buf, &mut at, 2)?.try_into().unwrap()) as usize;
        if path_len == 0 || path_len > MAX_PATH_LEN {
            return Err(IpcError::Logic(format!(
                "descriptor path length {} out of range",
                path_len
            )));
        }
        let path = String::from_utf8(take(buf, &mut at, path_len)?.to_vec())
            .map_err(|_| IpcError::Logic("descriptor path is not UTF-8".to_string()))?;

        let name_len = u16::from_le_bytes(take(buf, &mut at, 2)?.try_into().unwrap()) as usize;
        if name_len == 0 || name_len > MAX_SEGMENT_NAME_LEN {
            return Err(IpcError::Logic(format!(
                "descriptor segment name length {} out of range",
                name_len
            )));
        }
        let segment_name = String::from_utf8(take(buf, &mut at, name_len)?.to_vec())
            .map_err(|_| IpcError::Logic("descriptor segment name is not UTF-8".to_string()))?;

        let segment_capacity = u64::from_le_bytes(take(buf, &mut at, 8)?.try_into().unwrap());

        Ok(RequestDescriptor {
            path,
            segment_name,
            segment_capacity,
        })
    }
}

// Ring layout. Fixed spans keep both processes agreeing on offsets; the
// magic word is stamped last on creation so openers can tell a fully built
// ring from one mid-initialization.
const CHANNEL_MAGIC: u32 = 0x5347_4351;
const MAGIC_OFF: usize = 0;
const CAPACITY_OFF: usize = 4;
const LOCK_OFF: usize = 8;
const LOCK_SPAN: usize = 64;
const NOT_EMPTY_OFF: usize = LOCK_OFF + LOCK_SPAN;
const NOT_FULL_OFF: usize = NOT_EMPTY_OFF + 64;
const STATE_OFF: usize = NOT_FULL_OFF + 64;
const SLOTS_OFF: usize = STATE_OFF + 16;
const SLOT_SPAN: usize = (DESCRIPTOR_WIRE_MAX + 7) & !7;

/// How long a blocked send/receive sleeps between flag checks. Short enough
/// that shutdown is observed promptly, long enough not to spin.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// How long an opener waits for the creator to stamp the magic word.
const INIT_WAIT: Duration = Duration::from_secs(2);

#[repr(C)]
struct RingState {
    head: u32,
    tail: u32,
    len: u32,
}

/// The bounded request channel: a multi-producer/single-consumer descriptor
/// ring in its own shared mapping, recreated on demand by whichever side
/// opens it first. The cache process binds and owns the name (its exit
/// removes the channel); proxy handlers connect per request and never
/// unlink, which is what lets either process restart independently.
pub struct RequestChannel {
    shmem: Shmem,
    lock: Box<dyn LockImpl>,
    not_empty: Box<dyn EventImpl>,
    not_full: Box<dyn EventImpl>,
    capacity: usize,
}

// SAFETY: all mutable ring state lives in the shared mapping behind the
// cross-process mutex and events; the handle itself is just pointers into
// a mapping that outlives it.
unsafe impl Send for RequestChannel {}

fn sync_err(e: Box<dyn std::error::Error>) -> IpcError {
    IpcError::Lock(e)
}

impl RequestChannel {
    /// Cache-process endpoint: create or adopt the ring and own the name.
    pub fn bind(cfg: &IpcConfig) -> Result<RequestChannel, IpcError> {
        RequestChannel::open_or_create(cfg, true)
    }

    /// Proxy-side endpoint, opened per request. Never unlinks the name.
    pub fn connect(cfg: &IpcConfig) -> Result<RequestChannel, IpcError> {
        RequestChannel::open_or_create(cfg, false)
    }

    fn open_or_create(cfg: &IpcConfig, owner: bool) -> Result<RequestChannel, IpcError> {
        let size = SLOTS_OFF + cfg.channel_capacity * SLOT_SPAN;
        match ShmemConf::new()
            .os_id(&cfg.channel_name)
            .size(size)
            .create()
        {
            Ok(mut shmem) => {
                shmem.set_owner(owner);
                RequestChannel::init_fresh(shmem, cfg.channel_capacity)
            }
            Err(ShmemError::MappingIdExists) => {
                let mut shmem = ShmemConf::new().os_id(&cfg.channel_name).open()?;
                shmem.set_owner(owner);
                RequestChannel::adopt(shmem)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn init_fresh(shmem: Shmem, capacity: usize) -> Result<RequestChannel, IpcError> {
        let base = shmem.as_ptr();
        let (lock, not_empty, not_full) = unsafe {
            let (lock, used) =
                Mutex::new(base.add(LOCK_OFF), base.add(STATE_OFF)).map_err(sync_err)?;
            if used > LOCK_SPAN {
                return Err(IpcError::Logic(format!(
                    "mutex state needs {} bytes, only {} reserved",
                    used, LOCK_SPAN
                )));
            }
            let (not_empty, _) =
                Event::new(base.add(NOT_EMPTY_OFF), true).map_err(IpcError::Event)?;
            let (not_full, _) =
                Event::new(base.add(NOT_FULL_OFF), true).map_err(IpcError::Event)?;
            let state = &mut *(base.add(STATE_OFF) as *mut RingState);
            state.head = 0;
            state.tail = 0;
            state.len = 0;
            (lock, not_empty, not_full)
        };

        let header_capacity = unsafe { &*(base.add(CAPACITY_OFF) as *const AtomicU32) };
        header_capacity.store(capacity as u32, Ordering::Release);
        // Stamped last: openers spin on this before touching the ring.
        let magic = unsafe { &*(base.add(MAGIC_OFF) as *const AtomicU32) };
        magic.store(CHANNEL_MAGIC, Ordering::Release);

        Ok(RequestChannel {
            shmem,
            lock,
            not_empty,
            not_full,
            capacity,
        })
    }

    fn adopt(shmem: Shmem) -> Result<RequestChannel, IpcError> {
        let base = shmem.as_ptr();
        let magic = unsafe { &*(base.add(MAGIC_OFF) as *const AtomicU32) };
        let deadline = Instant::now() + INIT_WAIT;
        while magic.load(Ordering::Acquire) != CHANNEL_MAGIC {
            if Instant::now() >= deadline {
                return Err(IpcError::Logic(
                    "request channel mapping never finished initializing".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(10));
        }

        let header_capacity = unsafe { &*(base.add(CAPACITY_OFF) as *const AtomicU32) };
        let capacity = header_capacity.load(Ordering::Acquire) as usize;
        if capacity == 0 || shmem.len() < SLOTS_OFF + capacity * SLOT_SPAN {
            return Err(IpcError::Logic(format!(
                "request channel mapping of {} bytes cannot hold {} slots",
                shmem.len(),
                capacity
            )));
        }

        let (lock, not_empty, not_full) = unsafe {
            let (lock, _) =
                Mutex::from_existing(base.add(LOCK_OFF), base.add(STATE_OFF)).map_err(sync_err)?;
            let (not_empty, _) =
                Event::from_existing(base.add(NOT_EMPTY_OFF)).map_err(IpcError::Event)?;
            let (not_full, _) =
                Event::from_existing(base.add(NOT_FULL_OFF)).map_err(IpcError::Event)?;
            (lock, not_empty, not_full)
        };

        Ok(RequestChannel {
            shmem,
            lock,
            not_empty,
            not_full,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index is always reduced modulo capacity by the callers,
        // and the mapping length was validated against capacity.
        unsafe {
            self.shmem
                .as_ptr()
                .add(SLOTS_OFF + (index as usize % self.capacity) * SLOT_SPAN)
        }
    }

    /// Enqueues one descriptor, blocking while the ring is full. Returns
    /// `Err(Shutdown)` if the flag flips while waiting.
    pub fn send(
        &self,
        descriptor: &RequestDescriptor,
        shutdown: &AtomicBool,
    ) -> Result<(), IpcError> {
        let mut wire = [0u8; DESCRIPTOR_WIRE_MAX];
        let wire_len = descriptor.encode_into(&mut wire)?;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(IpcError::Shutdown);
            }
            {
                let guard = self.lock.lock().map_err(sync_err)?;
                let state = unsafe { &mut *(*guard as *mut RingState) };
                if (state.len as usize) < self.capacity {
                    let slot = self.slot_ptr(state.tail);
                    unsafe {
                        std::ptr::copy_nonoverlapping(wire.as_ptr(), slot, wire_len);
                    }
                    state.tail = state.tail.wrapping_add(1);
                    state.len += 1;
                    drop(guard);
                    self.not_empty
                        .set(EventState::Signaled)
                        .map_err(IpcError::Event)?;
                    return Ok(());
                }
            }
            // Full: wait for the consumer, then recheck. Timeout expiry here
            // only bounds the sleep, it is not an error.
            let _ = self.not_full.wait(Timeout::Val(WAIT_SLICE));
        }
    }

    /// Dequeues one descriptor, blocking while the ring is empty. Returns
    /// `Err(Shutdown)` as soon as the flag is observed; anything still
    /// queued at that point is deliberately discarded by the caller.
    pub fn recv(&self, shutdown: &AtomicBool) -> Result<RequestDescriptor, IpcError> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(IpcError::Shutdown);
            }
            {
                let guard = self.lock.lock().map_err(sync_err)?;
                let state = unsafe { &mut *(*guard as *mut RingState) };
                if state.len > 0 {
                    let mut wire = [0u8; DESCRIPTOR_WIRE_MAX];
                    let slot = self.slot_ptr(state.head);
                    unsafe {
                        std::ptr::copy_nonoverlapping(slot, wire.as_mut_ptr(), wire.len());
                    }
                    state.head = state.head.wrapping_add(1);
                    state.len -= 1;
                    drop(guard);
                    self.not_full
                        .set(EventState::Signaled)
                        .map_err(IpcError::Event)?;
                    return RequestDescriptor::decode(&wire);
                }
            }
            let _ = self.not_empty.wait(Timeout::Val(WAIT_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::unique_prefix;
    use std::sync::Arc;

    fn test_config(tag: &str, capacity: usize) -> IpcConfig {
        IpcConfig {
            channel_name: unique_prefix(tag),
            channel_capacity: capacity,
            ..IpcConfig::default()
        }
    }

    fn descriptor(path: &str) -> RequestDescriptor {
        RequestDescriptor {
            path: path.to_string(),
            segment_name: "shmcache-seg-000".to_string(),
            segment_capacity: 5712,
        }
    }

    #[test]
    fn descriptor_codec_round_trip() {
        let desc = descriptor("/courses/ud923/filecorpus/road.jpg");
        let mut wire = [0u8; DESCRIPTOR_WIRE_MAX];
        let n = desc.encode_into(&mut wire).unwrap();
        assert!(n < DESCRIPTOR_WIRE_MAX);
        assert_eq!(RequestDescriptor::decode(&wire[..n]).unwrap(), desc);
        // Trailing slot padding must not confuse the decoder.
        assert_eq!(RequestDescriptor::decode(&wire).unwrap(), desc);
    }

    #[test]
    fn descriptor_codec_rejects_oversize_and_truncated() {
        let mut wire = [0u8; DESCRIPTOR_WIRE_MAX];
        let long = descriptor(&"a".repeat(MAX_PATH_LEN + 1));
        assert!(matches!(
            long.encode_into(&mut wire),
            Err(IpcError::Logic(_))
        ));

        let desc = descriptor("/x");
        let n = desc.encode_into(&mut wire).unwrap();
        assert!(matches!(
            RequestDescriptor::decode(&wire[..n - 4]),
            Err(IpcError::Logic(_))
        ));
    }

    #[test]
    fn send_recv_round_trip() {
        let cfg = test_config("ch", 4);
        let shutdown = AtomicBool::new(false);
        let producer = RequestChannel::connect(&cfg).unwrap();
        let consumer = RequestChannel::bind(&cfg).unwrap();

        producer.send(&descriptor("/a"), &shutdown).unwrap();
        producer.send(&descriptor("/b"), &shutdown).unwrap();
        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/a");
        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/b");
    }

    #[test]
    fn full_ring_applies_backpressure() {
        let cfg = test_config("full", 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let consumer = RequestChannel::bind(&cfg).unwrap();
        let producer = RequestChannel::connect(&cfg).unwrap();

        producer.send(&descriptor("/1"), &shutdown).unwrap();
        producer.send(&descriptor("/2"), &shutdown).unwrap();

        let blocked = {
            let cfg = cfg.clone();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let producer = RequestChannel::connect(&cfg).unwrap();
                producer.send(&descriptor("/3"), &shutdown)
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!blocked.is_finished());

        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/1");
        blocked.join().unwrap().unwrap();
        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/2");
        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/3");
    }

    #[test]
    fn recv_observes_shutdown() {
        let cfg = test_config("shut", 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let consumer = RequestChannel::bind(&cfg).unwrap();

        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || consumer.recv(&shutdown))
        };
        std::thread::sleep(Duration::from_millis(60));
        shutdown.store(true, Ordering::SeqCst);
        assert!(matches!(waiter.join().unwrap(), Err(IpcError::Shutdown)));
    }

    #[test]
    fn channel_is_recreated_after_owner_drop() {
        // The cache process restarting must not strand the proxy: once the
        // owner endpoint drops (unlinking the name), the next connect
        // builds a fresh ring under the same name.
        let cfg = test_config("re", 2);
        let shutdown = AtomicBool::new(false);

        let owner = RequestChannel::bind(&cfg).unwrap();
        drop(owner);

        let producer = RequestChannel::connect(&cfg).unwrap();
        producer.send(&descriptor("/after"), &shutdown).unwrap();
        let consumer = RequestChannel::bind(&cfg).unwrap();
        assert_eq!(consumer.recv(&shutdown).unwrap().path, "/after");
    }
}
