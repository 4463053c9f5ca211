use std::mem;
use std::slice;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf};

use crate::errors::IpcError;

/// Space reserved for each raw_sync event at the head of a segment mapping.
/// The futex-backed events are far smaller than this; the fixed span keeps
/// both sides agreeing on offsets without negotiating sizes.
const EVENT_SPAN: usize = 64;

const DATA_READY_OFF: usize = 0;
const WRITE_PERMIT_OFF: usize = EVENT_SPAN;
const HEADER_OFF: usize = 2 * EVENT_SPAN;

/// Control words shared by both sides of a segment, after the two events.
///
/// `file_len < 0` means the path could not be resolved. `content_len <= 0`
/// observed mid-stream means the producer hit a read error and stopped.
#[repr(C)]
struct SegmentHeader {
    file_len: AtomicI64,
    content_len: AtomicI64,
}

const PAYLOAD_OFF: usize = HEADER_OFF + mem::size_of::<SegmentHeader>();

/// Bytes of a segment mapping not available for payload.
pub const SEGMENT_OVERHEAD: usize = PAYLOAD_OFF;

pub const MIN_SEGMENT_SIZE: usize = 1024;
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_SEGMENT_NAME_LEN: usize = 64;

/// Settings shared by the proxy and cache processes. Both sides must load
/// the same values for the segment names and the channel to line up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Prefix for segment os ids, e.g. `shmcache` yields `shmcache-seg-000`.
    pub name_prefix: String,
    /// os id of the request channel mapping.
    pub channel_name: String,
    /// Number of descriptor slots in the request channel ring.
    pub channel_capacity: usize,
    /// Upper bound for every handshake wait, in milliseconds. Expiry is
    /// reported as `PeerUnresponsive` instead of blocking forever.
    pub handshake_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> IpcConfig {
        IpcConfig {
            name_prefix: "shmcache".to_string(),
            channel_name: "shmcache-requests".to_string(),
            channel_capacity: 64,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl IpcConfig {
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.name_prefix.is_empty() || self.name_prefix.len() > 32 {
            return Err(IpcError::Config(
                "name_prefix must be 1..=32 bytes".to_string(),
            ));
        }
        if self.channel_name.is_empty() || self.channel_name.len() > MAX_SEGMENT_NAME_LEN {
            return Err(IpcError::Config(format!(
                "channel_name must be 1..={} bytes",
                MAX_SEGMENT_NAME_LEN
            )));
        }
        if self.channel_capacity < 1 || self.channel_capacity > 4096 {
            return Err(IpcError::Config(
                "channel_capacity must be in 1..=4096".to_string(),
            ));
        }
        if self.handshake_timeout_ms < 1 || self.handshake_timeout_ms > 600_000 {
            return Err(IpcError::Config(
                "handshake_timeout_ms must be in 1..=600000".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Timeout {
        Timeout::Val(Duration::from_millis(self.handshake_timeout_ms))
    }
}

pub fn segment_name(prefix: &str, index: usize) -> String {
    format!("{}-seg-{:03}", prefix, index)
}

/// Removes a leftover mapping from a crashed run so `create` can claim the
/// name again. Absence is the normal case and not an error.
fn unlink_stale(os_id: &str) {
    if let Ok(name) = std::ffi::CString::new(format!("/{}", os_id)) {
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
    }
}

fn event_err(e: Box<dyn std::error::Error>) -> IpcError {
    IpcError::Event(e)
}

unsafe fn map_one_event(ptr: *mut u8, init: bool) -> Result<Box<dyn EventImpl>, IpcError> {
    let (evt, used) = if init {
        Event::new(ptr, true).map_err(event_err)?
    } else {
        Event::from_existing(ptr).map_err(event_err)?
    };
    if used > EVENT_SPAN {
        return Err(IpcError::Logic(format!(
            "event state needs {} bytes, only {} reserved",
            used, EVENT_SPAN
        )));
    }
    Ok(evt)
}

/// Carves the two events out of the head of a segment mapping.
///
/// `init` is true for the creating side, which builds fresh event state;
/// the attaching side adopts whatever the creator laid down.
unsafe fn map_events(
    base: *mut u8,
    init: bool,
) -> Result<(Box<dyn EventImpl>, Box<dyn EventImpl>), IpcError> {
    let data_ready = map_one_event(base.add(DATA_READY_OFF), init)?;
    let write_permit = map_one_event(base.add(WRITE_PERMIT_OFF), init)?;
    Ok((data_ready, write_permit))
}

/// One pool slot: the shared mapping and both handshake events behind a
/// single owned handle. Created once by the proxy at startup; the proxy is
/// the owner, so dropping it unmaps and unlinks the os name.
///
/// Consumer-side operations live here. The cache process never holds a
/// `Segment`; it attaches a `SegmentWriter` for the duration of one request.
pub struct Segment {
    shmem: Shmem,
    data_ready: Box<dyn EventImpl>,
    write_permit: Box<dyn EventImpl>,
    capacity: usize,
}

// SAFETY: the mapping is process-shared memory and the events are
// futex-backed state inside it; moving the handle between threads does not
// move the underlying state. Exclusive use per checkout is enforced by the
// pool, concurrent producer access by the event handshake.
unsafe impl Send for Segment {}

impl Segment {
    /// Allocates the shared mapping for one pool slot and primes the
    /// handshake: data-ready clear, write-permit signaled. The pre-seeded
    /// write permit lets the producer publish the first chunk without
    /// waiting for a grant; starting it clear deadlocks the first request.
    pub fn create(prefix: &str, index: usize, capacity: usize) -> Result<Segment, IpcError> {
        let name = segment_name(prefix, index);
        unlink_stale(&name);
        let shmem = ShmemConf::new()
            .os_id(&name)
            .size(SEGMENT_OVERHEAD + capacity)
            .create()?;
        let (data_ready, write_permit) = unsafe { map_events(shmem.as_ptr(), true)? };
        let seg = Segment {
            shmem,
            data_ready,
            write_permit,
            capacity,
        };
        seg.rearm()?;
        Ok(seg)
    }

    pub fn name(&self) -> &str {
        self.shmem.get_os_id()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least SEGMENT_OVERHEAD bytes and the
        // header offset is 8-aligned within a page-aligned mapping.
        unsafe { &*(self.shmem.as_ptr().add(HEADER_OFF) as *const SegmentHeader) }
    }

    /// Restores the primed event state. Called on every return to the pool
    /// so a request abandoned mid-handshake (peer timeout, client gone)
    /// cannot leave the next checkout facing a dead write permit.
    pub fn rearm(&self) -> Result<(), IpcError> {
        self.data_ready.set(EventState::Clear).map_err(event_err)?;
        self.write_permit
            .set(EventState::Signaled)
            .map_err(event_err)?;
        self.header().file_len.store(0, Ordering::Release);
        self.header().content_len.store(0, Ordering::Release);
        Ok(())
    }

    /// First handshake wait: blocks until the producer has published the
    /// resolved length. Negative means the path was not found.
    pub fn await_file_len(&self, timeout: Timeout) -> Result<i64, IpcError> {
        self.data_ready
            .wait(timeout)
            .map_err(|_| IpcError::PeerUnresponsive("data-ready (header)"))?;
        Ok(self.header().file_len.load(Ordering::Acquire))
    }

    /// Blocks until the next chunk is resident and returns its length.
    /// A non-positive value is the producer's stop sentinel.
    pub fn await_chunk_len(&self, timeout: Timeout) -> Result<i64, IpcError> {
        self.data_ready
            .wait(timeout)
            .map_err(|_| IpcError::PeerUnresponsive("data-ready (chunk)"))?;
        Ok(self.header().content_len.load(Ordering::Acquire))
    }

    /// Borrows the current chunk. Only valid between a successful
    /// `await_chunk_len` and the following `grant_write`.
    pub fn chunk(&self, len: usize) -> Result<&[u8], IpcError> {
        if len > self.capacity {
            return Err(IpcError::Logic(format!(
                "chunk length {} exceeds segment capacity {}",
                len, self.capacity
            )));
        }
        // SAFETY: bounds checked above; the producer does not touch the
        // payload again until write-permit is granted.
        Ok(unsafe { slice::from_raw_parts(self.shmem.as_ptr().add(PAYLOAD_OFF), len) })
    }

    /// Lets the producer overwrite the payload with the next chunk.
    pub fn grant_write(&self) -> Result<(), IpcError> {
        self.write_permit
            .set(EventState::Signaled)
            .map_err(event_err)
    }
}

/// Producer-side attachment to a segment named in a request descriptor.
/// Lives for exactly one request; dropping it unmaps without unlinking,
/// since the proxy owns the name.
pub struct SegmentWriter {
    shmem: Shmem,
    data_ready: Box<dyn EventImpl>,
    write_permit: Box<dyn EventImpl>,
    capacity: usize,
}

unsafe impl Send for SegmentWriter {}

impl SegmentWriter {
    pub fn attach(name: &str, capacity: usize) -> Result<SegmentWriter, IpcError> {
        let shmem = ShmemConf::new().os_id(name).open()?;
        if shmem.len() < SEGMENT_OVERHEAD + capacity {
            return Err(IpcError::Logic(format!(
                "segment {} maps {} bytes, descriptor claims capacity {}",
                name,
                shmem.len(),
                capacity
            )));
        }
        let (data_ready, write_permit) = unsafe { map_events(shmem.as_ptr(), false)? };
        Ok(SegmentWriter {
            shmem,
            data_ready,
            write_permit,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: mapping length checked in attach.
        unsafe { &*(self.shmem.as_ptr().add(HEADER_OFF) as *const SegmentHeader) }
    }

    /// Publishes the resolved length (the header handoff) and signals
    /// data-ready once. With a negative length this is the entire response.
    pub fn post_file_len(&self, file_len: i64) -> Result<(), IpcError> {
        self.header().file_len.store(file_len, Ordering::Release);
        self.data_ready
            .set(EventState::Signaled)
            .map_err(event_err)
    }

    /// Blocks until the consumer has drained the previous chunk. The very
    /// first wait succeeds immediately against the pool's pre-seeded permit.
    pub fn wait_write_permit(&self, timeout: Timeout) -> Result<(), IpcError> {
        self.write_permit
            .wait(timeout)
            .map_err(|_| IpcError::PeerUnresponsive("write-permit"))
    }

    /// The payload area to read file bytes into. Only valid while this side
    /// holds the write permit.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: mapping length checked in attach; the consumer does not
        // read the payload until data-ready is signaled.
        unsafe { slice::from_raw_parts_mut(self.shmem.as_ptr().add(PAYLOAD_OFF), self.capacity) }
    }

    /// Publishes the chunk now resident in the payload. A non-positive
    /// value tells the consumer to stop (mid-stream read failure).
    pub fn commit_chunk(&self, content_len: i64) -> Result<(), IpcError> {
        self.header()
            .content_len
            .store(content_len, Ordering::Release);
        self.data_ready
            .set(EventState::Signaled)
            .map_err(event_err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn unique_prefix(tag: &str) -> String {
        format!(
            "shmct-{}-{}-{}",
            tag,
            std::process::id(),
            NAME_COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn config_defaults_validate() {
        IpcConfig::default().validate().unwrap();
    }

    #[test]
    fn config_rejects_out_of_range() {
        let mut cfg = IpcConfig::default();
        cfg.channel_capacity = 0;
        assert!(matches!(cfg.validate(), Err(IpcError::Config(_))));

        let mut cfg = IpcConfig::default();
        cfg.handshake_timeout_ms = 0;
        assert!(matches!(cfg.validate(), Err(IpcError::Config(_))));

        let mut cfg = IpcConfig::default();
        cfg.name_prefix = String::new();
        assert!(matches!(cfg.validate(), Err(IpcError::Config(_))));
    }

    #[test]
    fn segment_names_are_fixed_width() {
        assert_eq!(segment_name("shmcache", 0), "shmcache-seg-000");
        assert_eq!(segment_name("shmcache", 17), "shmcache-seg-017");
    }

    #[test]
    fn header_handoff_round_trip() {
        let prefix = unique_prefix("hdr");
        let seg = Segment::create(&prefix, 0, 2048).unwrap();
        let writer = SegmentWriter::attach(seg.name(), 2048).unwrap();

        writer.post_file_len(4242).unwrap();
        let len = seg.await_file_len(Timeout::Val(Duration::from_secs(1))).unwrap();
        assert_eq!(len, 4242);
    }

    #[test]
    fn first_chunk_needs_no_grant() {
        // The pre-seeded write permit must let the producer publish the
        // first chunk before the consumer has granted anything.
        let prefix = unique_prefix("prime");
        let seg = Segment::create(&prefix, 0, 256).unwrap();
        let mut writer = SegmentWriter::attach(seg.name(), 256).unwrap();

        writer
            .wait_write_permit(Timeout::Val(Duration::from_millis(100)))
            .unwrap();
        writer.payload_mut()[..5].copy_from_slice(b"hello");
        writer.commit_chunk(5).unwrap();

        let n = seg
            .await_chunk_len(Timeout::Val(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(seg.chunk(5).unwrap(), b"hello");

        // No grant has happened yet, so a second permit wait must time out.
        assert!(matches!(
            writer.wait_write_permit(Timeout::Val(Duration::from_millis(50))),
            Err(IpcError::PeerUnresponsive(_))
        ));

        seg.grant_write().unwrap();
        writer
            .wait_write_permit(Timeout::Val(Duration::from_millis(100)))
            .unwrap();
    }

    #[test]
    fn rearm_restores_priming_after_error_path() {
        let prefix = unique_prefix("rearm");
        let seg = Segment::create(&prefix, 0, 256).unwrap();
        let writer = SegmentWriter::attach(seg.name(), 256).unwrap();

        // Simulate the (0,0) state a mid-stream failure leaves behind:
        // producer consumed the permit, consumer consumed the error signal.
        writer
            .wait_write_permit(Timeout::Val(Duration::from_millis(100)))
            .unwrap();
        writer.commit_chunk(-1).unwrap();
        let n = seg
            .await_chunk_len(Timeout::Val(Duration::from_secs(1)))
            .unwrap();
        assert!(n <= 0);

        seg.rearm().unwrap();
        writer
            .wait_write_permit(Timeout::Val(Duration::from_millis(100)))
            .unwrap();
    }

    #[test]
    fn chunk_length_is_bounds_checked() {
        let prefix = unique_prefix("bounds");
        let seg = Segment::create(&prefix, 0, 128).unwrap();
        assert!(matches!(seg.chunk(129), Err(IpcError::Logic(_))));
    }
}
