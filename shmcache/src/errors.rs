use std::{fmt, io};

/// Crate-wide error type. `raw_sync` reports errors as boxed trait objects,
/// so those are carried opaquely in the `Event` and `Lock` variants.
#[derive(Debug)]
pub enum IpcError {
    SharedMemory(shared_memory::ShmemError),
    Event(Box<dyn std::error::Error + 'static>),
    Lock(Box<dyn std::error::Error + 'static>),
    Io(io::Error),
    /// A handshake wait expired: the peer process never signaled within the
    /// configured timeout. The request is abandoned, never retried.
    PeerUnresponsive(&'static str),
    /// Observed the shutdown flag while blocked; not a failure.
    Shutdown,
    Config(String),
    PoisonedLock,
    Logic(String),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::SharedMemory(e) => write!(f, "shared memory error: {}", e),
            IpcError::Event(e) => write!(f, "event error: {}", e),
            IpcError::Lock(e) => write!(f, "lock error: {}", e),
            IpcError::Io(e) => write!(f, "IO error: {}", e),
            IpcError::PeerUnresponsive(which) => {
                write!(f, "peer unresponsive waiting on {}", which)
            }
            IpcError::Shutdown => write!(f, "shutting down"),
            IpcError::Config(s) => write!(f, "invalid configuration: {}", s),
            IpcError::PoisonedLock => write!(f, "mutex was poisoned"),
            IpcError::Logic(s) => write!(f, "logic error: {}", s),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::SharedMemory(e) => Some(e),
            IpcError::Event(e) => Some(e.as_ref()),
            IpcError::Lock(e) => Some(e.as_ref()),
            IpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for IpcError {
    fn from(err: shared_memory::ShmemError) -> Self {
        IpcError::SharedMemory(err)
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::Io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for IpcError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        IpcError::PoisonedLock
    }
}
