use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::errors::IpcError;

/// Installs the graceful-drain trigger: the first SIGINT/SIGTERM flips the
/// flag and runs `on_signal` (e.g. waking a pool's blocked acquirers), then
/// the watcher thread exits so a second signal falls through to the default
/// disposition.
///
/// Every blocking loop in both processes observes the flag; nothing exits
/// mid-handshake because of a signal alone.
pub fn install_drain_handler<F>(
    shutdown: Arc<AtomicBool>,
    on_signal: F,
) -> Result<(), IpcError>
where
    F: FnOnce() + Send + 'static,
{
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {}, starting graceful drain", signal);
            shutdown.store(true, Ordering::SeqCst);
            on_signal();
        }
    });
    Ok(())
}
