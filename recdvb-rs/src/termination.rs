//! Cooperative cancellation shared by every pipeline thread.
//!
//! A [`Termination`] is a flag plus an `eventfd`. The flag is what the queue
//! and the writer poll; the eventfd is registered in the capture loop's epoll
//! set so a request wakes it without waiting for the next timer tick.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

/// Why the session was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Operator request (SIGINT, SIGTERM, SIGHUP).
    Interrupted,
    /// The sink writer hit an unrecoverable write error.
    SinkFailed,
}

pub struct Termination {
    requested: AtomicBool,
    cause: Mutex<Option<StopCause>>,
    waker: EventFd,
}

impl std::fmt::Debug for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Termination")
            .field("requested", &self.is_requested())
            .field("cause", &self.cause())
            .finish()
    }
}

impl Termination {
    pub fn new() -> io::Result<Arc<Self>> {
        let waker = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(Arc::new(Self {
            requested: AtomicBool::new(false),
            cause: Mutex::new(None),
            waker,
        }))
    }

    /// Raise the flag. The first cause sticks; later requests only re-wake.
    pub fn request(&self, cause: StopCause) {
        {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                debug!("[Termination] Stop requested: {:?}", cause);
                *slot = Some(cause);
            }
        }
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.write(1) {
            warn!("[Termination] Failed to signal waker: {}", e);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<StopCause> {
        *self.cause.lock()
    }

    pub(crate) fn waker_fd(&self) -> BorrowedFd<'_> {
        self.waker.as_fd()
    }

    /// Reset the eventfd counter after the loop has observed a wakeup.
    pub(crate) fn drain_wakeup(&self) {
        // EAGAIN just means somebody else drained it first.
        let _ = self.waker.read();
    }
}

/// Route SIGINT/SIGTERM/SIGHUP into `termination`.
///
/// Only one handler may be installed per process; the binary calls this once.
pub fn install_signal_handler(termination: Arc<Termination>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        warn!("Caught signal, stopping...");
        termination.request(StopCause::Interrupted);
    })
}
