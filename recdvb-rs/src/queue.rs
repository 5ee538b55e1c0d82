//! Fixed-capacity FIFO between the capture loop and the sink writer.
//!
//! The queue is a ring of [`QueueItem`] slots behind one mutex with two
//! condition variables. Both `push` and `pop` block in windows of
//! [`RetryPolicy::wait_window`] up to [`RetryPolicy::max_waits`] windows, then
//! give up with [`QueueError::Timeout`]. If a [`Termination`] is attached, a
//! raised flag aborts the wait at the end of the current window.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::termination::Termination;

/// Largest read from the stream device: 87 TS packets.
pub const MAX_READ_SIZE: usize = 188 * 87;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// One read from the device.
pub struct Frame {
    buf: Box<[u8]>,
    len: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; MAX_READ_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    /// Copy `data` into a new frame, truncating at [`MAX_READ_SIZE`].
    pub fn from_slice(data: &[u8]) -> Self {
        let mut frame = Self::new();
        let n = data.len().min(MAX_READ_SIZE);
        frame.buf[..n].copy_from_slice(&data[..n]);
        frame.len = n;
        frame
    }

    /// The whole backing buffer, for the device read.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.len).finish()
    }
}

/// What travels through the queue. `End` is the end-of-stream sentinel.
#[derive(Debug)]
pub enum QueueItem {
    Frame(Frame),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub wait_window: Duration,
    pub max_waits: u32,
}

impl RetryPolicy {
    /// Total time a single `push` or `pop` may block.
    pub fn budget(&self) -> Duration {
        self.wait_window * self.max_waits
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            wait_window: Duration::from_secs(1),
            max_waits: 15,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The retry budget ran out.
    #[error("queue wait timed out after {0:?}")]
    Timeout(Duration),
    /// Termination was requested while waiting.
    #[error("queue wait aborted by termination request")]
    Cancelled,
}

/// A rejected `push`. The item is handed back so the caller may retry or drop it.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct PushError {
    pub item: QueueItem,
    pub reason: QueueError,
}

struct Ring {
    slots: Box<[Option<QueueItem>]>,
    head: usize,
    tail: usize,
    used: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.used == self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn put(&mut self, item: QueueItem) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.used += 1;
    }

    fn take(&mut self) -> Option<QueueItem> {
        let item = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.capacity();
        self.used -= 1;
        Some(item)
    }
}

pub struct BoundedQueue {
    ring: Mutex<Ring>,
    space_available: Condvar,
    item_available: Condvar,
    policy: RetryPolicy,
    termination: Option<Arc<Termination>>,
}

impl BoundedQueue {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize, policy: RetryPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            space_available: Condvar::new(),
            item_available: Condvar::new(),
            policy,
            termination: None,
        }
    }

    pub fn with_termination(mut self, termination: Arc<Termination>) -> Self {
        self.termination = Some(termination);
        self
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn used(&self) -> usize {
        self.ring.lock().used
    }

    pub fn available(&self) -> usize {
        let ring = self.ring.lock();
        ring.capacity() - ring.used
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn push(&self, item: QueueItem) -> Result<(), PushError> {
        let mut ring = self.ring.lock();
        if let Err(reason) = self.wait_while(&mut ring, &self.space_available, Ring::is_full) {
            return Err(PushError { item, reason });
        }
        ring.put(item);
        drop(ring);
        self.item_available.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Result<QueueItem, QueueError> {
        let mut ring = self.ring.lock();
        self.wait_while(&mut ring, &self.item_available, Ring::is_empty)?;
        let item = ring.take();
        drop(ring);
        self.space_available.notify_one();
        // wait_while only returns Ok once the ring is non-empty
        item.ok_or(QueueError::Timeout(Duration::ZERO))
    }

    /// Discard everything still queued. Returns the frame bytes thrown away.
    pub fn drain(&self) -> usize {
        let mut ring = self.ring.lock();
        let mut bytes = 0;
        while let Some(item) = ring.take() {
            if let QueueItem::Frame(frame) = item {
                bytes += frame.len();
            }
        }
        drop(ring);
        self.space_available.notify_all();
        bytes
    }

    fn wait_while(
        &self,
        ring: &mut MutexGuard<'_, Ring>,
        cond: &Condvar,
        blocked: fn(&Ring) -> bool,
    ) -> Result<(), QueueError> {
        let budget = self.policy.budget();
        let deadline = Instant::now() + budget;
        while blocked(&**ring) {
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::Timeout(budget));
            }
            let window_end = (now + self.policy.wait_window).min(deadline);
            // Spurious and notified wakeups both fall through to the re-check.
            cond.wait_until(ring, window_end);
            if blocked(&**ring) && self.cancelled() {
                return Err(QueueError::Cancelled);
            }
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.termination.as_ref().map_or(false, |t| t.is_requested())
    }
}
