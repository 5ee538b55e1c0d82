//! In-memory sink for pipeline tests.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub(crate) struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    stalled: Arc<AtomicBool>,
    short_writes: Option<usize>,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept at most `n` bytes per `write` call.
    pub(crate) fn with_short_writes(mut self, n: usize) -> Self {
        self.short_writes = Some(n);
        self
    }

    /// Fail every write once `n` bytes have been stored.
    pub(crate) fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Block writers until `resume`.
    pub(crate) fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.stalled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().len()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        while self.stalled.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        let mut data = self.data.lock();
        if self.fail_after.is_some_and(|limit| data.len() >= limit) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        let n = self.short_writes.map_or(buf.len(), |max| buf.len().min(max));
        data.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
