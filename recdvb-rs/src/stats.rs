//! Byte counters shared between the capture loop and the sink writer.

use parking_lot::Mutex;

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes read from the stream device.
    pub read: u64,
    /// Bytes handed to the sink.
    pub written: u64,
    /// Bytes that never reached the sink: queue overruns, frames left queued
    /// at shutdown and the unsent part of a frame whose write failed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    inner: Mutex<StatsSnapshot>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, bytes: usize) {
        self.inner.lock().read += bytes as u64;
    }

    pub fn add_written(&self, bytes: usize) {
        self.inner.lock().written += bytes as u64;
    }

    pub fn add_dropped(&self, bytes: usize) {
        self.inner.lock().dropped += bytes as u64;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }
}
