//! Sink writer: drains the queue through the optional stages into the sink.

use std::borrow::Cow;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::ExitStatus;
use crate::queue::{BoundedQueue, QueueError, QueueItem};
use crate::stages::{Decoder, Filter, Filtered, Selection, Stages};
use crate::stats::PipelineStats;
use crate::termination::{StopCause, Termination};

pub const DEFAULT_FILTER_GRACE: Duration = Duration::from_secs(4);

#[derive(Debug)]
pub enum WriterExit {
    /// The end-of-stream sentinel arrived.
    Drained,
    /// Termination was requested while the queue was empty.
    Cancelled,
    ConsumerTimeout,
    SinkFailed(io::Error),
}

impl WriterExit {
    pub fn status(&self) -> ExitStatus {
        match self {
            WriterExit::Drained | WriterExit::Cancelled => ExitStatus::Success,
            WriterExit::ConsumerTimeout => ExitStatus::ConsumerTimeout,
            WriterExit::SinkFailed(_) => ExitStatus::SinkFailed,
        }
    }
}

/// Clears the liveness flag however the writer leaves, panics included.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SinkWriter<W> {
    queue: Arc<BoundedQueue>,
    stats: Arc<PipelineStats>,
    termination: Arc<Termination>,
    sink: W,
    decoder: Option<Box<dyn Decoder>>,
    filter: Option<Box<dyn Filter>>,
    filter_ready: bool,
    filter_grace: Duration,
    /// When the first frame arrived; the filter grace period counts from here.
    first_frame: Option<Instant>,
    chunk_size: usize,
    alive: Arc<AtomicBool>,
}

impl<W: Write + Send> SinkWriter<W> {
    pub fn new(
        queue: Arc<BoundedQueue>,
        stats: Arc<PipelineStats>,
        termination: Arc<Termination>,
        sink: W,
        chunk_size: usize,
    ) -> Self {
        Self {
            queue,
            stats,
            termination,
            sink,
            decoder: None,
            filter: None,
            filter_ready: false,
            filter_grace: DEFAULT_FILTER_GRACE,
            first_frame: None,
            chunk_size: chunk_size.max(1),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_stages(mut self, stages: Stages) -> Self {
        self.decoder = stages.decoder;
        self.filter = stages.filter;
        self
    }

    pub fn with_filter_grace(mut self, grace: Duration) -> Self {
        self.filter_grace = grace;
        self
    }

    /// True until `run` returns.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn run(mut self) -> WriterExit {
        let _alive = AliveGuard(self.alive.clone());

        let exit = loop {
            let frame = match self.queue.pop() {
                Ok(QueueItem::Frame(frame)) => frame,
                Ok(QueueItem::End) => {
                    debug!("[Writer] End of stream");
                    break self.finish(WriterExit::Drained);
                }
                Err(QueueError::Cancelled) => {
                    debug!("[Writer] Termination requested, queue drained");
                    break self.finish(WriterExit::Cancelled);
                }
                Err(QueueError::Timeout(waited)) => {
                    error!("[Writer] No data from capture for {:?}", waited);
                    break self.finish(WriterExit::ConsumerTimeout);
                }
            };

            self.first_frame.get_or_insert_with(Instant::now);
            let written_before = self.stats.snapshot().written;
            if let Err(e) = self.process(frame.as_bytes()) {
                let sent = self.stats.snapshot().written.saturating_sub(written_before);
                let unsent = (frame.len() as u64).saturating_sub(sent);
                self.stats.add_dropped(unsent as usize);
                break self.fail(e);
            }
        };

        info!("[Writer] Stopped: {:?}", exit);
        exit
    }

    fn process(&mut self, bytes: &[u8]) -> io::Result<()> {
        let decoded = match self.decoder.as_mut() {
            Some(decoder) => match decoder.decode(bytes) {
                Ok(out) => Cow::Owned(out),
                Err(e) => {
                    warn!("[Writer] Decoder failed, writing raw stream from now on: {}", e);
                    self.decoder = None;
                    Cow::Borrowed(bytes)
                }
            },
            None => Cow::Borrowed(bytes),
        };

        match self.apply_filter(&decoded) {
            Some(out) => self.write_chunks(&out),
            None => Ok(()),
        }
    }

    /// `None` when nothing from this frame should reach the sink.
    fn apply_filter<'a>(&mut self, data: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        let Some(filter) = self.filter.as_mut() else {
            return Some(Cow::Borrowed(data));
        };

        if !self.filter_ready {
            match filter.select_target(data) {
                Ok(Selection::Ready) => {
                    info!("[Writer] Filter target identified");
                    self.filter_ready = true;
                }
                Ok(Selection::MoreNeeded) => {
                    let waited = self.first_frame.map_or(Duration::ZERO, |t| t.elapsed());
                    if waited >= self.filter_grace {
                        warn!(
                            "[Writer] Filter target not found within {:?}, writing unfiltered stream",
                            self.filter_grace
                        );
                        self.filter = None;
                    }
                    return Some(Cow::Borrowed(data));
                }
                Err(e) => {
                    warn!("[Writer] Filter disabled: {}", e);
                    self.filter = None;
                    return Some(Cow::Borrowed(data));
                }
            }
        }

        match filter.filter(data) {
            Ok(Filtered::Data(out)) => Some(Cow::Owned(out)),
            Ok(Filtered::PendingMetadata) => None,
            Err(e) => {
                warn!("[Writer] Filter error, dropping {} bytes: {}", data.len(), e);
                None
            }
        }
    }

    fn write_chunks(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            let mut rest = chunk;
            while !rest.is_empty() {
                match self.sink.write(rest) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => {
                        self.stats.add_written(n);
                        rest = &rest[n..];
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Flush trailing stage output and the sink.
    fn finish(&mut self, exit: WriterExit) -> WriterExit {
        if let Some(decoder) = self.decoder.as_mut() {
            match decoder.finish() {
                Ok(tail) if !tail.is_empty() => {
                    let tail = match self.apply_filter(&tail) {
                        Some(out) => out.into_owned(),
                        None => Vec::new(),
                    };
                    if let Err(e) = self.write_chunks(&tail) {
                        return self.fail(e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("[Writer] Decoder flush failed: {}", e),
            }
        }
        if let Err(e) = self.sink.flush() {
            return self.fail(e);
        }
        exit
    }

    fn fail(&mut self, e: io::Error) -> WriterExit {
        error!("[Writer] Write to sink failed: {}", e);
        self.termination.request(StopCause::SinkFailed);
        WriterExit::SinkFailed(e)
    }
}
