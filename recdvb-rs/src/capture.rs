//! The capture loop: one thread multiplexing the termination waker, a
//! periodic timer, the frontend (until lock) and the DVR (after lock) with
//! epoll, moving every read into the queue.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::channels::Channel;
use crate::config::RecordingOptions;
use crate::error::ExitStatus;
use crate::queue::{BoundedQueue, Frame, QueueItem};
use crate::stats::PipelineStats;
use crate::termination::{StopCause, Termination};
use crate::tuner::{DvbBackend, TunerError, TunerSession, Voltage};

const TOKEN_SIGNAL: u64 = 0;
const TOKEN_TIMER: u64 = 1;
const TOKEN_FRONTEND: u64 = 2;
const TOKEN_STREAM: u64 = 3;

/// Upper bound on one `epoll_wait`, so liveness checks run without events.
const WAIT_TIMEOUT_MS: u16 = 1000;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub channel: Channel,
    pub tsid: u32,
    pub lnb: Voltage,
    pub tick: Duration,
    pub tune_timeout_ticks: u32,
    pub read_timeout_ticks: u32,
    /// `None` records until stopped.
    pub duration: Option<Duration>,
}

impl CaptureConfig {
    pub fn from_options(opts: &RecordingOptions) -> Self {
        Self {
            channel: opts.channel.clone(),
            tsid: opts.tsid,
            lnb: opts.lnb,
            tick: opts.pipeline.tick(),
            tune_timeout_ticks: opts.pipeline.tune_timeout_ticks,
            read_timeout_ticks: opts.pipeline.read_timeout_ticks,
            duration: opts.duration.limit(),
        }
    }
}

#[derive(Debug)]
pub enum CaptureExit {
    DurationElapsed,
    Interrupted,
    /// The writer raised a sink failure.
    SinkAborted,
    /// The writer thread is gone.
    WriterStopped,
    TuneTimeout,
    ReadTimeout,
    TunerFailed(TunerError),
    EventLoop(io::Error),
}

impl CaptureExit {
    pub fn status(&self) -> ExitStatus {
        match self {
            CaptureExit::DurationElapsed | CaptureExit::Interrupted | CaptureExit::WriterStopped => {
                ExitStatus::Success
            }
            CaptureExit::SinkAborted => ExitStatus::SinkFailed,
            CaptureExit::TuneTimeout => ExitStatus::TuneTimeout,
            CaptureExit::ReadTimeout => ExitStatus::ReadTimeout,
            CaptureExit::TunerFailed(e) => e.exit_status(),
            CaptureExit::EventLoop(_) => ExitStatus::Internal,
        }
    }
}

#[derive(Debug)]
pub struct CaptureReport {
    pub exit: CaptureExit,
    pub elapsed: Duration,
    /// From loop start to the first successful read.
    pub tuning: Option<Duration>,
}

/// Counters only the loop itself looks at.
#[derive(Debug, Default)]
struct Liveness {
    unlocked_ticks: u32,
    stalled_ticks: u32,
    last_read: u64,
}

struct Sources {
    epoll: Epoll,
    timer: TimerFd,
}

fn event_loop_err(e: Errno) -> CaptureExit {
    CaptureExit::EventLoop(io::Error::from(e))
}

pub struct CaptureLoop<B: DvbBackend> {
    tuner: TunerSession<B>,
    queue: Arc<BoundedQueue>,
    stats: Arc<PipelineStats>,
    termination: Arc<Termination>,
    writer_alive: Arc<AtomicBool>,
    config: CaptureConfig,
    first_read: Option<Instant>,
}

impl<B: DvbBackend> CaptureLoop<B> {
    pub fn new(
        tuner: TunerSession<B>,
        queue: Arc<BoundedQueue>,
        stats: Arc<PipelineStats>,
        termination: Arc<Termination>,
        writer_alive: Arc<AtomicBool>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            tuner,
            queue,
            stats,
            termination,
            writer_alive,
            config,
            first_read: None,
        }
    }

    pub fn run(mut self) -> CaptureReport {
        let started = Instant::now();
        let exit = match self.setup() {
            Ok(sources) => {
                let exit = self.event_loop(&sources, started);
                drop(sources);
                exit
            }
            Err(exit) => exit,
        };
        let elapsed = started.elapsed();

        self.send_end();
        self.tuner.teardown();

        info!("[Capture] Stopped: {:?}", exit);
        CaptureReport {
            exit,
            elapsed,
            tuning: self.first_read.map(|t| t.duration_since(started)),
        }
    }

    fn setup(&mut self) -> Result<Sources, CaptureExit> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(event_loop_err)?;
        epoll
            .add(
                self.termination.waker_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL),
            )
            .map_err(event_loop_err)?;

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(event_loop_err)?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(self.config.tick)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(event_loop_err)?;
        epoll
            .add(&timer, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_TIMER))
            .map_err(event_loop_err)?;

        self.tuner.open().map_err(CaptureExit::TunerFailed)?;
        self.tuner
            .configure(&self.config.channel, self.config.tsid, self.config.lnb)
            .map_err(CaptureExit::TunerFailed)?;
        self.tuner.commit().map_err(CaptureExit::TunerFailed)?;

        let fe = self.tuner.frontend().ok_or_else(|| {
            CaptureExit::EventLoop(io::Error::new(io::ErrorKind::NotFound, "frontend not open"))
        })?;
        epoll
            .add(
                fe,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, TOKEN_FRONTEND),
            )
            .map_err(event_loop_err)?;

        Ok(Sources { epoll, timer })
    }

    fn event_loop(&mut self, sources: &Sources, started: Instant) -> CaptureExit {
        let mut events = [EpollEvent::empty(); 8];
        let mut liveness = Liveness::default();

        loop {
            if self.termination.is_requested() {
                return self.stop_exit();
            }
            if !self.writer_alive.load(Ordering::SeqCst) {
                warn!("[Capture] Writer thread has stopped");
                return CaptureExit::WriterStopped;
            }

            let n = match sources.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return event_loop_err(e),
            };

            if let Some(limit) = self.config.duration {
                if started.elapsed() >= limit {
                    info!("[Capture] Recording duration reached");
                    return CaptureExit::DurationElapsed;
                }
            }

            for event in &events[..n] {
                match event.data() {
                    TOKEN_SIGNAL => {
                        self.termination.drain_wakeup();
                        return self.stop_exit();
                    }
                    TOKEN_TIMER => {
                        // Expiration count is irrelevant; one tick per wakeup.
                        let _ = sources.timer.wait();
                        if let Some(exit) = self.on_tick(&mut liveness) {
                            return exit;
                        }
                    }
                    TOKEN_FRONTEND => {
                        if let Err(exit) = self.on_frontend(&sources.epoll) {
                            return exit;
                        }
                    }
                    TOKEN_STREAM => {
                        if event.events().contains(EpollFlags::EPOLLIN) {
                            self.on_stream();
                        }
                    }
                    other => debug!("[Capture] Unknown event token {}", other),
                }
            }
        }
    }

    fn stop_exit(&self) -> CaptureExit {
        match self.termination.cause() {
            Some(StopCause::SinkFailed) => CaptureExit::SinkAborted,
            _ => CaptureExit::Interrupted,
        }
    }

    fn on_tick(&mut self, liveness: &mut Liveness) -> Option<CaptureExit> {
        if !self.tuner.is_locked() {
            liveness.unlocked_ticks += 1;
            if liveness.unlocked_ticks >= self.config.tune_timeout_ticks {
                error!("[Capture] Tune timeout");
                return Some(CaptureExit::TuneTimeout);
            }
            debug!("[Capture] Waiting for lock ({})", liveness.unlocked_ticks);
            return None;
        }

        let snapshot = self.stats.snapshot();
        let quality = self
            .tuner
            .read_signal_quality()
            .map_or_else(|| "SNR: n/a".to_string(), |q| q.to_string());
        info!(
            "[Capture] {}, Read {} bytes, Write {} bytes, Overrun {} bytes",
            quality, snapshot.read, snapshot.written, snapshot.dropped
        );

        if snapshot.read == liveness.last_read {
            liveness.stalled_ticks += 1;
            if liveness.stalled_ticks >= self.config.read_timeout_ticks {
                error!("[Capture] Read timeout");
                return Some(CaptureExit::ReadTimeout);
            }
        } else {
            liveness.stalled_ticks = 0;
            liveness.last_read = snapshot.read;
        }
        None
    }

    fn on_frontend(&mut self, epoll: &Epoll) -> Result<(), CaptureExit> {
        if self.tuner.is_locked() {
            return Ok(());
        }
        if !self.tuner.poll_lock().map_err(CaptureExit::TunerFailed)? {
            return Ok(());
        }

        self.tuner.start_filter().map_err(CaptureExit::TunerFailed)?;
        if let Some(fe) = self.tuner.frontend() {
            epoll.delete(fe).map_err(event_loop_err)?;
        }
        let dvr = self.tuner.stream().ok_or_else(|| {
            CaptureExit::EventLoop(io::Error::new(io::ErrorKind::NotFound, "dvr not open"))
        })?;
        epoll
            .add(dvr, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_STREAM))
            .map_err(event_loop_err)?;
        debug!("[Capture] Streaming started");
        Ok(())
    }

    fn on_stream(&mut self) {
        let mut frame = Frame::new();
        match self.tuner.read_frame(&mut frame) {
            Ok(0) => {}
            Ok(n) => {
                if self.first_read.is_none() {
                    self.first_read = Some(Instant::now());
                }
                self.stats.add_read(n);
                if let Err(rejected) = self.queue.push(QueueItem::Frame(frame)) {
                    self.stats.add_dropped(n);
                    debug!("[Capture] Overrun, dropped {} bytes: {}", n, rejected.reason);
                }
            }
            Err(e) => warn!("[Capture] DVR read failed: {}", e),
        }
    }

    /// Push the sentinel, giving up once the writer is gone.
    fn send_end(&self) {
        let mut item = QueueItem::End;
        loop {
            match self.queue.push(item) {
                Ok(()) => return,
                Err(rejected) => {
                    if !self.writer_alive.load(Ordering::SeqCst) {
                        debug!("[Capture] Writer gone, end of stream not delivered");
                        return;
                    }
                    item = rejected.item;
                }
            }
        }
    }
}
