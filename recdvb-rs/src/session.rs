//! Session controller: opens the device, runs the capture loop and the sink
//! writer on their own threads, and folds both results into one status.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use thiserror::Error;

use crate::capture::{CaptureConfig, CaptureLoop};
use crate::config::RecordingOptions;
use crate::error::ExitStatus;
use crate::queue::BoundedQueue;
use crate::stages::Stages;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::termination::{StopCause, Termination};
use crate::tuner::{Adapter, DvbBackend, TunerError, TunerSession};
use crate::writer::SinkWriter;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open tuner: {0}")]
    Tuner(#[from] TunerError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            SetupError::Tuner(e) => e.exit_status(),
            SetupError::Spawn { .. } => ExitStatus::Internal,
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub status: ExitStatus,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    pub tuning: Option<Duration>,
}

pub struct Session;

impl Session {
    /// Record one session to `sink`. Blocks until both threads are done.
    ///
    /// Only failures before the pipeline starts are returned as errors;
    /// everything after that is folded into the report's status.
    pub fn run<B, W>(
        opts: &RecordingOptions,
        adapter: Arc<Adapter<B>>,
        termination: Arc<Termination>,
        sink: W,
        chunk_size: usize,
        stages: Stages,
    ) -> Result<SessionReport, SetupError>
    where
        B: DvbBackend + 'static,
        W: Write + Send + 'static,
    {
        let mut tuner = TunerSession::new(adapter);
        tuner.open()?;

        let queue = Arc::new(
            BoundedQueue::new(opts.pipeline.queue_capacity.max(1), opts.pipeline.retry_policy())
                .with_termination(termination.clone()),
        );
        let stats = Arc::new(PipelineStats::new());

        let writer = SinkWriter::new(
            queue.clone(),
            stats.clone(),
            termination.clone(),
            sink,
            chunk_size,
        )
        .with_stages(stages)
        .with_filter_grace(opts.pipeline.filter_grace());
        let writer_alive = writer.alive_flag();

        let capture = CaptureLoop::new(
            tuner,
            queue.clone(),
            stats.clone(),
            termination.clone(),
            writer_alive,
            CaptureConfig::from_options(opts),
        );

        let writer_handle = thread::Builder::new()
            .name("writer".into())
            .spawn(move || writer.run())
            .map_err(|source| SetupError::Spawn {
                name: "writer",
                source,
            })?;
        let capture_handle = match thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                // Unblock the writer before bailing out.
                termination.request(StopCause::Interrupted);
                let _ = writer_handle.join();
                return Err(SetupError::Spawn {
                    name: "capture",
                    source,
                });
            }
        };

        let (capture_status, elapsed, tuning) = match capture_handle.join() {
            Ok(report) => (report.exit.status(), report.elapsed, report.tuning),
            Err(_) => {
                error!("[Session] Capture thread panicked");
                (ExitStatus::Internal, Duration::ZERO, None)
            }
        };
        let writer_status = match writer_handle.join() {
            Ok(exit) => exit.status(),
            Err(_) => {
                error!("[Session] Writer thread panicked");
                ExitStatus::Internal
            }
        };

        // Frames the writer never picked up, e.g. pushed after it was cancelled.
        let leftover = queue.drain();
        if leftover > 0 {
            debug!("[Session] {} queued bytes were never written", leftover);
            stats.add_dropped(leftover);
        }

        let stats = stats.snapshot();
        info!(
            "[Session] Read {} bytes, Write {} bytes, Overrun {} bytes",
            stats.read, stats.written, stats.dropped
        );
        match tuning {
            Some(tuning) => info!(
                "[Session] Elapsed time {:.2}sec (Tuning {:.2}sec)",
                elapsed.as_secs_f64(),
                tuning.as_secs_f64()
            ),
            None => info!("[Session] Elapsed time {:.2}sec", elapsed.as_secs_f64()),
        }

        Ok(SessionReport {
            status: capture_status.worse(writer_status),
            stats,
            elapsed,
            tuning,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::{PipelineConfig, RecDuration};
    use crate::sink::memory::MemorySink;
    use crate::stages::{Decoder, StageError};
    use crate::tuner::mock::MockDvb;
    use crate::tuner::{DeviceNode, Voltage};

    const FRAME: usize = 188 * 10;

    fn options(duration: RecDuration) -> RecordingOptions {
        RecordingOptions {
            channel: "27".parse().unwrap(),
            duration,
            adapter: 0,
            lnb: Voltage::Off,
            tsid: 0,
            decode: false,
            strip_null: false,
            services: None,
            pipeline: PipelineConfig::default(),
        }
    }

    fn secs(s: u64) -> RecDuration {
        RecDuration::Finite(Duration::from_secs(s))
    }

    /// One frame per `period` for `total`; returns how many reached the DVR.
    fn produce(mock: &MockDvb, period: Duration, total: Duration) -> thread::JoinHandle<usize> {
        let mock = mock.clone();
        thread::spawn(move || {
            let end = Instant::now() + total;
            let mut fed = 0;
            while Instant::now() < end {
                if mock.feed(&[0x47; FRAME]) {
                    fed += 1;
                }
                thread::sleep(period);
            }
            fed
        })
    }

    #[test]
    fn test_normal_stop() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let sink = MemorySink::new();
        let producer = produce(&mock, Duration::from_millis(100), Duration::from_secs(6));

        let report = Session::run(
            &options(secs(5)),
            Adapter::new(0, mock.clone()),
            Termination::new().unwrap(),
            sink.clone(),
            crate::sink::WRITE_SIZE,
            Stages::none(),
        )
        .unwrap();
        producer.join().unwrap();

        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.elapsed >= Duration::from_secs(5));
        let frames = sink.len() / FRAME;
        assert!((40..=55).contains(&frames), "{} frames", frames);
        assert_eq!(report.stats.written, sink.len() as u64);
        assert_eq!(report.stats.dropped, 0);
        assert_eq!(mock.open_count(DeviceNode::Frontend), 1);
    }

    #[test]
    fn test_tune_timeout() {
        let mock = MockDvb::terrestrial();
        let sink = MemorySink::new();
        let mut opts = options(RecDuration::Indefinite);
        opts.pipeline.tick_ms = 100;

        let started = Instant::now();
        let report = Session::run(
            &opts,
            Adapter::new(0, mock),
            Termination::new().unwrap(),
            sink.clone(),
            crate::sink::WRITE_SIZE,
            Stages::none(),
        )
        .unwrap();

        assert_eq!(report.status, ExitStatus::TuneTimeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sink.len(), 0);
        assert_eq!(report.stats.read, 0);
    }

    #[test]
    fn test_overrun_is_counted() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let sink = MemorySink::new();
        sink.stall();

        let mut opts = options(secs(1));
        opts.pipeline.queue_capacity = 4;
        opts.pipeline.queue_wait_ms = 100;
        opts.pipeline.queue_max_waits = 2;
        opts.pipeline.tick_ms = 100;
        opts.pipeline.read_timeout_ticks = 50;

        let producer = produce(&mock, Duration::from_millis(10), Duration::from_millis(1200));
        let resumer = {
            let sink = sink.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(1500));
                sink.resume();
            })
        };

        let report = Session::run(
            &opts,
            Adapter::new(0, mock),
            Termination::new().unwrap(),
            sink.clone(),
            crate::sink::WRITE_SIZE,
            Stages::none(),
        )
        .unwrap();
        producer.join().unwrap();
        resumer.join().unwrap();

        let stats = report.stats;
        assert!(stats.dropped > 0);
        assert_eq!(stats.read, stats.written + stats.dropped);
        assert_eq!(stats.written, sink.len() as u64);
    }

    /// Appends a trailer when the stream ends.
    struct Trailer;

    impl Decoder for Trailer {
        fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, StageError> {
            Ok(input.to_vec())
        }

        fn finish(&mut self) -> Result<Vec<u8>, StageError> {
            Ok(b"TRAILER".to_vec())
        }
    }

    #[test]
    fn test_signal_mid_stream() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let sink = MemorySink::new();
        let termination = Termination::new().unwrap();
        let producer = produce(&mock, Duration::from_millis(50), Duration::from_millis(2500));
        let stopper = {
            let termination = termination.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(2));
                termination.request(StopCause::Interrupted);
            })
        };

        let report = Session::run(
            &options(secs(10)),
            Adapter::new(0, mock),
            termination,
            sink.clone(),
            crate::sink::WRITE_SIZE,
            Stages {
                decoder: Some(Box::new(Trailer)),
                filter: None,
            },
        )
        .unwrap();
        stopper.join().unwrap();
        producer.join().unwrap();

        assert_eq!(report.status, ExitStatus::Success);
        assert!(report.elapsed >= Duration::from_millis(1900));
        assert!(report.elapsed < Duration::from_secs(3));
        assert!(sink.contents().ends_with(b"TRAILER"));
    }

    #[test]
    fn test_sink_failure_ends_session() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let sink = MemorySink::new().failing_after(FRAME);
        let producer = produce(&mock, Duration::from_millis(20), Duration::from_millis(800));

        let report = Session::run(
            &options(secs(10)),
            Adapter::new(0, mock),
            Termination::new().unwrap(),
            sink,
            crate::sink::WRITE_SIZE,
            Stages::none(),
        )
        .unwrap();
        producer.join().unwrap();

        assert_eq!(report.status, ExitStatus::SinkFailed);
        assert!(report.elapsed < Duration::from_secs(5));
        // Frames still queued when the writer gave up are not lost from the books.
        let stats = report.stats;
        assert!(stats.written >= FRAME as u64);
        assert_eq!(stats.read, stats.written + stats.dropped);
    }

    #[test]
    fn test_open_failure_is_setup_error() {
        let mock = MockDvb::terrestrial();
        mock.fail_open(DeviceNode::Frontend);
        let err = Session::run(
            &options(secs(1)),
            Adapter::new(0, mock),
            Termination::new().unwrap(),
            MemorySink::new(),
            crate::sink::WRITE_SIZE,
            Stages::none(),
        )
        .unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::DeviceError);
    }

    #[test]
    fn test_stages_from_options() {
        let mut opts = options(secs(1));
        assert!(Stages::from_options(&opts).decoder.is_none());
        opts.strip_null = true;
        opts.services = Some(vec![101]);
        let stages = Stages::from_options(&opts);
        assert!(stages.decoder.is_some());
        assert!(stages.filter.is_some());
    }
}
