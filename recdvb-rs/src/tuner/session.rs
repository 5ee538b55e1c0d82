use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::Arc;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::{
    Adapter, DeviceNode, DvbBackend, FrontendInfo, FrontendKind, FrontendStatus, LockPolicy,
    SignalQuality, TuneRequest, TunerError, Voltage,
};
use crate::channels::Channel;
use crate::queue::Frame;

/// Consecutive `EOVERFLOW`s tolerated while waiting for lock.
const MAX_OVERFLOW_RETRIES: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    Closed,
    Opened,
    PropertiesSet,
    Polling,
    Locked,
    FilterActive,
    Streaming,
    Failed,
}

fn is_overflow(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EOVERFLOW as i32)
}

/// One tuning of an [`Adapter`]. Owns the frontend, demux and DVR handles.
pub struct TunerSession<B: DvbBackend> {
    adapter: Arc<Adapter<B>>,
    state: TunerState,
    info: Option<FrontendInfo>,
    request: Option<TuneRequest>,
    frontend: Option<File>,
    demux: Option<File>,
    dvr: Option<File>,
    holds_lnb: bool,
    /// Set when this session was the adapter's first LNB holder.
    programs_lnb: bool,
}

impl<B: DvbBackend> TunerSession<B> {
    pub fn new(adapter: Arc<Adapter<B>>) -> Self {
        Self {
            adapter,
            state: TunerState::Closed,
            info: None,
            request: None,
            frontend: None,
            demux: None,
            dvr: None,
            holds_lnb: false,
            programs_lnb: false,
        }
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self.state,
            TunerState::Locked | TunerState::FilterActive | TunerState::Streaming
        )
    }

    pub fn info(&self) -> Option<&FrontendInfo> {
        self.info.as_ref()
    }

    pub fn request(&self) -> Option<&TuneRequest> {
        self.request.as_ref()
    }

    /// Frontend handle, for lock-readiness registration.
    pub fn frontend(&self) -> Option<&File> {
        self.frontend.as_ref()
    }

    /// DVR handle, for read-readiness registration.
    pub fn stream(&self) -> Option<&File> {
        self.dvr.as_ref()
    }

    fn fail(&mut self, err: TunerError) -> TunerError {
        warn!("[Tuner] adapter{}: {}", self.adapter.index(), err);
        self.state = TunerState::Failed;
        err
    }

    fn open_node(&self, node: DeviceNode) -> Result<File, TunerError> {
        self.adapter.backend().open(node).map_err(|source| TunerError::Open {
            adapter: self.adapter.index(),
            node,
            source,
        })
    }

    /// Open the frontend and read its capabilities. A second call is a no-op.
    pub fn open(&mut self) -> Result<&FrontendInfo, TunerError> {
        if self.frontend.is_none() {
            let fe = self.open_node(DeviceNode::Frontend).map_err(|e| self.fail(e))?;
            let info = match self.adapter.backend().frontend_info(&fe) {
                Ok(info) => info,
                Err(source) => {
                    return Err(self.fail(TunerError::Ioctl {
                        op: "FE_GET_INFO",
                        source,
                    }))
                }
            };
            if info.kind().is_none() {
                return Err(self.fail(TunerError::Unsupported {
                    name: info.name,
                    fe_type: info.fe_type,
                }));
            }

            info!("[Tuner] Using DVB card \"{}\"", info.name);
            self.frontend = Some(fe);
            self.info = Some(info);
            self.state = TunerState::Opened;
        }
        self.info.as_ref().ok_or(TunerError::InvalidState {
            op: "open",
            state: self.state,
        })
    }

    fn kind(&self) -> Option<FrontendKind> {
        self.info.as_ref().and_then(FrontendInfo::kind)
    }

    /// Translate `channel` into the property set for the next commit.
    pub fn configure(
        &mut self,
        channel: &Channel,
        tsid: u32,
        lnb: Voltage,
    ) -> Result<&TuneRequest, TunerError> {
        let Some(kind) = self.kind().filter(|_| self.state == TunerState::Opened) else {
            return Err(TunerError::InvalidState {
                op: "configure",
                state: self.state,
            });
        };
        let satellite = channel.band.is_satellite();
        if satellite != (kind == FrontendKind::Satellite) {
            return Err(TunerError::BandMismatch {
                channel: channel.to_string(),
                kind,
            });
        }

        let wants_lnb = satellite && lnb != Voltage::Off;
        if wants_lnb && !self.holds_lnb {
            self.holds_lnb = true;
            self.programs_lnb = self.adapter.acquire_lnb();
        }
        let voltage = (wants_lnb && self.programs_lnb).then_some(lnb);

        let request = TuneRequest {
            frequency: channel.frequency(),
            stream_id: tsid,
            voltage,
        };
        info!(
            "[Tuner] Channel {} frequency {}{} tsid 0x{:x}",
            channel,
            request.frequency,
            if satellite { "kHz" } else { "Hz" },
            tsid
        );
        Ok(self.request.insert(request))
    }

    /// Submit the configured properties. Does not wait for lock.
    pub fn commit(&mut self) -> Result<(), TunerError> {
        let (Some(fe), Some(request), TunerState::Opened) = (&self.frontend, &self.request, self.state)
        else {
            return Err(TunerError::InvalidState {
                op: "commit",
                state: self.state,
            });
        };
        if let Err(source) = self.adapter.backend().set_properties(fe, request) {
            return Err(self.fail(TunerError::Ioctl {
                op: "FE_SET_PROPERTY",
                source,
            }));
        }
        self.state = TunerState::PropertiesSet;
        Ok(())
    }

    /// Consume one pending frontend event. Returns true once locked.
    pub fn poll_lock(&mut self) -> Result<bool, TunerError> {
        if self.is_locked() {
            return Ok(true);
        }
        let fe = match (&self.frontend, self.state) {
            (Some(fe), TunerState::PropertiesSet | TunerState::Polling) => fe,
            _ => {
                return Err(TunerError::InvalidState {
                    op: "poll_lock",
                    state: self.state,
                })
            }
        };
        self.state = TunerState::Polling;

        let backend = self.adapter.backend();
        let status = match backend.read_event(fe) {
            Ok(status) => status,
            Err(e) if is_overflow(&e) => {
                debug!("[Tuner] Event queue overflowed, reading status instead");
                backend.read_status(fe).map_err(|source| TunerError::Ioctl {
                    op: "FE_READ_STATUS",
                    source,
                })?
            }
            Err(source) => {
                return Err(TunerError::Ioctl {
                    op: "FE_GET_EVENT",
                    source,
                })
            }
        };

        if status.has_lock() {
            info!("[Tuner] Successfully tuned (status 0x{:02x})", status.0);
            self.state = TunerState::Locked;
        }
        Ok(self.is_locked())
    }

    /// Commit and block until the frontend reports lock or the policy runs out.
    pub fn commit_and_wait_lock(&mut self, policy: LockPolicy) -> Result<(), TunerError> {
        self.commit()?;
        self.state = TunerState::Polling;

        let mut attempts = 0;
        let mut overflows = 0;
        while attempts < policy.attempts {
            let readable = match self.wait_frontend(policy) {
                Ok(readable) => readable,
                Err(source) => return Err(self.fail(TunerError::Ioctl { op: "poll", source })),
            };
            if !readable {
                attempts += 1;
                debug!("[Tuner] No frontend event ({}/{})", attempts, policy.attempts);
                continue;
            }

            let Some(fe) = self.frontend.as_ref() else { break };
            match self.adapter.backend().read_event(fe) {
                Ok(status) if status.has_lock() => {
                    info!("[Tuner] Successfully tuned (status 0x{:02x})", status.0);
                    self.state = TunerState::Locked;
                    return Ok(());
                }
                Ok(status) if status.timed_out() => {
                    debug!("[Tuner] Frontend reported timeout");
                    break;
                }
                Ok(_) => attempts += 1,
                Err(e) if is_overflow(&e) && overflows < MAX_OVERFLOW_RETRIES => {
                    overflows += 1;
                    debug!("[Tuner] FE_GET_EVENT overflow, retrying");
                }
                Err(source) => {
                    return Err(self.fail(TunerError::Ioctl {
                        op: "FE_GET_EVENT",
                        source,
                    }))
                }
            }
        }

        Err(self.fail(TunerError::LockTimeout { attempts }))
    }

    fn wait_frontend(&self, policy: LockPolicy) -> io::Result<bool> {
        let Some(fe) = self.frontend.as_ref() else {
            return Ok(false);
        };
        let millis = u16::try_from(policy.interval.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fe.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, millis) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    return Ok(fds[0]
                        .revents()
                        .map_or(false, |r| r.contains(PollFlags::POLLIN)))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Install the pass-all PID filter and open the DVR for reading.
    ///
    /// On failure only the handles opened by this call are closed.
    pub fn start_filter(&mut self) -> Result<(), TunerError> {
        if self.state != TunerState::Locked {
            return Err(TunerError::InvalidState {
                op: "start_filter",
                state: self.state,
            });
        }

        let opened_demux = self.demux.is_none();
        let demux = match self.demux.take() {
            Some(demux) => demux,
            None => self.open_node(DeviceNode::Demux).map_err(|e| self.fail(e))?,
        };
        let backend = self.adapter.backend();
        if let Err(source) = backend.set_pass_all_filter(&demux) {
            if !opened_demux {
                self.demux = Some(demux);
            }
            return Err(self.fail(TunerError::Ioctl {
                op: "DMX_SET_PES_FILTER",
                source,
            }));
        }

        if self.dvr.is_none() {
            match self.open_node(DeviceNode::Dvr) {
                Ok(dvr) => self.dvr = Some(dvr),
                Err(e) => {
                    if opened_demux {
                        let _ = backend.stop_filter(&demux);
                    } else {
                        self.demux = Some(demux);
                    }
                    return Err(self.fail(e));
                }
            }
        }

        self.demux = Some(demux);
        self.state = TunerState::FilterActive;
        debug!("[Tuner] Demux filter active");
        Ok(())
    }

    /// One read from the DVR into `frame`. `Ok(0)` means nothing was available.
    pub fn read_frame(&mut self, frame: &mut Frame) -> io::Result<usize> {
        let Some(mut dvr) = self.dvr.as_ref() else {
            return Ok(0);
        };
        let n = match dvr.read(frame.buffer_mut()) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(e) => return Err(e),
        };
        frame.set_len(n);
        if n > 0 && self.state == TunerState::FilterActive {
            self.state = TunerState::Streaming;
        }
        Ok(n)
    }

    /// Best effort; failures are logged and yield `None`.
    pub fn read_signal_quality(&self) -> Option<SignalQuality> {
        let fe = self.frontend.as_ref()?;
        match self.adapter.backend().read_snr(fe) {
            Ok(snr) => Some(SignalQuality { snr }),
            Err(e) => {
                warn!("[Tuner] FE_READ_SNR failed: {}", e);
                None
            }
        }
    }

    /// Release everything in reverse order of acquisition. Safe to repeat.
    pub fn teardown(&mut self) {
        if self.holds_lnb {
            self.holds_lnb = false;
            self.programs_lnb = false;
            if self.adapter.release_lnb() {
                if let Some(fe) = &self.frontend {
                    match self.adapter.backend().set_voltage(fe, Voltage::Off) {
                        Ok(()) => debug!("[Tuner] LNB off"),
                        Err(e) => warn!("[Tuner] Failed to switch LNB off: {}", e),
                    }
                }
            }
        }
        drop(self.dvr.take());
        if let Some(demux) = self.demux.take() {
            if let Err(e) = self.adapter.backend().stop_filter(&demux) {
                debug!("[Tuner] DMX_STOP failed: {}", e);
            }
        }
        if self.frontend.take().is_some() {
            debug!("[Tuner] adapter{} closed", self.adapter.index());
        }
        self.request = None;
        self.state = TunerState::Closed;
    }
}

impl<B: DvbBackend> Drop for TunerSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::tuner::mock::MockDvb;

    fn fast_lock() -> LockPolicy {
        LockPolicy {
            attempts: 3,
            interval: Duration::from_millis(50),
        }
    }

    fn opened(mock: &MockDvb) -> TunerSession<MockDvb> {
        let mut session = TunerSession::new(Adapter::new(0, mock.clone()));
        session.open().unwrap();
        session
    }

    #[test]
    fn test_open_is_idempotent() {
        let mock = MockDvb::terrestrial();
        let mut session = TunerSession::new(Adapter::new(0, mock.clone()));
        session.open().unwrap();
        session.open().unwrap();

        assert_eq!(mock.open_count(DeviceNode::Frontend), 1);
        assert_eq!(session.state(), TunerState::Opened);
    }

    #[test]
    fn test_open_rejects_unknown_frontend() {
        let mock = MockDvb::with_fe_type(3);
        let mut session = TunerSession::new(Adapter::new(0, mock));
        let err = session.open().unwrap_err();

        assert!(matches!(err, TunerError::Unsupported { fe_type: 3, .. }));
        assert_eq!(session.state(), TunerState::Failed);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let mock = MockDvb::terrestrial();
        mock.fail_open(DeviceNode::Frontend);
        let mut session = TunerSession::new(Adapter::new(2, mock));

        let err = session.open().unwrap_err();
        assert!(matches!(
            err,
            TunerError::Open {
                adapter: 2,
                node: DeviceNode::Frontend,
                ..
            }
        ));
    }

    #[test]
    fn test_configure_checks_band() {
        let mock = MockDvb::terrestrial();
        let mut session = opened(&mock);
        let err = session
            .configure(&"bs01_0".parse().unwrap(), 0x4010, Voltage::_15v)
            .unwrap_err();
        assert!(matches!(err, TunerError::BandMismatch { .. }));
        assert_eq!(err.exit_status(), crate::error::ExitStatus::ConfigError);

        let request = *session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();
        assert_eq!(request.frequency, 557_143_000);
        assert_eq!(request.voltage, None);
    }

    #[test]
    fn test_commit_and_wait_lock() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let mut session = opened(&mock);
        session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();
        session.commit_and_wait_lock(fast_lock()).unwrap();

        assert_eq!(session.state(), TunerState::Locked);
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_lock_wait_ignores_overflow() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        mock.queue_overflows(5);
        let mut session = opened(&mock);
        session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();

        // 5 overflows with only 3 attempts: overflows must not consume attempts.
        session.commit_and_wait_lock(fast_lock()).unwrap();
        assert!(session.is_locked());
    }

    #[test]
    fn test_lock_timeout_is_bounded() {
        let mock = MockDvb::terrestrial();
        let mut session = opened(&mock);
        session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();

        let started = Instant::now();
        let err = session.commit_and_wait_lock(fast_lock()).unwrap_err();
        assert!(matches!(err, TunerError::LockTimeout { attempts: 3 }));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), TunerState::Failed);
    }

    #[test]
    fn test_start_filter_rolls_back_demux() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        mock.fail_open(DeviceNode::Dvr);
        let mut session = opened(&mock);
        session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();
        session.commit_and_wait_lock(fast_lock()).unwrap();

        assert!(matches!(
            session.start_filter(),
            Err(TunerError::Open {
                node: DeviceNode::Dvr,
                ..
            })
        ));
        assert_eq!(mock.filter_stops(), 1);
        assert!(session.stream().is_none());
        assert_eq!(session.state(), TunerState::Failed);
    }

    #[test]
    fn test_start_filter_and_read() {
        let mock = MockDvb::terrestrial();
        mock.lock_on_tune(true);
        let mut session = opened(&mock);
        session.configure(&"27".parse().unwrap(), 0, Voltage::Off).unwrap();
        session.commit_and_wait_lock(fast_lock()).unwrap();
        session.start_filter().unwrap();
        assert_eq!(session.state(), TunerState::FilterActive);

        assert!(mock.feed(&[0x47; 376]));
        let mut frame = Frame::new();
        assert_eq!(session.read_frame(&mut frame).unwrap(), 376);
        assert_eq!(frame.len(), 376);
        assert_eq!(session.state(), TunerState::Streaming);
    }

    #[test]
    fn test_teardown_twice() {
        let mock = MockDvb::satellite();
        mock.lock_on_tune(true);
        let mut session = opened(&mock);
        session.configure(&"bs01_0".parse().unwrap(), 0x4010, Voltage::_15v).unwrap();
        session.commit_and_wait_lock(fast_lock()).unwrap();
        session.start_filter().unwrap();

        session.teardown();
        let voltages_after_first = mock.voltages();
        session.teardown();

        assert_eq!(voltages_after_first, vec![Voltage::Off]);
        assert_eq!(mock.voltages(), voltages_after_first);
        assert_eq!(session.state(), TunerState::Closed);
        assert!(session.frontend().is_none());
        assert!(session.stream().is_none());
    }

    #[test]
    fn test_lnb_shared_between_sessions() {
        let mock = MockDvb::satellite();
        let adapter = Adapter::new(0, mock.clone());
        let channel: Channel = "bs03_1".parse().unwrap();

        let mut first = TunerSession::new(adapter.clone());
        first.open().unwrap();
        let req = *first.configure(&channel, 0x4031, Voltage::_15v).unwrap();
        assert_eq!(req.voltage, Some(Voltage::_15v));

        let mut second = TunerSession::new(adapter.clone());
        second.open().unwrap();
        let req = *second.configure(&channel, 0x4031, Voltage::_15v).unwrap();
        assert_eq!(req.voltage, None);
        assert_eq!(adapter.lnb_holders(), 2);

        first.teardown();
        assert!(mock.voltages().is_empty());
        second.teardown();
        assert_eq!(mock.voltages(), vec![Voltage::Off]);
        assert_eq!(adapter.lnb_holders(), 0);
    }

    #[test]
    fn test_reconfigure_keeps_lnb_voltage() {
        let mock = MockDvb::satellite();
        let adapter = Adapter::new(0, mock);
        let mut session = TunerSession::new(adapter.clone());
        session.open().unwrap();

        let first: Channel = "bs03_1".parse().unwrap();
        let second: Channel = "bs15_0".parse().unwrap();
        session.configure(&first, 0x4031, Voltage::_15v).unwrap();
        let req = *session.configure(&second, 0x40f1, Voltage::_15v).unwrap();

        assert_eq!(req.voltage, Some(Voltage::_15v));
        assert_eq!(req.stream_id, 0x40f1);
        assert_eq!(adapter.lnb_holders(), 1);
    }

    #[test]
    fn test_operations_out_of_order() {
        let mock = MockDvb::terrestrial();
        let mut session = TunerSession::new(Adapter::new(0, mock));
        assert!(matches!(
            session.commit(),
            Err(TunerError::InvalidState { op: "commit", .. })
        ));
        assert!(matches!(
            session.start_filter(),
            Err(TunerError::InvalidState { .. })
        ));
        assert!(session.read_signal_quality().is_none());
    }
}
