//! Pipe-backed stand-in for a DVB adapter.
//!
//! The frontend and DVR nodes are the read ends of pipes, so they can be
//! polled and registered with epoll exactly like the real character devices.
//! Tests drive lock events and stream data through the write ends.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;

use super::{DeviceNode, DvbBackend, FrontendInfo, FrontendStatus, TuneRequest, Voltage};

#[derive(Default)]
struct MockState {
    fe_type: u32,
    locked: AtomicBool,
    lock_on_tune: AtomicBool,
    pending_events: AtomicU32,
    overflows: AtomicU32,
    filter_stops: AtomicU32,
    fail_open: Mutex<Vec<DeviceNode>>,
    opened: Mutex<Vec<DeviceNode>>,
    requests: Mutex<Vec<TuneRequest>>,
    voltages: Mutex<Vec<Voltage>>,
    fe_tx: Mutex<Option<File>>,
    dvr_tx: Mutex<Option<File>>,
}

#[derive(Clone)]
pub(crate) struct MockDvb {
    state: Arc<MockState>,
}

fn pipe_pair() -> io::Result<(File, File)> {
    let (rx, tx) = nix::unistd::pipe().map_err(io::Error::from)?;
    Ok((File::from(rx), File::from(tx)))
}

impl MockDvb {
    pub(crate) fn with_fe_type(fe_type: u32) -> Self {
        Self {
            state: Arc::new(MockState {
                fe_type,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn terrestrial() -> Self {
        Self::with_fe_type(2)
    }

    pub(crate) fn satellite() -> Self {
        Self::with_fe_type(0)
    }

    /// Report lock as soon as properties are submitted.
    pub(crate) fn lock_on_tune(&self, enabled: bool) {
        self.state.lock_on_tune.store(enabled, Ordering::SeqCst);
    }

    /// The next `n` event reads fail with `EOVERFLOW` without consuming the event.
    pub(crate) fn queue_overflows(&self, n: u32) {
        self.state.overflows.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_open(&self, node: DeviceNode) {
        self.state.fail_open.lock().push(node);
    }

    /// Flip to locked and make the frontend readable.
    pub(crate) fn signal_lock(&self) {
        self.state.locked.store(true, Ordering::SeqCst);
        self.push_event();
    }

    fn push_event(&self) {
        if let Some(tx) = self.state.fe_tx.lock().as_mut() {
            if tx.write_all(&[1]).is_ok() {
                self.state.pending_events.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Write stream bytes into the DVR pipe. False once the reader is gone.
    pub(crate) fn feed(&self, data: &[u8]) -> bool {
        match self.state.dvr_tx.lock().as_mut() {
            Some(tx) => tx.write_all(data).is_ok(),
            None => false,
        }
    }

    pub(crate) fn open_count(&self, node: DeviceNode) -> usize {
        self.state.opened.lock().iter().filter(|n| **n == node).count()
    }

    pub(crate) fn requests(&self) -> Vec<TuneRequest> {
        self.state.requests.lock().clone()
    }

    pub(crate) fn voltages(&self) -> Vec<Voltage> {
        self.state.voltages.lock().clone()
    }

    pub(crate) fn filter_stops(&self) -> u32 {
        self.state.filter_stops.load(Ordering::SeqCst)
    }

    fn status(&self) -> FrontendStatus {
        if self.state.locked.load(Ordering::SeqCst) {
            FrontendStatus(FrontendStatus::HAS_LOCK | 0x0F)
        } else {
            FrontendStatus(0)
        }
    }
}

impl DvbBackend for MockDvb {
    fn open(&self, node: DeviceNode) -> io::Result<File> {
        if self.state.fail_open.lock().contains(&node) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.state.opened.lock().push(node);
        match node {
            DeviceNode::Frontend => {
                let (rx, tx) = pipe_pair()?;
                *self.state.fe_tx.lock() = Some(tx);
                Ok(rx)
            }
            DeviceNode::Dvr => {
                let (rx, tx) = pipe_pair()?;
                *self.state.dvr_tx.lock() = Some(tx);
                Ok(rx)
            }
            DeviceNode::Demux => File::open("/dev/null"),
        }
    }

    fn frontend_info(&self, _fe: &File) -> io::Result<FrontendInfo> {
        Ok(FrontendInfo {
            name: "Mock ISDB frontend".to_string(),
            fe_type: self.state.fe_type,
        })
    }

    fn set_properties(&self, _fe: &File, request: &TuneRequest) -> io::Result<()> {
        self.state.requests.lock().push(*request);
        if self.state.lock_on_tune.load(Ordering::SeqCst) {
            self.signal_lock();
        }
        Ok(())
    }

    fn set_voltage(&self, _fe: &File, voltage: Voltage) -> io::Result<()> {
        self.state.voltages.lock().push(voltage);
        Ok(())
    }

    fn read_event(&self, mut fe: &File) -> io::Result<FrontendStatus> {
        let overflowed = self
            .state
            .overflows
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if overflowed {
            return Err(io::Error::from_raw_os_error(Errno::EOVERFLOW as i32));
        }
        let consumed = self
            .state
            .pending_events
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            let mut byte = [0u8; 1];
            fe.read_exact(&mut byte)?;
        }
        Ok(self.status())
    }

    fn read_status(&self, _fe: &File) -> io::Result<FrontendStatus> {
        Ok(self.status())
    }

    fn read_snr(&self, _fe: &File) -> io::Result<u16> {
        Ok(0x1234)
    }

    fn set_pass_all_filter(&self, _demux: &File) -> io::Result<()> {
        Ok(())
    }

    fn stop_filter(&self, _demux: &File) -> io::Result<()> {
        self.state.filter_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
