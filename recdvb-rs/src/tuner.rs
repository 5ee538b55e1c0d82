//! Linux DVB frontend/demux control.
//!
//! A physical device is an [`Adapter`]; each recording drives it through a
//! [`TunerSession`]. The kernel interface sits behind [`DvbBackend`] so the
//! session logic can run against [`LinuxDvb`] or an in-memory double.

use std::fmt;
use std::fs::File;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::error::ConfigError;

pub use self::error::TunerError;
pub use self::linux::LinuxDvb;
pub use self::session::{TunerSession, TunerState};

mod error;
mod linux;
#[cfg(test)]
pub(crate) mod mock;
mod session;

/// LNB supply requested by the operator.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Voltage {
    #[default]
    Off,
    _11v,
    _15v,
}

impl Voltage {
    /// `fe_sec_voltage` value for `DTV_VOLTAGE` / `FE_SET_VOLTAGE`.
    pub(crate) fn sec_voltage(self) -> u32 {
        match self {
            Voltage::_11v => 0,
            Voltage::_15v => 1,
            Voltage::Off => 2,
        }
    }
}

impl FromStr for Voltage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(Voltage::Off),
            "11" => Ok(Voltage::_11v),
            "15" => Ok(Voltage::_15v),
            other => Err(ConfigError::InvalidVoltage(other.to_string())),
        }
    }
}

impl fmt::Display for Voltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Voltage::Off => f.write_str("off"),
            Voltage::_11v => f.write_str("11V"),
            Voltage::_15v => f.write_str("15V"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceNode {
    Frontend,
    Demux,
    Dvr,
}

impl fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceNode::Frontend => f.write_str("frontend0"),
            DeviceNode::Demux => f.write_str("demux0"),
            DeviceNode::Dvr => f.write_str("dvr0"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    Terrestrial,
    Satellite,
}

impl fmt::Display for FrontendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendKind::Terrestrial => f.write_str("ISDB-T"),
            FrontendKind::Satellite => f.write_str("ISDB-S"),
        }
    }
}

/// The part of `FE_GET_INFO` the session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendInfo {
    pub name: String,
    pub fe_type: u32,
}

impl FrontendInfo {
    const FE_QPSK: u32 = 0;
    const FE_OFDM: u32 = 2;

    pub fn kind(&self) -> Option<FrontendKind> {
        match self.fe_type {
            Self::FE_QPSK => Some(FrontendKind::Satellite),
            Self::FE_OFDM => Some(FrontendKind::Terrestrial),
            _ => None,
        }
    }
}

/// `fe_status_t` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontendStatus(pub u32);

impl FrontendStatus {
    pub const HAS_LOCK: u32 = 0x10;
    pub const TIMEDOUT: u32 = 0x20;

    pub fn has_lock(self) -> bool {
        self.0 & Self::HAS_LOCK != 0
    }

    pub fn timed_out(self) -> bool {
        self.0 & Self::TIMEDOUT != 0
    }
}

/// Properties submitted in one `FE_SET_PROPERTY` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneRequest {
    pub frequency: u32,
    pub stream_id: u32,
    /// Only the first LNB holder on an adapter programs the voltage.
    pub voltage: Option<Voltage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    /// Raw `FE_READ_SNR` value; the unit is driver specific.
    pub snr: u16,
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SNR: {}", self.snr)
    }
}

/// Kernel-facing operations on one adapter's device nodes.
pub trait DvbBackend: Send + Sync {
    fn open(&self, node: DeviceNode) -> io::Result<File>;
    fn frontend_info(&self, fe: &File) -> io::Result<FrontendInfo>;
    fn set_properties(&self, fe: &File, request: &TuneRequest) -> io::Result<()>;
    fn set_voltage(&self, fe: &File, voltage: Voltage) -> io::Result<()>;
    /// Dequeue one frontend event (`FE_GET_EVENT`).
    fn read_event(&self, fe: &File) -> io::Result<FrontendStatus>;
    fn read_status(&self, fe: &File) -> io::Result<FrontendStatus>;
    fn read_snr(&self, fe: &File) -> io::Result<u16>;
    fn set_pass_all_filter(&self, demux: &File) -> io::Result<()>;
    fn stop_filter(&self, demux: &File) -> io::Result<()>;
}

/// One physical DVB adapter, shared by every session tuned through it.
pub struct Adapter<B> {
    index: u32,
    backend: B,
    lnb_holders: Mutex<u32>,
}

impl<B: DvbBackend> Adapter<B> {
    pub fn new(index: u32, backend: B) -> Arc<Self> {
        Arc::new(Self {
            index,
            backend,
            lnb_holders: Mutex::new(0),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register a holder. Returns true for the first one, which must power the LNB.
    pub(crate) fn acquire_lnb(&self) -> bool {
        let mut holders = self.lnb_holders.lock();
        *holders += 1;
        debug!("[Tuner] adapter{} LNB holders: {}", self.index, *holders);
        *holders == 1
    }

    /// Drop a holder. Returns true for the last one, which must switch the LNB off.
    pub(crate) fn release_lnb(&self) -> bool {
        let mut holders = self.lnb_holders.lock();
        *holders = holders.saturating_sub(1);
        debug!("[Tuner] adapter{} LNB holders: {}", self.index, *holders);
        *holders == 0
    }

    pub fn lnb_holders(&self) -> u32 {
        *self.lnb_holders.lock()
    }
}

impl Adapter<LinuxDvb> {
    /// `/dev/dvb/adapter{index}`
    pub fn linux(index: u32) -> Arc<Self> {
        Self::new(index, LinuxDvb::new(index))
    }
}
