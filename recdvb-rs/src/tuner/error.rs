use std::io;

use thiserror::Error;

use super::{DeviceNode, FrontendKind, TunerState};
use crate::error::ExitStatus;

#[derive(Debug, Error)]
pub enum TunerError {
    #[error("cannot open adapter{adapter}/{node}: {source}")]
    Open {
        adapter: u32,
        node: DeviceNode,
        #[source]
        source: io::Error,
    },

    /// An ioctl on an open node failed.
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("frontend `{name}` is neither ISDB-T nor ISDB-S (type {fe_type})")]
    Unsupported { name: String, fe_type: u32 },

    #[error("channel {channel} cannot be received by an {kind} frontend")]
    BandMismatch { channel: String, kind: FrontendKind },

    #[error("no lock after {attempts} polls")]
    LockTimeout { attempts: u32 },

    #[error("{op} is not allowed while the tuner is {state:?}")]
    InvalidState { op: &'static str, state: TunerState },
}

impl TunerError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            TunerError::BandMismatch { .. } => ExitStatus::ConfigError,
            TunerError::LockTimeout { .. } => ExitStatus::TuneTimeout,
            _ => ExitStatus::DeviceError,
        }
    }
}
