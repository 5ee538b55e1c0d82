use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Problems found before any hardware is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid channel `{0}`")]
    InvalidChannel(String),

    #[error("invalid recording duration `{0}`")]
    InvalidDuration(String),

    #[error("invalid LNB voltage `{0}` (expected 0, 11 or 15)")]
    InvalidVoltage(String),

    #[error("invalid service list `{0}`")]
    InvalidServiceList(String),

    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Terminal status of a session, ordered by severity.
///
/// When both pipeline threads report, the more severe one becomes the
/// process result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitStatus {
    Success,
    ConsumerTimeout,
    ReadTimeout,
    SinkFailed,
    TuneTimeout,
    DeviceError,
    ConfigError,
    Internal,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ConfigError => 2,
            ExitStatus::DeviceError => 3,
            ExitStatus::TuneTimeout => 4,
            ExitStatus::ReadTimeout => 5,
            ExitStatus::SinkFailed => 6,
            ExitStatus::ConsumerTimeout => 7,
            ExitStatus::Internal => 8,
        }
    }

    pub fn worse(self, other: ExitStatus) -> ExitStatus {
        self.max(other)
    }

    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::ConsumerTimeout => "consumer timeout",
            ExitStatus::ReadTimeout => "read timeout",
            ExitStatus::SinkFailed => "sink write failure",
            ExitStatus::TuneTimeout => "tune timeout",
            ExitStatus::DeviceError => "device error",
            ExitStatus::ConfigError => "configuration error",
            ExitStatus::Internal => "internal error",
        };
        f.write_str(s)
    }
}
