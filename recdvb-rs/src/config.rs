//! Recording options and the optional `recdvb.toml` tunables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{all_consuming, map, map_opt, map_res, opt, value};
use nom::multi::{many1, separated_list1};
use nom::IResult;
use serde::Deserialize;

use crate::channels::Channel;
use crate::error::ConfigError;
use crate::queue::{RetryPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::tuner::{LockPolicy, Voltage};

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "recdvb.toml";

/// How long to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecDuration {
    Finite(Duration),
    Indefinite,
}

impl RecDuration {
    pub fn limit(&self) -> Option<Duration> {
        match self {
            RecDuration::Finite(d) => Some(*d),
            RecDuration::Indefinite => None,
        }
    }
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse)(input)
}

fn hms(h: u64, m: u64, s: u64) -> Option<u64> {
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

/// `H:M:S` or `H:M`
fn clock(input: &str) -> IResult<&str, u64> {
    map_opt(separated_list1(char(':'), number), |parts: Vec<u64>| match parts[..] {
        [h, m, s] => hms(h, m, s),
        [h, m] => hms(h, m, 0),
        _ => None,
    })(input)
}

/// One `N[hHmMsS]` term; a bare number counts as seconds.
fn term(input: &str) -> IResult<&str, u64> {
    let (input, n) = number(input)?;
    let (input, marker) = opt(one_of("hHmMsS"))(input)?;
    let factor = match marker {
        Some('h' | 'H') => 3600,
        Some('m' | 'M') => 60,
        _ => 1,
    };
    Ok((input, n.saturating_mul(factor)))
}

fn terms(input: &str) -> IResult<&str, u64> {
    map(many1(term), |v| v.into_iter().fold(0u64, u64::saturating_add))(input)
}

fn rec_duration(input: &str) -> IResult<&str, RecDuration> {
    alt((
        value(RecDuration::Indefinite, all_consuming(tag("-"))),
        map(all_consuming(alt((clock, terms))), |secs| match secs {
            0 => RecDuration::Indefinite,
            s => RecDuration::Finite(Duration::from_secs(s)),
        }),
    ))(input)
}

impl FromStr for RecDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        rec_duration(s.trim())
            .map(|(_, d)| d)
            .map_err(|_| ConfigError::InvalidDuration(s.to_string()))
    }
}

/// Parse `--sid`. `all` (or an empty list) disables service selection.
pub fn parse_services(s: &str) -> Result<Option<Vec<u16>>, ConfigError> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    s.split(',')
        .map(|item| {
            let item = item.trim();
            let parsed = match item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")) {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => item.parse::<u16>(),
            };
            parsed.map_err(|_| ConfigError::InvalidServiceList(s.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Pipeline tunables. Every key is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub queue_wait_ms: u64,
    pub queue_max_waits: u32,
    pub lock_poll_attempts: u32,
    pub lock_poll_interval_ms: u64,
    pub tick_ms: u64,
    pub tune_timeout_ticks: u32,
    pub read_timeout_ticks: u32,
    pub filter_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_wait_ms: 1000,
            queue_max_waits: 15,
            lock_poll_attempts: 5,
            lock_poll_interval_ms: 5000,
            tick_ms: 1000,
            tune_timeout_ticks: 5,
            read_timeout_ticks: 5,
            filter_grace_secs: 4,
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            wait_window: Duration::from_millis(self.queue_wait_ms),
            max_waits: self.queue_max_waits,
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            attempts: self.lock_poll_attempts,
            interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn filter_grace(&self) -> Duration {
        Duration::from_secs(self.filter_grace_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    pipeline: PipelineConfig,
}

pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = toml::from_str(&contents).map_err(|source| ConfigError::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.pipeline)
}

/// Explicit path > `recdvb.toml` in the working directory > defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<(PipelineConfig, Option<PathBuf>), ConfigError> {
    let path = explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    match path {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((PipelineConfig::default(), None)),
    }
}

/// Everything one recording session needs. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub channel: Channel,
    pub duration: RecDuration,
    pub adapter: u32,
    pub lnb: Voltage,
    /// Stream id to select on multi-TS transponders; 0 leaves it to the driver.
    pub tsid: u32,
    /// Run the packet aligner stage.
    pub decode: bool,
    /// Drop null packets inside the aligner stage.
    pub strip_null: bool,
    /// Services to keep; `None` writes the whole stream.
    pub services: Option<Vec<u16>>,
    pub pipeline: PipelineConfig,
}
