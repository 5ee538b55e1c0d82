//! Channel identifiers and their physical frequencies.
//!
//! Three notations are accepted, case-insensitively:
//! * `27`: terrestrial UHF channel number
//! * `bs15` / `bs15_1`: BS transponder, optionally with a slot suffix
//! * `nd04`: 110-degree CS transponder

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::ConfigError;

pub mod preset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Terrestrial,
    Bs,
    Nd,
}

impl Band {
    pub fn is_satellite(self) -> bool {
        !matches!(self, Band::Terrestrial)
    }

    /// Channel or transponder numbers that exist in the band.
    fn numbers(self) -> RangeInclusive<u32> {
        match self {
            Band::Terrestrial => 13..=62,
            Band::Bs => 1..=23,
            Band::Nd => 1..=24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub band: Band,
    pub number: u32,
    /// Slot within a BS transponder (`bs15_1` -> 1).
    pub slot: Option<u32>,
}

impl Channel {
    /// Frequency to program into the frontend.
    ///
    /// Terrestrial channels are in Hz, satellite transponders in kHz, which is
    /// what the DVB API expects for each delivery system.
    pub fn frequency(&self) -> u32 {
        match self.band {
            Band::Terrestrial => (self.number * 6000 + 395_143) * 1000,
            Band::Bs => self.number * 19180 + 1_030_300,
            Band::Nd => self.number * 20000 + 1_573_000,
        }
    }

    /// Canonical preset name, e.g. `bs01_0` or `nd02`.
    pub fn preset_name(&self) -> Option<String> {
        match (self.band, self.slot) {
            (Band::Bs, Some(slot)) => Some(format!("bs{:02}_{}", self.number, slot)),
            (Band::Nd, _) => Some(format!("nd{:02}", self.number)),
            _ => None,
        }
    }
}

fn parse_number(band: Band, digits: &str, whole: &str) -> Result<u32, ConfigError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidChannel(whole.to_string()));
    }
    match digits.parse::<u32>() {
        Ok(n) if band.numbers().contains(&n) => Ok(n),
        _ => Err(ConfigError::InvalidChannel(whole.to_string())),
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();

        if let Some(rest) = lower.strip_prefix("bs") {
            let (number, slot) = match rest.split_once('_') {
                Some((n, slot)) => {
                    let slot = slot
                        .parse::<u32>()
                        .map_err(|_| ConfigError::InvalidChannel(s.to_string()))?;
                    (n, Some(slot))
                }
                None => (rest, None),
            };
            return Ok(Channel {
                band: Band::Bs,
                number: parse_number(Band::Bs, number, s)?,
                slot,
            });
        }

        if let Some(rest) = lower.strip_prefix("nd") {
            return Ok(Channel {
                band: Band::Nd,
                number: parse_number(Band::Nd, rest, s)?,
                slot: None,
            });
        }

        Ok(Channel {
            band: Band::Terrestrial,
            number: parse_number(Band::Terrestrial, &lower, s)?,
            slot: None,
        })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.band, self.slot) {
            (Band::Terrestrial, _) => write!(f, "{}", self.number),
            (Band::Bs, Some(slot)) => write!(f, "BS{:02}_{}", self.number, slot),
            (Band::Bs, None) => write!(f, "BS{:02}", self.number),
            (Band::Nd, _) => write!(f, "ND{:02}", self.number),
        }
    }
}
