//! Optional byte-stream stages run by the sink writer.
//!
//! A [`Decoder`] transforms every frame and may hold data back until
//! [`Decoder::finish`]. A [`Filter`] first has to identify what it is
//! selecting ([`Filter::select_target`]) and only then starts filtering.

use thiserror::Error;

use crate::config::RecordingOptions;

mod aligner;
mod splitter;

pub use aligner::PacketAligner;
pub use splitter::ServiceSplitter;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("none of the requested services {0:?} are in this stream")]
    ServiceNotFound(Vec<u16>),

    #[error("malformed {table}: {reason}")]
    Malformed {
        table: &'static str,
        reason: &'static str,
    },

    #[error("{0}")]
    Other(String),
}

pub trait Decoder: Send {
    fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, StageError>;

    /// Flush whatever is still buffered at end of stream.
    fn finish(&mut self) -> Result<Vec<u8>, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Ready,
    MoreNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filtered {
    Data(Vec<u8>),
    /// Nothing can be emitted until more tables have been seen.
    PendingMetadata,
}

pub trait Filter: Send {
    fn select_target(&mut self, input: &[u8]) -> Result<Selection, StageError>;
    fn filter(&mut self, input: &[u8]) -> Result<Filtered, StageError>;
}

/// The stages attached to one session.
#[derive(Default)]
pub struct Stages {
    pub decoder: Option<Box<dyn Decoder>>,
    pub filter: Option<Box<dyn Filter>>,
}

impl Stages {
    pub fn none() -> Self {
        Self::default()
    }

    /// The built-in stages selected by the recording options.
    pub fn from_options(opts: &RecordingOptions) -> Self {
        let decoder: Option<Box<dyn Decoder>> = if opts.decode || opts.strip_null {
            Some(Box::new(PacketAligner::new(opts.strip_null)))
        } else {
            None
        };
        let filter: Option<Box<dyn Filter>> = match &opts.services {
            Some(sids) => Some(Box::new(ServiceSplitter::new(sids.clone()))),
            None => None,
        };
        Self { decoder, filter }
    }
}
