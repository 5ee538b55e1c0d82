//! recdvb library - ISDB-T / ISDB-S capture from Linux DVB devices
//!
//! A recording session tunes one adapter, moves frames from the DVR device
//! through a bounded queue and writes them to a file, stdout or a socket.

use clap::Parser;

pub mod capture;
pub mod channels;
pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod sink;
pub mod stages;
pub mod stats;
pub mod termination;
pub mod ts_analyzer;
pub mod tuner;
pub mod writer;

mod commands;
mod context;
mod logging;

// Re-export commonly used types
pub use channels::Channel;
pub use config::{RecDuration, RecordingOptions};
pub use error::ExitStatus;
pub use session::{Session, SessionReport};
pub use tuner::{Adapter, TunerSession, Voltage};

/// Command line entry point. Returns the status the process should exit with.
pub fn run_cli() -> ExitStatus {
    let cli = context::Cli::parse();
    logging::init_logger(cli.verbose);
    commands::run(cli.command, cli.config.as_deref())
}
