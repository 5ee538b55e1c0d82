use std::path::Path;

use log::{error, info};

use crate::channels::{preset, Channel};
use crate::config::{resolve_config, PipelineConfig};
use crate::context::Commands;
use crate::error::{ConfigError, ExitStatus};

mod checksignal;
mod tune;

pub(crate) fn run(command: Commands, config: Option<&Path>) -> ExitStatus {
    let pipeline = match load_pipeline(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::ConfigError;
        }
    };

    match command {
        Commands::Checksignal {
            adapter,
            channel,
            lnb,
            tsid,
        } => checksignal::run(adapter, &channel, lnb, tsid, &pipeline),
        Commands::Tune {
            adapter,
            channel,
            tsid,
            time,
            lnb,
            decode,
            strip,
            sid,
            udp,
            addr,
            port,
            http,
            output,
        } => {
            let args = tune::TuneArgs {
                adapter,
                channel,
                tsid,
                time,
                lnb,
                decode,
                strip,
                sid,
                udp,
                addr,
                port,
                http,
                output,
            };
            tune::run(args, pipeline)
        }
    }
}

fn load_pipeline(config: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let (pipeline, path) = resolve_config(config)?;
    if let Some(path) = path {
        info!("Loaded configuration from {}", path.display());
    }
    Ok(pipeline)
}

/// Parse a channel name and pick its TSID.
///
/// An explicit override wins; otherwise BS slots and ND transponders use
/// their preset TSID, and everything else leaves the choice to the driver.
pub(crate) fn resolve_channel(name: &str, tsid: Option<u32>) -> Result<(Channel, u32), ConfigError> {
    if let Some(preset) = preset::lookup(name) {
        return Ok((preset.channel, tsid.unwrap_or(preset.tsid)));
    }
    let channel: Channel = name.parse()?;
    Ok((channel, tsid.unwrap_or(0)))
}
