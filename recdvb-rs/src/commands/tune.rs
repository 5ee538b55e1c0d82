use log::{error, info, warn};

use crate::config::{parse_services, PipelineConfig, RecordingOptions};
use crate::error::{ConfigError, ExitStatus};
use crate::session::Session;
use crate::sink::Destination;
use crate::stages::Stages;
use crate::termination::{install_signal_handler, Termination};
use crate::tuner::{Adapter, Voltage};

use super::resolve_channel;

#[derive(Debug)]
pub(crate) struct TuneArgs {
    pub adapter: u32,
    pub channel: String,
    pub tsid: Option<u32>,
    pub time: String,
    pub lnb: Voltage,
    pub decode: bool,
    pub strip: bool,
    pub sid: Option<String>,
    pub udp: bool,
    pub addr: String,
    pub port: u16,
    pub http: Option<u16>,
    pub output: Option<String>,
}

impl TuneArgs {
    fn recording_options(&self, pipeline: PipelineConfig) -> Result<RecordingOptions, ConfigError> {
        let (channel, tsid) = resolve_channel(&self.channel, self.tsid)?;
        let services = match &self.sid {
            Some(list) => parse_services(list)?,
            None => None,
        };
        Ok(RecordingOptions {
            channel,
            duration: self.time.parse()?,
            adapter: self.adapter,
            lnb: self.lnb,
            tsid,
            decode: self.decode || self.strip,
            strip_null: self.strip,
            services,
            pipeline,
        })
    }

    fn destination(&self) -> Destination {
        if let Some(port) = self.http {
            Destination::Http { port }
        } else if self.udp {
            Destination::Udp {
                host: self.addr.clone(),
                port: self.port,
            }
        } else {
            Destination::from_output(self.output.as_deref().unwrap_or("-"))
        }
    }
}

pub(crate) fn run(args: TuneArgs, pipeline: PipelineConfig) -> ExitStatus {
    let opts = match args.recording_options(pipeline) {
        Ok(opts) => opts,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::ConfigError;
        }
    };
    if args.output.is_some() && (args.udp || args.http.is_some()) {
        warn!("Output path is ignored when streaming over the network");
    }

    let sink = match args.destination().open() {
        Ok(sink) => sink,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::SinkFailed;
        }
    };
    let chunk_size = sink.max_write_size();

    // Installed after the sink is open so that a pending HTTP accept can
    // still be killed by the default handler.
    let termination = match Termination::new() {
        Ok(termination) => termination,
        Err(e) => {
            error!("Failed to create termination eventfd: {}", e);
            return ExitStatus::Internal;
        }
    };
    if let Err(e) = install_signal_handler(termination.clone()) {
        error!("Failed to install signal handler: {}", e);
        return ExitStatus::Internal;
    }

    match opts.duration.limit() {
        Some(limit) => info!("Recording {} for {}sec", opts.channel, limit.as_secs()),
        None => info!("Recording {} until interrupted", opts.channel),
    }

    let stages = Stages::from_options(&opts);
    match Session::run(
        &opts,
        Adapter::linux(opts.adapter),
        termination,
        sink,
        chunk_size,
        stages,
    ) {
        Ok(report) => {
            if !report.status.is_success() {
                error!("Recording ended with {}", report.status);
            }
            report.status
        }
        Err(e) => {
            error!("{}", e);
            e.exit_status()
        }
    }
}
