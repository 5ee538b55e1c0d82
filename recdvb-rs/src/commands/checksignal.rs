use std::io::Write;
use std::thread;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::error;

use crate::channels::Channel;
use crate::config::PipelineConfig;
use crate::error::ExitStatus;
use crate::termination::{install_signal_handler, Termination};
use crate::tuner::{Adapter, DvbBackend, SignalQuality, TunerError, TunerSession, Voltage};

use super::resolve_channel;

const REFRESH: Duration = Duration::from_secs(1);

pub(crate) fn run(
    adapter: u32,
    channel: &str,
    lnb: Voltage,
    tsid: Option<u32>,
    pipeline: &PipelineConfig,
) -> ExitStatus {
    let (channel, tsid) = match resolve_channel(channel, tsid) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("{}", e);
            return ExitStatus::ConfigError;
        }
    };
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

    let mut tuner = TunerSession::new(Adapter::linux(adapter));
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Tuning to {}...", channel));
    spinner.enable_steady_tick(Duration::from_millis(100));

    if let Err(e) = tune(&mut tuner, &channel, tsid, lnb, pipeline) {
        spinner.abandon_with_message(format!("{}", "Failed to tune".red()));
        error!("{}", e);
        return e.exit_status();
    }
    spinner.finish_with_message(format!("{} {}", "Locked".green().bold(), channel));

    monitor(&tuner, &termination);
    println!();
    ExitStatus::Success
}

fn tune<B: DvbBackend>(
    tuner: &mut TunerSession<B>,
    channel: &Channel,
    tsid: u32,
    lnb: Voltage,
    pipeline: &PipelineConfig,
) -> Result<(), TunerError> {
    tuner.open()?;
    tuner.configure(channel, tsid, lnb)?;
    tuner.commit_and_wait_lock(pipeline.lock_policy())
}

/// Print the signal quality on one line until a stop is requested.
fn monitor<B: DvbBackend>(tuner: &TunerSession<B>, termination: &Termination) {
    let mut stdout = std::io::stdout();
    while !termination.is_requested() {
        let line = match tuner.read_signal_quality() {
            Some(quality) => render(quality),
            None => "SNR: unavailable".yellow().to_string(),
        };
        let _ = write!(stdout, "\r{}    ", line);
        let _ = stdout.flush();
        thread::sleep(REFRESH);
    }
}

fn render(quality: SignalQuality) -> String {
    let text = quality.to_string();
    if quality.snr == 0 {
        text.red().to_string()
    } else {
        text.green().to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::StopCause;
    use crate::tuner::mock::MockDvb;

    fn fast_pipeline() -> PipelineConfig {
        PipelineConfig {
            lock_poll_attempts: 2,
            lock_poll_interval_ms: 50,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_tune_locks() {
        let mock = MockDvb::satellite();
        mock.lock_on_tune(true);
        let mut tuner = TunerSession::new(Adapter::new(0, mock.clone()));
        let (channel, tsid) = resolve_channel("bs01_1", None).unwrap();

        tune(&mut tuner, &channel, tsid, Voltage::_15v, &fast_pipeline()).unwrap();
        assert!(tuner.is_locked());
        assert_eq!(mock.requests()[0].stream_id, 0x4011);
    }

    #[test]
    fn test_tune_without_signal_times_out() {
        let mock = MockDvb::terrestrial();
        let mut tuner = TunerSession::new(Adapter::new(0, mock));
        let (channel, tsid) = resolve_channel("27", None).unwrap();

        let err = tune(&mut tuner, &channel, tsid, Voltage::Off, &fast_pipeline()).unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::TuneTimeout);
    }

    #[test]
    fn test_monitor_stops_on_request() {
        let mock = MockDvb::terrestrial();
        let tuner = TunerSession::new(Adapter::new(0, mock));
        let termination = Termination::new().unwrap();
        termination.request(StopCause::Interrupted);
        monitor(&tuner, &termination);
    }

    #[test]
    fn test_render_text() {
        colored::control::set_override(false);
        assert_eq!(render(SignalQuality { snr: 0 }), "SNR: 0");
        assert_eq!(render(SignalQuality { snr: 312 }), "SNR: 312");
    }
}
