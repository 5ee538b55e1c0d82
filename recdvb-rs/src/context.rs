use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;

use crate::sink::{DEFAULT_UDP_HOST, DEFAULT_UDP_PORT};
use crate::tuner::Voltage;

#[derive(Debug, Parser)]
#[clap(name = "recdvb")]
#[clap(about = "recdvb records ISDB-T / ISDB-S transport streams from Linux DVB devices.", long_about = None)]
#[clap(author = "maleicacid")]
#[clap(version)]
pub(crate) struct Cli {
    /// Enable debug logging.{n}
    /// `RUST_LOG` takes precedence when set.
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Pipeline configuration file (TOML).{n}
    /// When omitted, `recdvb.toml` in the working directory is used if present.
    #[clap(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Signal test.{n}
    /// This subcommand tunes to a channel, waits for lock
    /// and prints the signal quality once per second until interrupted.
    #[clap(name = "checksignal")]
    Checksignal {
        /// The adapter number.{n}
        /// `2` means `/dev/dvb/adapter2`.
        #[clap(short = 'd', long = "dev", value_name = "ADAPTER", default_value_t = 0)]
        adapter: u32,

        /// The channel name.{n}
        /// `13`-`62` for terrestrial, `bs01_0`..`bs23_2` or `nd02`..`nd24` for satellite.
        #[clap(short, long, required = true)]
        channel: String,

        /// LNB voltage (0, 11 or 15).{n}
        /// Only applies to satellite channels.
        #[clap(long = "lnb", default_value = "0")]
        lnb: Voltage,

        /// Override the transport stream ID(TSID) to obtain the stream.
        #[clap(long, value_parser=maybe_hex::<u32>)]
        tsid: Option<u32>,
    },
    /// Tune to a channel and record.{n}
    /// The stream is written to a file, stdout, a UDP peer or a single HTTP client.
    Tune {
        /// The adapter number.{n}
        /// `2` means `/dev/dvb/adapter2`.
        #[clap(short = 'd', long = "dev", value_name = "ADAPTER", default_value_t = 0)]
        adapter: u32,

        /// The channel name.{n}
        /// `13`-`62` for terrestrial, `bs01_0`..`bs23_2` or `nd02`..`nd24` for satellite.
        #[clap(short, long, required = true)]
        channel: String,

        /// Override the transport stream ID(TSID) to obtain the stream (ISDB-S).
        #[clap(long, value_parser=maybe_hex::<u32>)]
        tsid: Option<u32>,

        /// The duration of the recording.{n}
        /// Seconds, `H:M:S`, `H:M` or `1h30m10s`.{n}
        /// `-` or `0` records until interrupted.
        #[clap(short, long, value_name = "DURATION", default_value = "-")]
        time: String,

        /// LNB voltage (0, 11 or 15).{n}
        /// Only applies to satellite channels.
        #[clap(long = "lnb", default_value = "0")]
        lnb: Voltage,

        /// Re-align the stream to packet boundaries before writing.
        #[clap(long = "b25")]
        decode: bool,

        /// Discard null packets (implies `--b25`).
        #[clap(long = "strip")]
        strip: bool,

        /// Keep only these services.{n}
        /// Comma-separated service IDs, e.g. `101,102`. `all` keeps everything.
        #[clap(long, value_name = "SID1,SID2")]
        sid: Option<String>,

        /// Send the stream over UDP instead of writing it.
        #[clap(long, conflicts_with = "http")]
        udp: bool,

        /// UDP destination host.
        #[clap(long, requires = "udp", default_value = DEFAULT_UDP_HOST)]
        addr: String,

        /// UDP destination port.
        #[clap(long, requires = "udp", default_value_t = DEFAULT_UDP_PORT)]
        port: u16,

        /// Serve the stream to one HTTP client on this port.
        #[clap(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "12345")]
        http: Option<u16>,

        /// The location of the output.{n}
        /// If '-' is specified, the recording will be redirected to stdout.{n}
        /// Missing parent directories are created.
        #[clap(required_unless_present_any = ["udp", "http"])]
        output: Option<String>,
    },
}
