//! Console logging.
//!
//! Everything goes to stderr so that `-` can stream the recording to stdout.

use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env, Target};

/// Initialize the global logger.
///
/// `RUST_LOG` wins over the default level, which is `info` or `debug` with
/// `--verbose`.
pub(crate) fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_level))
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}
