//! CLI surface (spec §6): `rabbit_force [OPTIONS] CONFIG_FILE`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "rabbit_force", version, about = "Forward Salesforce Streaming API push notifications to RabbitMQ")]
pub struct Options {
    /// Swallow Replay Store failures instead of treating them as fatal.
    #[arg(long)]
    pub ignore_replay_storage_errors: bool,

    /// Swallow sink publish failures (after their own retry budget) instead of treating them as fatal.
    #[arg(long)]
    pub ignore_sink_errors: bool,

    /// Seconds a source may spend retrying before its client is declared FAILED. 0 = infinite.
    #[arg(long, default_value_t = 10)]
    pub source_connection_timeout: u64,

    /// Increase log verbosity (repeatable, 1..3).
    #[arg(short = 'v', long = "verbosity", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Print full error chains on fatal exit instead of a single-line summary.
    #[arg(short = 't', long = "show-trace")]
    pub show_trace: bool,

    /// Path to the JSON or YAML configuration file.
    pub config_file: PathBuf,
}

impl Options {
    /// Maps `-v`/`-vv`/`-vvv` onto a `tracing_subscriber::EnvFilter` default
    /// directive, the way `forwarder::main`'s `EnvFilter::new("info")`
    /// fallback works when `RUST_LOG` is unset.
    pub fn default_log_directive(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
