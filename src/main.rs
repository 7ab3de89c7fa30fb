//! `rabbit_force` binary entry point: parse CLI options, load the config
//! file, initialize logging, and run the pipeline to completion (§6, §4.H).

use clap::Parser;
use rabbit_force::cli::Options;
use rabbit_force::config::load_config_from_path;
use rabbit_force::pipeline::{self, RuntimeOptions, Shutdown};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let options = Options::parse();
    init_tracing(&options);

    let config = match load_config_from_path(&options.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let runtime_options = RuntimeOptions {
        ignore_replay_storage_errors: options.ignore_replay_storage_errors
            || config.replay.ignore_network_errors,
        ignore_sink_errors: options.ignore_sink_errors,
        source_connection_timeout: options.source_connection_timeout,
    };

    match pipeline::run(config, runtime_options).await {
        Ok(Shutdown::SourcesExhausted) => std::process::exit(0),
        Ok(Shutdown::Interrupted) => std::process::exit(130),
        Err(e) => {
            if options.show_trace {
                eprintln!("fatal error: {e:#?}");
            } else {
                eprintln!("fatal error: {e}");
            }
            std::process::exit(e.exit_code());
        }
    }
}

/// `-v`/`-vv`/`-vvv` pick a default filter level; `RUST_LOG` always wins
/// when set, matching the teacher's `EnvFilter::try_from_default_env()`
/// fallback chain.
fn init_tracing(options: &Options) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
