use std::process::ExitCode;

use clap::Parser;
use livekit_cli::cancel::Shutdown;
use livekit_cli::commands::{self, Cli};
use livekit_cli::error::{exit_code_for, is_cancelled};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.global.verbose;
    init_tracing(verbose);

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    match commands::run(cli, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if is_cancelled(&err) {
                eprintln!("cancelled");
            } else if verbose {
                eprintln!("error: {err:?}");
            } else {
                eprintln!("error: {err:#}");
            }
            let code = exit_code_for(&err);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("warn"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
