mod cli;
mod run;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    if cfg!(debug_assertions) {
        tracing::warn!("Running a debug build. Image resampling can be much slower. Use `cargo run --release ...`.");
    }

    let cli = cli::Cli::parse();
    match &cli.command {
        cli::Command::Prepare(args) => run::run_prepare(args),
        cli::Command::Evaluate(args) => run::run_evaluate(args),
    }
}
