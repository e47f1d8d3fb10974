mod cli;
mod commands;
mod error;
mod logging;

use crate::cli::{Cli, Command};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use reel_config::Config;
use reel_offer::TapeOffer;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&cli.log_level, cli.log_format) {
        eprintln!("{err:?}");
        return ExitCode::FAILURE;
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "{}", *err);
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    if let Command::Serve = cli.command {
        return serve(config).await;
    }
    let offer = TapeOffer::open(config).await.or_raise(|| ErrorKind::Offer)?;
    let result = commands::run(&offer, cli.command).await;
    offer.shutdown().await;
    result
}

async fn serve(config: Config) -> Result<()> {
    let offer = TapeOffer::start(config).await.or_raise(|| ErrorKind::Offer)?;
    let interrupted = tokio::signal::ctrl_c().await;
    tracing::info!("interrupted, shutting down");
    offer.shutdown().await;
    interrupted.or_raise(|| ErrorKind::Io("signal handler".to_string()))
}
