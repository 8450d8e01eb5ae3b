use std::process::ExitCode;

use clap::Parser;
use dataset_ingest::{app_context::AppContext, cmd::Cli, config::Config};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    // stdout carries the JSON result, logs go to stderr
    let log_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_tracing();
    let cli = Cli::parse();

    let config = match Config::init_validated() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let context = match AppContext::new(&config).await {
        Ok(context) => context,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.run(&context).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
