//! langcheck - LSP-backed file validation server
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and delegates each
//! `validate` call to the language server registered for the file type.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use langcheck::app::App;
use langcheck::cli::Cli;

fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr
    // Use RUST_LOG=langcheck=trace to see backend traffic
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("langcheck: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(cli)) {
        eprintln!("langcheck: {:#}", e);
        std::process::exit(1);
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let app = App::from_cli(&cli)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize: {}", e))?;

    app.serve_stdio().await
}
