use anyhow::Result;
use clap::Parser;
use jade_mgmt::cli::{Cli, Command};
use jade_mgmt::{run_agent, run_master, JadeConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if !cli.is_daemon() {
        let code = cli.run().await?;
        std::process::exit(code);
    }

    let config = JadeConfig::load_or_default(&cli.config)?;
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        on_signal.cancel();
    });

    match cli.command {
        Command::Master => run_master(config, shutdown).await,
        _ => run_agent(config, shutdown).await,
    }
}
