use clap::Parser;
use tracing_subscriber::EnvFilter;

use bridge_auth::cli::{Cli, Command, run_devices_command, run_serve_command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bridge_auth=info")),
        )
        .with_target(false)
        .init();

    let config = cli.auth_config()?;

    match cli.command {
        Command::Serve(args) => run_serve_command(args, config).await,
        Command::Devices(cmd) => run_devices_command(cmd, config).await,
    }
}
