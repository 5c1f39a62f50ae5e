mod args;
mod cmd_daemon;

use args::Cli;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fwdkeeper=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cmd_daemon::cmd_daemon(cli.command, cli.config).await
}
