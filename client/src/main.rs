mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fetl=info,common=info,service=info,runner=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli::Cli::parse()).await
}
