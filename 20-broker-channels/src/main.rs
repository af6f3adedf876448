use anyhow::Result;
use broker_channels::{
    cli::{Cli, Command},
    client,
};
use clap::Parser;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Publish(args) => client::publish(args).await?,
        Command::Consume(args) => client::consume(args).await?,
    }

    Ok(())
}
