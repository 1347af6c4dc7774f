use anyhow::Result;
use clap::Parser;
use contract_verifier::{
    Config,
    Monitor,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse().resolve()?;
    Monitor::run(config).await?;

    Ok(())
}
