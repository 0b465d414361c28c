use std::sync::Arc;

use alloy_provider::ProviderBuilder;
use anyhow::Result;
use clap::Parser;
use kona_proposer::{read_proposer_env, setup_proposer_logger, ProofStore, Proposer};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the environment file
    #[arg(long, default_value = ".env")]
    env_file: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::from_filename(args.env_file).ok();

    setup_proposer_logger();

    let config = read_proposer_env()?;

    let db = Arc::new(ProofStore::new(&config.db_url).await?);
    let l1_provider = ProviderBuilder::new().connect_http(config.l1_rpc.clone());

    let proposer = Proposer::new(config, db, l1_provider);

    info!("starting proposer");
    proposer.run().await
}
