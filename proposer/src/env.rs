//! Environment-driven configuration for the proposer binary.

use std::env;
use std::path::PathBuf;

use alloy_primitives::Address;
use anyhow::Result;
use reqwest::Url;
use tracing::warn;

/// Full configuration of the proof orchestration loop.
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// SQLite database URL for the proof request store.
    pub db_url: String,
    pub l1_rpc: Url,
    /// Rollup node (op-node) RPC endpoint.
    pub l2_node_rpc: Url,
    /// L1 beacon REST endpoint; without it post-ecotone blob batches
    /// cannot be fetched.
    pub beacon_rpc: Option<Url>,
    /// Base URL of the Kona prover service.
    pub kona_server_url: Url,
    pub l2oo_address: Address,
    pub l2_chain_id: u64,
    pub batch_inbox_address: Address,
    pub batcher_address: Address,
    pub l2_genesis_timestamp: u64,
    pub l2_genesis_block: u64,
    pub l2_block_time: u64,
    /// Seconds a request may stay with the prover before it is failed and
    /// recovered.
    pub max_proof_time: u64,
    /// Maximum number of L2 blocks per SPAN proof.
    pub max_block_range_per_span_proof: u64,
    /// Tolerated gap between the next block to prove and a span batch
    /// start before the future range is adopted anyway.
    pub max_span_batch_deviation: u64,
    pub batch_decoder_concurrent_reqs: u64,
    pub tx_cache_out_dir: PathBuf,
    /// Per-call I/O timeout in seconds.
    pub network_timeout: u64,
    /// Seconds between scheduler ticks.
    pub loop_interval: u64,
    pub max_concurrent_proof_requests: u64,
}

/// Helper function to get environment variables with a default value and parse them.
fn get_env_var<T>(key: &str, default: Option<T>) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {:?}", key, e)),
        Err(_) => match default {
            Some(default_val) => Ok(default_val),
            None => anyhow::bail!("{} is not set", key),
        },
    }
}

fn get_optional_env_var<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(value) => {
            Ok(Some(value.parse::<T>().map_err(|e| {
                anyhow::anyhow!("Failed to parse {}: {:?}", key, e)
            })?))
        }
        Err(_) => Ok(None),
    }
}

const DEFAULT_LOOP_INTERVAL: u64 = 5;
const DEFAULT_NETWORK_TIMEOUT: u64 = 30;
const DEFAULT_MAX_PROOF_TIME: u64 = 4 * 3600;
const DEFAULT_TX_CACHE_OUT_DIR: &str = "/tmp/batch_decoder/transactions_cache";

/// Read proposer environment variables and return a config.
pub fn read_proposer_env() -> Result<ProposerConfig> {
    let beacon_rpc = get_optional_env_var("BEACON_RPC")?;
    if beacon_rpc.is_none() {
        warn!("BEACON_RPC not set. Unable to fetch post-ecotone channel frames.");
    }

    let config = ProposerConfig {
        db_url: get_env_var("DATABASE_URL", None)?,
        l1_rpc: get_env_var("L1_RPC", None)?,
        l2_node_rpc: get_env_var("L2_NODE_RPC", None)?,
        beacon_rpc,
        kona_server_url: get_env_var("KONA_SERVER_URL", None)?,
        l2oo_address: get_env_var("L2OO_ADDRESS", None)?,
        l2_chain_id: get_env_var("L2_CHAIN_ID", None)?,
        batch_inbox_address: get_env_var("BATCH_INBOX_ADDRESS", None)?,
        batcher_address: get_env_var("BATCHER_ADDRESS", None)?,
        l2_genesis_timestamp: get_env_var("L2_GENESIS_TIMESTAMP", None)?,
        l2_genesis_block: get_env_var("L2_GENESIS_BLOCK", Some(0))?,
        l2_block_time: get_env_var("L2_BLOCK_TIME", Some(2))?,
        max_proof_time: get_env_var("MAX_PROOF_TIME", Some(DEFAULT_MAX_PROOF_TIME))?,
        max_block_range_per_span_proof: get_env_var(
            "MAX_BLOCK_RANGE_PER_SPAN_PROOF",
            Some(1800),
        )?,
        max_span_batch_deviation: get_env_var("MAX_SPAN_BATCH_DEVIATION", Some(300))?,
        batch_decoder_concurrent_reqs: get_env_var("BATCH_DECODER_CONCURRENT_REQS", Some(10))?,
        tx_cache_out_dir: get_env_var(
            "TX_CACHE_OUT_DIR",
            Some(PathBuf::from(DEFAULT_TX_CACHE_OUT_DIR)),
        )?,
        network_timeout: get_env_var("NETWORK_TIMEOUT", Some(DEFAULT_NETWORK_TIMEOUT))?,
        loop_interval: get_env_var("LOOP_INTERVAL", Some(DEFAULT_LOOP_INTERVAL))?,
        max_concurrent_proof_requests: get_env_var("MAX_CONCURRENT_PROOF_REQUESTS", Some(10))?,
    };

    if config.max_block_range_per_span_proof == 0 {
        anyhow::bail!("MAX_BLOCK_RANGE_PER_SPAN_PROOF must be positive");
    }
    if config.l2_block_time == 0 {
        anyhow::bail!("L2_BLOCK_TIME must be positive");
    }
    if config.loop_interval == 0 || config.max_proof_time == 0 {
        anyhow::bail!(
            "Invalid configuration, loop_interval: {} and max_proof_time: {} must be positive",
            config.loop_interval,
            config.max_proof_time
        );
    }
    if config.max_concurrent_proof_requests == 0 || config.batch_decoder_concurrent_reqs == 0 {
        anyhow::bail!(
            "Invalid configuration, max_concurrent_proof_requests: {} and batch_decoder_concurrent_reqs: {} must be positive",
            config.max_concurrent_proof_requests,
            config.batch_decoder_concurrent_reqs
        );
    }

    Ok(config)
}
