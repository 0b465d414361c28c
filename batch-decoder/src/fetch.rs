//! Scanning an L1 window for batcher transactions.
//!
//! Every transaction sent to the batch inbox is persisted as one JSON file
//! in the cache directory, named by transaction hash, together with the
//! frames it carried. Re-fetching a window overwrites the same files, so
//! repeated passes are idempotent.

use std::collections::HashSet;
use std::path::PathBuf;

use alloy_consensus::Transaction as _;
use alloy_primitives::{Address, B256};
use alloy_provider::Provider;
use anyhow::{anyhow, Context, Result};
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blobs::{blob_to_data, BeaconClient};
use crate::frame::Frame;

/// Parameters for one fetch pass over an L1 window.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// First L1 block of the window, inclusive.
    pub start: u64,
    /// Last L1 block of the window, inclusive.
    pub end: u64,
    pub chain_id: u64,
    pub batch_inbox: Address,
    pub batch_senders: HashSet<Address>,
    pub out_directory: PathBuf,
    pub concurrent_requests: usize,
}

/// One cached batcher transaction with the frames recovered from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionWithMetadata {
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_time: u64,
    pub sender: Address,
    pub valid_sender: bool,
    pub inbox: Address,
    pub chain_id: u64,
    pub frames: Vec<Frame>,
}

/// Pulls all batcher transactions in `[config.start, config.end]` into the
/// cache directory. Returns the number of transactions with valid frames
/// and the number that failed to parse.
pub async fn fetch_batches<P>(
    l1_provider: &P,
    beacon: Option<&BeaconClient>,
    config: &FetchConfig,
) -> Result<(u64, u64)>
where
    P: Provider + Clone,
{
    tokio::fs::create_dir_all(&config.out_directory)
        .await
        .with_context(|| format!("failed to create tx cache dir {:?}", config.out_directory))?;

    let counts: Vec<(u64, u64)> = stream::iter(config.start..=config.end)
        .map(|number| fetch_block(l1_provider, beacon, config, number))
        .buffer_unordered(config.concurrent_requests.max(1))
        .try_collect()
        .await?;

    let valid = counts.iter().map(|(v, _)| v).sum();
    let invalid = counts.iter().map(|(_, i)| i).sum();
    Ok((valid, invalid))
}

async fn fetch_block<P>(
    l1_provider: &P,
    beacon: Option<&BeaconClient>,
    config: &FetchConfig,
    number: u64,
) -> Result<(u64, u64)>
where
    P: Provider + Clone,
{
    let block = l1_provider
        .get_block_by_number(number.into())
        .full()
        .await
        .map_err(|e| anyhow!("failed to fetch L1 block {number}: {e}"))?
        .ok_or_else(|| anyhow!("L1 block {number} not found"))?;

    let txs = block.transactions.as_transactions().unwrap_or_default();

    let mut valid = 0u64;
    let mut invalid = 0u64;
    // Blob indices are assigned per block across all 4844 transactions, so
    // the counter advances even for transactions we do not care about.
    let mut blob_index = 0u64;

    for tx in txs {
        let blob_count = tx.blob_versioned_hashes().map_or(0, |hashes| hashes.len() as u64);
        let tx_blob_base = blob_index;
        blob_index += blob_count;

        if tx.to() != Some(config.batch_inbox) {
            continue;
        }
        let sender = tx.inner.signer();
        let valid_sender = config.batch_senders.contains(&sender);
        if !valid_sender {
            warn!(tx = %tx.inner.tx_hash(), %sender, "batch inbox transaction from unknown sender");
        }

        let data = if blob_count > 0 {
            let beacon = beacon
                .ok_or_else(|| anyhow!("blob batcher transaction found but no beacon endpoint"))?;
            let slot = beacon.slot_for_timestamp(block.header.timestamp).await?;
            let indices: Vec<u64> = (tx_blob_base..tx_blob_base + blob_count).collect();
            let sidecars = beacon
                .blob_sidecars(slot, &indices)
                .await
                .with_context(|| format!("failed to fetch blob sidecars at slot {slot}"))?;

            let mut data = Vec::new();
            for sidecar in &sidecars {
                data.push(blob_to_data(&sidecar.blob)?);
            }
            data
        } else {
            vec![tx.input().to_vec()]
        };

        // A blob transaction carries one frame stream per blob; calldata
        // carries exactly one.
        let mut frames = Vec::new();
        let mut parse_ok = valid_sender;
        for stream_data in &data {
            match Frame::parse_frames(stream_data) {
                Ok(parsed) => frames.extend(parsed),
                Err(err) => {
                    warn!(tx = %tx.inner.tx_hash(), %err, "failed to parse frames");
                    parse_ok = false;
                }
            }
        }
        if parse_ok {
            valid += 1;
        } else {
            invalid += 1;
        }

        let entry = TransactionWithMetadata {
            tx_hash: *tx.inner.tx_hash(),
            block_number: number,
            block_hash: block.header.hash,
            block_time: block.header.timestamp,
            sender,
            valid_sender,
            inbox: config.batch_inbox,
            chain_id: config.chain_id,
            frames,
        };
        let path = config.out_directory.join(format!("{}.json", entry.tx_hash));
        let encoded = serde_json::to_vec_pretty(&entry)?;
        tokio::fs::write(&path, encoded)
            .await
            .with_context(|| format!("failed to write tx cache file {path:?}"))?;
        debug!(tx = %entry.tx_hash, block = number, frames = entry.frames.len(), "cached batcher tx");
    }

    Ok((valid, invalid))
}

/// Loads every cached batcher transaction for the given inbox from the
/// cache directory, ordered by L1 block number.
pub fn load_cached_transactions(
    in_directory: &std::path::Path,
    batch_inbox: Address,
) -> Result<Vec<TransactionWithMetadata>> {
    let mut txs = Vec::new();
    let entries = std::fs::read_dir(in_directory)
        .with_context(|| format!("failed to read tx cache dir {in_directory:?}"))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read(&path)?;
        let tx: TransactionWithMetadata = serde_json::from_slice(&raw)
            .with_context(|| format!("malformed tx cache file {path:?}"))?;
        if tx.valid_sender && tx.inbox == batch_inbox {
            txs.push(tx);
        }
    }
    txs.sort_by_key(|tx| (tx.block_number, tx.tx_hash));
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INBOX: Address = Address::new([0xFF; 20]);
    const OTHER_INBOX: Address = Address::new([0xEE; 20]);

    fn cached_tx(seed: u8, block_number: u64) -> TransactionWithMetadata {
        TransactionWithMetadata {
            tx_hash: B256::repeat_byte(seed),
            block_number,
            block_hash: B256::repeat_byte(0xBB),
            block_time: 1_700_000_000,
            sender: Address::new([0x01; 20]),
            valid_sender: true,
            inbox: INBOX,
            chain_id: 1,
            frames: Vec::new(),
        }
    }

    fn write_tx(dir: &std::path::Path, tx: &TransactionWithMetadata) {
        let path = dir.join(format!("{}.json", tx.tx_hash));
        std::fs::write(path, serde_json::to_vec(tx).unwrap()).unwrap();
    }

    #[test]
    fn loads_cached_transactions_in_block_order() {
        let dir = tempfile::tempdir().unwrap();
        write_tx(dir.path(), &cached_tx(2, 102));
        write_tx(dir.path(), &cached_tx(1, 100));
        write_tx(dir.path(), &cached_tx(3, 101));

        let txs = load_cached_transactions(dir.path(), INBOX).unwrap();
        let blocks: Vec<u64> = txs.iter().map(|tx| tx.block_number).collect();
        assert_eq!(blocks, vec![100, 101, 102]);
    }

    #[test]
    fn drops_transactions_from_unauthorized_senders() {
        let dir = tempfile::tempdir().unwrap();
        write_tx(dir.path(), &cached_tx(1, 100));
        let mut spoofed = cached_tx(2, 101);
        spoofed.valid_sender = false;
        write_tx(dir.path(), &spoofed);

        let txs = load_cached_transactions(dir.path(), INBOX).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_hash, B256::repeat_byte(1));
    }

    #[test]
    fn drops_transactions_for_a_different_inbox() {
        let dir = tempfile::tempdir().unwrap();
        write_tx(dir.path(), &cached_tx(1, 100));
        let mut stale = cached_tx(2, 101);
        stale.inbox = OTHER_INBOX;
        write_tx(dir.path(), &stale);

        let txs = load_cached_transactions(dir.path(), INBOX).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].inbox, INBOX);
    }

    #[test]
    fn ignores_non_json_files() {
        let dir = tempfile::tempdir().unwrap();
        write_tx(dir.path(), &cached_tx(1, 100));
        std::fs::write(dir.path().join("fetch.log"), b"not a tx").unwrap();

        assert_eq!(load_cached_transactions(dir.path(), INBOX).unwrap().len(), 1);
    }

    #[test]
    fn malformed_cache_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{").unwrap();

        assert!(load_cached_transactions(dir.path(), INBOX).is_err());
    }
}
