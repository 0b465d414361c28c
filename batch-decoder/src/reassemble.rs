//! Channel reassembly and span batch range lookup over the tx cache.

use std::collections::HashMap;
use std::path::PathBuf;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::batch::BatchReader;
use crate::channel::Channel;
use crate::fetch::load_cached_transactions;
use crate::frame::ChannelId;

/// Parameters tying cached L1 data back to the L2 chain.
#[derive(Debug, Clone)]
pub struct ReassembleConfig {
    pub in_directory: PathBuf,
    pub batch_inbox: Address,
    pub l2_chain_id: u64,
    pub l2_genesis_time: u64,
    pub l2_genesis_block: u64,
    pub l2_block_time: u64,
}

/// Outcome of a span batch range lookup for a given L2 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanBatchRange {
    /// A span batch covering the block was found.
    Found { start: u64, end: u64 },
    /// No span batch covers the block and none starts within the
    /// deviation bound; derivation halts for this tick.
    Exhausted,
    /// The nearest span batch starts more than the allowed deviation past
    /// the block. The range is adopted anyway to force progress.
    Overflowed { start: u64, end: u64 },
}

/// Rebuilds channels from the cached batcher transactions and returns the
/// L2 block ranges of every span batch found, sorted by start block.
pub fn span_batch_ranges(config: &ReassembleConfig) -> Result<Vec<(u64, u64)>> {
    let txs = load_cached_transactions(&config.in_directory, config.batch_inbox)
        .context("failed to load tx cache")?;

    // Frames arrive in L1 order; channels are keyed by id and complete
    // independently of one another.
    let mut channels: HashMap<ChannelId, Channel> = HashMap::new();
    for tx in txs {
        for frame in tx.frames {
            channels.entry(frame.id).or_insert_with(|| Channel::new(frame.id)).add_frame(frame);
        }
    }

    let mut ranges = Vec::new();
    for channel in channels.values() {
        let Some(data) = channel.data() else {
            debug!(channel = %alloy_primitives::hex::encode(channel.id()), "channel incomplete, skipping");
            continue;
        };
        let mut reader = match BatchReader::new(&data) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(%err, "undecodable channel, skipping");
                continue;
            }
        };
        loop {
            match reader.next_span_batch() {
                Ok(Some(head)) => {
                    if head.rel_timestamp % config.l2_block_time != 0 {
                        warn!(
                            rel_timestamp = head.rel_timestamp,
                            "span batch timestamp not aligned to block time"
                        );
                    }
                    let start = config.l2_genesis_block + head.rel_timestamp / config.l2_block_time;
                    let end = start + head.block_count - 1;
                    debug!(
                        start,
                        end,
                        timestamp = config.l2_genesis_time + head.rel_timestamp,
                        l1_origin = head.l1_origin_num,
                        "decoded span batch"
                    );
                    ranges.push((start, end));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "malformed batch in channel, skipping rest");
                    break;
                }
            }
        }
    }

    ranges.sort_unstable();
    ranges.dedup();
    Ok(ranges)
}

/// Finds the span batch range relevant to `l2_block`.
///
/// A range containing the block wins. Otherwise the nearest range starting
/// after the block decides: within `max_deviation` the caller should wait
/// for the covering batch to land, beyond it the future range is adopted
/// to force progress past a gap the batcher will never fill.
pub fn get_span_batch_range(
    config: &ReassembleConfig,
    l2_block: u64,
    max_deviation: u64,
) -> Result<SpanBatchRange> {
    let ranges = span_batch_ranges(config)?;

    for &(start, end) in &ranges {
        if (start..=end).contains(&l2_block) {
            return Ok(SpanBatchRange::Found { start, end });
        }
    }

    let Some(&(start, end)) = ranges.iter().find(|(start, _)| *start > l2_block) else {
        return Ok(SpanBatchRange::Exhausted);
    };
    if start - l2_block > max_deviation {
        return Ok(SpanBatchRange::Overflowed { start, end });
    }
    Ok(SpanBatchRange::Exhausted)
}
