//! Span batch derivation: turning the next-to-prove watermark into
//! chunked SPAN proof requests.

use std::collections::HashSet;

use alloy_provider::Provider;
use anyhow::{Context, Result};
use batch_decoder::fetch::{fetch_batches, FetchConfig};
use batch_decoder::reassemble::{get_span_batch_range, ReassembleConfig, SpanBatchRange};
use tracing::{debug, info, warn};

use crate::db::{ProofStore, RequestType, StoreError};
use crate::proposer::Proposer;

impl<P> Proposer<P>
where
    P: Provider + Clone,
{
    /// Derives new span batch ranges from L1 data and inserts the chunked
    /// SPAN proof requests. Safe to re-run: the store rejects overlapping
    /// entries, so a restarted proposer converges on the same set.
    #[tracing::instrument(name = "proposer.derive_new_span_batches", skip(self))]
    pub async fn derive_new_span_batches(&self) -> Result<()> {
        // The watermark is the highest end block the store knows about;
        // an empty store starts from the last proposed output on chain.
        let latest_end_block = match self.db.get_latest_end_block().await {
            Ok(end) => end as u64,
            Err(StoreError::NotFound) => self
                .contract
                .latest_block_number()
                .await
                .context("failed to get latest proposed block number")?,
            Err(err) => return Err(err.into()),
        };
        let mut next_block = latest_end_block + 1;
        info!(next_block, "deriving span batches");

        self.fetch_batches_from_chain(next_block).await?;

        loop {
            let range = get_span_batch_range(
                &self.reassemble_config(),
                next_block,
                self.config.max_span_batch_deviation,
            )?;
            let (start, end) = match range {
                SpanBatchRange::Exhausted => {
                    info!(next_block, "no span batch found");
                    break;
                }
                SpanBatchRange::Found { start, end } => (start, end),
                SpanBatchRange::Overflowed { start, end } => {
                    info!(start, end, "max deviation exceeded, autofilling");
                    (start, end)
                }
            };

            // next_block should be the start of a new span batch; the gap
            // is autofilled below either way.
            if start != next_block {
                warn!(start, next_block, "span batch start does not match next block");
            }
            info!(start, end, "found span batch range");

            if end < next_block {
                warn!(start, end, next_block, "span batch range behind watermark, stopping");
                break;
            }
            insert_span_chunks(
                &self.db,
                next_block,
                end,
                self.config.max_block_range_per_span_proof,
            )
            .await?;

            next_block = end + 1;
        }

        Ok(())
    }

    /// Pulls all batcher transactions between the L1 origin of
    /// `next_block` and the finalized L1 head into the tx cache.
    pub(crate) async fn fetch_batches_from_chain(&self, next_block: u64) -> Result<()> {
        let rollup = self.contract.rollup();
        let l1_origin = rollup
            .l1_origin_of(next_block)
            .await
            .context("failed to get L1 origin of next block")?;
        let finalized_l1 = rollup.finalized_l1().await.context("failed to get sync status")?;

        if l1_origin > finalized_l1 {
            debug!(l1_origin, finalized_l1, "L1 origin not finalized yet, skipping fetch");
            return Ok(());
        }

        if let Some(beacon) = &self.beacon {
            beacon
                .get_version()
                .await
                .context("failed to check L1 Beacon API version")?;
        }

        let chain_id = self.contract.l1_chain_id().await?;
        let fetch_config = FetchConfig {
            start: l1_origin,
            end: finalized_l1,
            chain_id,
            batch_inbox: self.config.batch_inbox_address,
            batch_senders: HashSet::from([self.config.batcher_address]),
            out_directory: self.config.tx_cache_out_dir.clone(),
            concurrent_requests: self.config.batch_decoder_concurrent_reqs as usize,
        };

        info!(l1_origin, finalized_l1, "fetching batches from L1 origin to finalized L1");
        let (valid, invalid) =
            fetch_batches(&self.l1_provider, self.beacon.as_ref(), &fetch_config).await?;
        info!(valid, invalid, "fetched batches");
        Ok(())
    }

    fn reassemble_config(&self) -> ReassembleConfig {
        ReassembleConfig {
            in_directory: self.config.tx_cache_out_dir.clone(),
            batch_inbox: self.config.batch_inbox_address,
            l2_chain_id: self.config.l2_chain_id,
            l2_genesis_time: self.config.l2_genesis_timestamp,
            l2_genesis_block: self.config.l2_genesis_block,
            l2_block_time: self.config.l2_block_time,
        }
    }
}

/// Splits `[start, end]` into consecutive sub-ranges of at most
/// `max_range` blocks and inserts one SPAN entry per sub-range. Ranges the
/// store already tracks are skipped, which is what makes derivation
/// idempotent across ticks and restarts.
pub(crate) async fn insert_span_chunks(
    db: &ProofStore,
    start: u64,
    end: u64,
    max_range: u64,
) -> Result<()> {
    let mut tmp_start = start;
    loop {
        let max_end = tmp_start + max_range - 1;
        let tmp_end = max_end.min(end);

        match db.new_entry(RequestType::Span, tmp_start as i64, tmp_end as i64).await {
            Ok(id) => {
                info!(id, start = tmp_start, end = tmp_end, "inserted span proof request")
            }
            Err(StoreError::Duplicate { .. }) => {
                debug!(start = tmp_start, end = tmp_end, "span range already tracked")
            }
            Err(err) => return Err(err.into()),
        }

        if tmp_end == end {
            break;
        }
        tmp_start = tmp_end + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RequestStatus;

    #[tokio::test]
    async fn chunks_span_batch_range_by_max_proof_size() {
        let db = ProofStore::new("sqlite::memory:").await.unwrap();
        insert_span_chunks(&db, 1001, 1350, 100).await.unwrap();

        let entries = db.get_all_unrequested().await.unwrap();
        let ranges: Vec<(i64, i64)> =
            entries.iter().map(|r| (r.start_block, r.end_block)).collect();
        assert_eq!(ranges, vec![(1001, 1100), (1101, 1200), (1201, 1300), (1301, 1350)]);
        assert!(entries.iter().all(|r| r.status == RequestStatus::Unrequested));
    }

    #[tokio::test]
    async fn rederiving_the_same_range_adds_nothing() {
        let db = ProofStore::new("sqlite::memory:").await.unwrap();
        insert_span_chunks(&db, 1001, 1350, 100).await.unwrap();
        insert_span_chunks(&db, 1001, 1350, 100).await.unwrap();

        assert_eq!(db.get_all_unrequested().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn range_smaller_than_cap_is_one_chunk() {
        let db = ProofStore::new("sqlite::memory:").await.unwrap();
        insert_span_chunks(&db, 1001, 1010, 100).await.unwrap();

        let entries = db.get_all_unrequested().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].start_block, entries[0].end_block), (1001, 1010));
    }
}
