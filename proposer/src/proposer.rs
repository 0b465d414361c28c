//! The scheduler: a periodic loop driving the proof pipeline.
//!
//! Every tick runs four phases in order: derive new span ranges from L1,
//! promote complete span chains to aggregation requests, submit
//! unrequested entries to the prover, and poll pending entries for
//! completion or timeout. The store is the only shared state; workers
//! carry copies of their entries and rely on the store's compare-and-swap
//! transitions to stay out of each other's way.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::B256;
use alloy_provider::Provider;
use anyhow::{anyhow, Context, Result};
use batch_decoder::blobs::BeaconClient;
use futures_util::{stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::contract::{ContractAdapter, RollupClient};
use crate::db::{ProofRequest, ProofStore, RequestStatus, RequestType, StoreError};
use crate::env::ProposerConfig;
use crate::prover::{L1Head, ProofStatus, ProverClient};

/// Seconds to pause after a failed loop iteration before retrying.
const ERROR_BACKOFF_SECS: u64 = 10;

pub struct Proposer<P>
where
    P: Provider + Clone,
{
    pub(crate) config: ProposerConfig,
    pub(crate) db: Arc<ProofStore>,
    pub(crate) prover: ProverClient,
    pub(crate) contract: ContractAdapter<P>,
    pub(crate) l1_provider: P,
    pub(crate) beacon: Option<BeaconClient>,
}

impl<P> Proposer<P>
where
    P: Provider + Clone,
{
    pub fn new(config: ProposerConfig, db: Arc<ProofStore>, l1_provider: P) -> Self {
        let network_timeout = Duration::from_secs(config.network_timeout);
        let prover = ProverClient::new(config.kona_server_url.clone(), network_timeout);
        let rollup = RollupClient::new(config.l2_node_rpc.clone(), network_timeout);
        let contract = ContractAdapter::new(l1_provider.clone(), config.l2oo_address, rollup);
        let beacon = config.beacon_rpc.clone().map(|url| {
            let http = reqwest::Client::builder()
                .timeout(network_timeout)
                .build()
                .expect("reqwest client construction cannot fail with static config");
            BeaconClient::new(http, url)
        });

        Self { config, db, prover, contract, l1_provider, beacon }
    }

    #[tracing::instrument(name = "proposer.run", skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!(
            loop_interval = self.config.loop_interval,
            max_proof_time = self.config.max_proof_time,
            max_block_range = self.config.max_block_range_per_span_proof,
            "starting proposer loop"
        );

        loop {
            match self.run_loop_iteration().await {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_secs(self.config.loop_interval)).await;
                }
                Err(err) => {
                    error!("error in proposer loop: {err:?}");
                    tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECS)).await;
                }
            }
        }
    }

    /// Run a single tick of the proposer.
    async fn run_loop_iteration(&self) -> Result<()> {
        // Derive new span proof requests from L1 batch data.
        self.derive_new_span_batches().await?;

        // Promote contiguous complete spans to an aggregation request.
        self.derive_agg_proofs().await?;

        // Submit everything unrequested to the prover.
        self.request_queued_proofs().await?;

        // Poll the prover for pending requests and recover timeouts.
        self.process_pending_proofs().await?;

        Ok(())
    }

    /// Uses the output oracle to determine the range the next proposal
    /// must cover, and queues an AGG request once complete spans reach it.
    #[tracing::instrument(name = "proposer.derive_agg_proofs", skip(self))]
    pub async fn derive_agg_proofs(&self) -> Result<()> {
        let latest_index = self
            .contract
            .latest_output_index()
            .await
            .context("failed to get latest output index")?;
        let next_index = self
            .contract
            .next_output_index()
            .await
            .context("failed to get next output index")?;

        let from = self.contract.block_number_at_output_index(latest_index).await? + 1;
        let min_to = self.contract.block_number_at_output_index(next_index).await?;

        if let Some((start, end)) = self
            .db
            .try_create_agg_proof_from_span_proofs(from as i64, min_to as i64)
            .await
            .context("failed to create agg proof from span proofs")?
        {
            info!(start, end, "queued aggregation proof request");
        }
        Ok(())
    }

    /// Submits every unrequested entry to the prover, at most
    /// `max_concurrent_proof_requests` in flight at once.
    #[tracing::instrument(name = "proposer.request_queued_proofs", skip(self))]
    pub async fn request_queued_proofs(&self) -> Result<()> {
        let unrequested = self.db.get_all_unrequested().await?;
        if unrequested.is_empty() {
            return Ok(());
        }

        // A fresh AGG entry gets its L1 checkpoint on first pickup; the
        // prover and the eventual on-chain submission must agree on it.
        for request in &unrequested {
            if request.req_type == RequestType::Aggregation && request.l1_block_number.is_none() {
                let l1_head = self
                    .contract
                    .finalized_l1_block()
                    .await
                    .context("failed to checkpoint block hash")?;
                self.db
                    .add_l1_block_info(
                        request.start_block,
                        request.end_block,
                        l1_head.number as i64,
                        &l1_head.hash.to_string(),
                    )
                    .await?;
                info!(
                    request_id = request.id,
                    l1_block = l1_head.number,
                    "checkpointed L1 head for aggregation proof"
                );
            }
        }

        let results: Vec<Result<()>> = stream::iter(unrequested)
            .map(|request| self.submit_request(request))
            .buffer_unordered(self.config.max_concurrent_proof_requests as usize)
            .collect()
            .await;
        for result in results {
            if let Err(err) = result {
                error!("proof submission worker failed: {err:?}");
            }
        }
        Ok(())
    }

    /// Worker for a single unrequested entry: claim it, submit it to the
    /// prover, record the handle. A submission failure fails the entry;
    /// derivation and timeout recovery produce its replacement.
    async fn submit_request(&self, request: ProofRequest) -> Result<()> {
        match self.db.update_status(request.id, RequestStatus::Requested).await {
            Ok(()) => {}
            Err(StoreError::IllegalTransition { .. }) => {
                // Another worker claimed this entry first.
                debug!(request_id = request.id, "request already claimed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            request_id = request.id,
            req_type = %request.req_type,
            start_block = request.start_block,
            end_block = request.end_block,
            "requesting proof"
        );

        match self.request_prover_proof(&request).await {
            Ok(proof_id) => {
                self.db.set_prover_request_id(request.id, &proof_id).await?;
                info!(request_id = request.id, proof_id, "proof requested");
            }
            Err(err) => {
                error!(
                    request_id = request.id,
                    req_type = %request.req_type,
                    start_block = request.start_block,
                    end_block = request.end_block,
                    "failed to request proof: {err:?}"
                );
                if let Err(revert_err) =
                    self.db.update_status(request.id, RequestStatus::Failed).await
                {
                    error!(request_id = request.id, "failed to fail proof request: {revert_err:?}");
                }
            }
        }
        Ok(())
    }

    async fn request_prover_proof(&self, request: &ProofRequest) -> Result<String> {
        match request.req_type {
            RequestType::Span => Ok(self
                .prover
                .request_span_proof(request.start_block as u64, request.end_block as u64)
                .await?),
            RequestType::Aggregation => {
                // Re-read the entry: the L1 checkpoint was attached after
                // the phase snapshot was taken.
                let request = self.db.fetch_request(request.id).await?;
                let l1_number = request
                    .l1_block_number
                    .ok_or_else(|| anyhow!("aggregation entry has no L1 checkpoint"))?;
                let l1_hash = request
                    .l1_block_hash
                    .as_deref()
                    .ok_or_else(|| anyhow!("aggregation entry has no L1 checkpoint hash"))?;
                let head = L1Head {
                    number: l1_number as u64,
                    hash: B256::from_str(l1_hash).context("malformed L1 checkpoint hash")?,
                };
                let subproofs =
                    self.db.get_subproofs(request.start_block, request.end_block).await?;
                Ok(self.prover.request_agg_proof(subproofs, head).await?)
            }
        }
    }

    /// Polls every pending entry and applies timeout recovery.
    #[tracing::instrument(name = "proposer.process_pending_proofs", skip(self))]
    pub async fn process_pending_proofs(&self) -> Result<()> {
        let pending = self.db.get_all_pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        let now = unix_now()?;

        let results: Vec<Result<()>> = stream::iter(pending)
            .map(|request| self.process_pending_request(request, now))
            .buffer_unordered(self.config.max_concurrent_proof_requests as usize)
            .collect()
            .await;
        for result in results {
            if let Err(err) = result {
                error!("proof polling worker failed: {err:?}");
            }
        }
        Ok(())
    }

    /// Worker for a single pending entry: fetch the prover status, store a
    /// fulfilled proof, or fail and recover the entry once it exceeds
    /// `max_proof_time`.
    async fn process_pending_request(&self, request: ProofRequest, now: i64) -> Result<()> {
        if let Some(proof_id) = request.prover_request_id.as_deref() {
            match self.prover.get_proof_status(proof_id).await {
                Ok((ProofStatus::Fulfilled, proof)) if !proof.is_empty() => {
                    self.db.add_proof(request.id, &proof).await?;
                    info!(
                        request_id = request.id,
                        req_type = %request.req_type,
                        start_block = request.start_block,
                        end_block = request.end_block,
                        "proof complete"
                    );
                    return Ok(());
                }
                Ok((ProofStatus::Fulfilled, _)) => {
                    warn!(request_id = request.id, "prover reported fulfilled without proof bytes");
                }
                Ok(_) => {}
                // Polling errors leave the entry pending; the next tick
                // retries and the timeout eventually recovers it.
                Err(err) => {
                    warn!(request_id = request.id, "failed to poll proof status: {err:?}");
                }
            }
        } else {
            // Submission was interrupted between claiming the entry and
            // recording the handle; only the timeout can recover it.
            warn!(
                request_id = request.id,
                start_block = request.start_block,
                end_block = request.end_block,
                "pending request has no prover request id"
            );
        }

        let Some(request_time) = request.request_time else {
            return Ok(());
        };
        if now - request_time > self.config.max_proof_time as i64 {
            warn!(
                request_id = request.id,
                req_type = %request.req_type,
                start_block = request.start_block,
                end_block = request.end_block,
                "proof request timed out"
            );
            match self.db.update_status(request.id, RequestStatus::Failed).await {
                Ok(()) => recover_timed_out_request(&self.db, &request).await?,
                // The proof landed between the poll and the timeout check.
                Err(StoreError::IllegalTransition { .. }) => {
                    debug!(request_id = request.id, "request completed before timeout took effect")
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Creates the replacement entries for a timed-out request.
///
/// A SPAN timeout is assumed to mean the range was too expensive, so the
/// range is split at its midpoint. An AGG timeout is assumed transient —
/// its range is fixed by the on-chain outputs — so the same range is
/// re-queued. A single-block SPAN cannot be split further and is left
/// failed for the operator.
pub(crate) async fn recover_timed_out_request(
    db: &ProofStore,
    request: &ProofRequest,
) -> Result<()> {
    match request.req_type {
        RequestType::Aggregation => {
            new_recovery_entry(db, RequestType::Aggregation, request.start_block, request.end_block)
                .await
        }
        RequestType::Span => {
            if request.num_blocks() < 2 {
                error!(
                    request_id = request.id,
                    block = request.start_block,
                    "span proof over a single block timed out; cannot split further"
                );
                return Ok(());
            }
            let mid = request.start_block + (request.end_block - request.start_block) / 2;
            new_recovery_entry(db, RequestType::Span, request.start_block, mid).await?;
            new_recovery_entry(db, RequestType::Span, mid + 1, request.end_block).await
        }
    }
}

async fn new_recovery_entry(
    db: &ProofStore,
    req_type: RequestType,
    start: i64,
    end: i64,
) -> Result<()> {
    match db.new_entry(req_type, start, end).await {
        Ok(id) => {
            info!(id, %req_type, start, end, "queued recovery proof request");
            Ok(())
        }
        Err(StoreError::Duplicate { .. }) => {
            debug!(%req_type, start, end, "recovery range already tracked");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn unix_now() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH).context("system clock before epoch")?.as_secs()
        as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ProofStore {
        ProofStore::new("sqlite::memory:").await.unwrap()
    }

    async fn failed_request(
        db: &ProofStore,
        req_type: RequestType,
        start: i64,
        end: i64,
    ) -> ProofRequest {
        let id = db.new_entry(req_type, start, end).await.unwrap();
        db.update_status(id, RequestStatus::Requested).await.unwrap();
        db.update_status(id, RequestStatus::Failed).await.unwrap();
        db.fetch_request(id).await.unwrap()
    }

    #[tokio::test]
    async fn timed_out_span_splits_at_midpoint() {
        let db = store().await;
        let request = failed_request(&db, RequestType::Span, 1001, 1100).await;

        recover_timed_out_request(&db, &request).await.unwrap();

        let ranges: Vec<(i64, i64)> = db
            .get_all_unrequested()
            .await
            .unwrap()
            .iter()
            .map(|r| (r.start_block, r.end_block))
            .collect();
        assert_eq!(ranges, vec![(1001, 1050), (1051, 1100)]);
    }

    #[tokio::test]
    async fn split_halves_union_to_the_original_range() {
        let db = store().await;
        // Odd-sized range: the halves still tile it exactly.
        let request = failed_request(&db, RequestType::Span, 10, 20).await;

        recover_timed_out_request(&db, &request).await.unwrap();

        let entries = db.get_all_unrequested().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].start_block, 10);
        assert_eq!(entries[0].end_block + 1, entries[1].start_block);
        assert_eq!(entries[1].end_block, 20);
    }

    #[tokio::test]
    async fn timed_out_agg_is_requeued_whole() {
        let db = store().await;
        // Complete spans backing the aggregation stay untouched.
        for (start, end) in [(1001, 1100), (1101, 1200), (1201, 1300)] {
            let id = db.new_entry(RequestType::Span, start, end).await.unwrap();
            db.update_status(id, RequestStatus::Requested).await.unwrap();
            db.add_proof(id, b"proof").await.unwrap();
        }
        let request = failed_request(&db, RequestType::Aggregation, 1001, 1300).await;

        recover_timed_out_request(&db, &request).await.unwrap();

        let unrequested = db.get_all_unrequested().await.unwrap();
        assert_eq!(unrequested.len(), 1);
        assert_eq!(unrequested[0].req_type, RequestType::Aggregation);
        assert_eq!((unrequested[0].start_block, unrequested[0].end_block), (1001, 1300));
        assert_eq!(db.get_subproofs(1001, 1300).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn single_block_span_is_not_split() {
        let db = store().await;
        let request = failed_request(&db, RequestType::Span, 1001, 1001).await;

        recover_timed_out_request(&db, &request).await.unwrap();

        assert!(db.get_all_unrequested().await.unwrap().is_empty());
    }
}
