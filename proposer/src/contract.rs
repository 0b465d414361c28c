//! Read-only facade over the L2 output oracle and the rollup node RPC.

use alloy_primitives::{Address, B256};
use alloy_provider::Provider;
use alloy_sol_types::sol;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

sol! {
    #[sol(rpc)]
    interface IL2OutputOracle {
        function latestOutputIndex() external view returns (uint256);
        function nextOutputIndex() external view returns (uint256);
        function latestBlockNumber() external view returns (uint256);
        function startingBlockNumber() external view returns (uint256);
        function SUBMISSION_INTERVAL() external view returns (uint256);
    }
}

/// Finalized L1 block reference used to checkpoint aggregation proofs.
#[derive(Debug, Clone, Copy)]
pub struct L1BlockRef {
    pub number: u64,
    pub hash: B256,
}

/// `optimism_outputAtBlock` response, reduced to the fields the proposer
/// reads.
#[derive(Debug, Deserialize)]
struct OutputAtBlockResponse {
    #[serde(rename = "blockRef")]
    block_ref: L2BlockRef,
}

#[derive(Debug, Deserialize)]
struct L2BlockRef {
    #[serde(rename = "l1origin")]
    l1_origin: BlockId,
}

#[derive(Debug, Deserialize)]
struct BlockId {
    number: u64,
}

/// `optimism_syncStatus` response, reduced likewise.
#[derive(Debug, Deserialize)]
struct SyncStatusResponse {
    finalized_l1: L1BlockId,
}

#[derive(Debug, Deserialize)]
struct L1BlockId {
    number: u64,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

/// JSON-RPC client for the rollup node (op-node) endpoints the derivation
/// loop needs.
#[derive(Debug, Clone)]
pub struct RollupClient {
    http: Client,
    url: Url,
}

impl RollupClient {
    pub fn new(url: Url, network_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(network_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { http, url }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;
        let envelope: RpcEnvelope<T> =
            response.json().await.with_context(|| format!("malformed {method} response"))?;
        if let Some(error) = envelope.error {
            return Err(anyhow!("{method} returned error: {error}"));
        }
        envelope.result.ok_or_else(|| anyhow!("{method} returned no result"))
    }

    /// L1 origin block number of the given L2 block.
    pub async fn l1_origin_of(&self, l2_block: u64) -> Result<u64> {
        let output: OutputAtBlockResponse = self
            .call("optimism_outputAtBlock", serde_json::json!([format!("{l2_block:#x}")]))
            .await?;
        Ok(output.block_ref.l1_origin.number)
    }

    /// Finalized L1 block number according to the rollup node.
    pub async fn finalized_l1(&self) -> Result<u64> {
        let status: SyncStatusResponse =
            self.call("optimism_syncStatus", serde_json::json!([])).await?;
        Ok(status.finalized_l1.number)
    }
}

/// Thin read-only adapter over the on-chain output oracle plus the rollup
/// node. All scheduler decisions about block ranges flow through here.
#[derive(Clone)]
pub struct ContractAdapter<P>
where
    P: Provider + Clone,
{
    l1_provider: P,
    l2oo: IL2OutputOracle::IL2OutputOracleInstance<P>,
    rollup: RollupClient,
}

impl<P> ContractAdapter<P>
where
    P: Provider + Clone,
{
    pub fn new(l1_provider: P, l2oo_address: Address, rollup: RollupClient) -> Self {
        let l2oo = IL2OutputOracle::new(l2oo_address, l1_provider.clone());
        Self { l1_provider, l2oo, rollup }
    }

    pub fn rollup(&self) -> &RollupClient {
        &self.rollup
    }

    /// Highest L2 block number with a proposed output.
    pub async fn latest_block_number(&self) -> Result<u64> {
        let number = self.l2oo.latestBlockNumber().call().await?;
        Ok(number.to::<u64>())
    }

    pub async fn latest_output_index(&self) -> Result<u64> {
        let index = self.l2oo.latestOutputIndex().call().await?;
        Ok(index.to::<u64>())
    }

    pub async fn next_output_index(&self) -> Result<u64> {
        let index = self.l2oo.nextOutputIndex().call().await?;
        Ok(index.to::<u64>())
    }

    /// L2 block number at which the output with the given index ends.
    ///
    /// The oracle accepts outputs at fixed intervals from its starting
    /// block, so the mapping is arithmetic rather than a per-index call.
    pub async fn block_number_at_output_index(&self, index: u64) -> Result<u64> {
        let starting = self.l2oo.startingBlockNumber().call().await?.to::<u64>();
        let interval = self.l2oo.SUBMISSION_INTERVAL().call().await?.to::<u64>();
        Ok(starting + index * interval)
    }

    /// Current finalized L1 header, checkpointed into AGG entries before
    /// submission.
    pub async fn finalized_l1_block(&self) -> Result<L1BlockRef> {
        let block = self
            .l1_provider
            .get_block_by_number(alloy_eips::BlockNumberOrTag::Finalized)
            .await
            .map_err(|e| anyhow!("failed to fetch finalized L1 block: {e}"))?
            .context("no finalized L1 block available")?;
        Ok(L1BlockRef { number: block.header.number, hash: block.header.hash })
    }

    pub async fn l1_chain_id(&self) -> Result<u64> {
        self.l1_provider.get_chain_id().await.map_err(|e| anyhow!("failed to get chain id: {e}"))
    }
}
