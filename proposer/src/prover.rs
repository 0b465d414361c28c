//! HTTP client for the external Kona prover service.
//!
//! The client is stateless and never retries; the scheduler decides what a
//! failure means for the request's lifecycle.

use std::time::Duration;

use alloy_primitives::B256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum ProverClientError {
    #[error("prover request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed prover response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("prover returned status {0}")]
    Remote(StatusCode),
}

/// Prover-side view of a proof, distinct from the request lifecycle in the
/// store. Anything the service reports other than fulfilled means the
/// proof is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    Fulfilled,
    Pending,
    Unknown,
}

impl ProofStatus {
    fn from_response(status: &str) -> Self {
        match status {
            "PROOF_FULFILLED" => Self::Fulfilled,
            "PROOF_PENDING" => Self::Pending,
            _ => Self::Unknown,
        }
    }
}

/// L1 head an aggregation proof commits against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Head {
    pub number: u64,
    pub hash: B256,
}

#[derive(Serialize)]
struct SpanProofRequest {
    start: u64,
    end: u64,
}

#[derive(Serialize)]
struct AggProofRequest {
    #[serde(serialize_with = "serialize_base64_vec")]
    subproofs: Vec<Vec<u8>>,
    head: L1Head,
}

#[derive(Deserialize)]
struct ProofResponse {
    id: String,
}

#[derive(Deserialize)]
struct ProofStatusResponse {
    status: String,
    #[serde(default, deserialize_with = "deserialize_base64")]
    proof: Vec<u8>,
}

/// Go's `[]byte` JSON representation: base64 strings on the wire.
fn serialize_base64_vec<S: Serializer>(bytes: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
    let encoded: Vec<String> = bytes.iter().map(|b| BASE64.encode(b)).collect();
    encoded.serialize(s)
}

fn deserialize_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let encoded = Option::<String>::deserialize(d)?;
    match encoded {
        None => Ok(Vec::new()),
        Some(encoded) => BASE64.decode(&encoded).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone)]
pub struct ProverClient {
    http: Client,
    base_url: Url,
}

impl ProverClient {
    /// `network_timeout` bounds every call to the service.
    pub fn new(base_url: Url, network_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(network_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { http, base_url }
    }

    /// Asks the prover for a span proof over the inclusive block range.
    pub async fn request_span_proof(
        &self,
        start: u64,
        end: u64,
    ) -> Result<String, ProverClientError> {
        self.request_proof(&SpanProofRequest { start, end }).await
    }

    /// Asks the prover for an aggregation proof over the given span proofs,
    /// anchored at the checkpointed L1 head.
    pub async fn request_agg_proof(
        &self,
        subproofs: Vec<Vec<u8>>,
        head: L1Head,
    ) -> Result<String, ProverClientError> {
        self.request_proof(&AggProofRequest { subproofs, head }).await
    }

    async fn request_proof<B: Serialize>(&self, body: &B) -> Result<String, ProverClientError> {
        let response = self.http.post(self.base_url.clone()).json(body).send().await?;
        if !response.status().is_success() {
            return Err(ProverClientError::Remote(response.status()));
        }
        let parsed: ProofResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(parsed.id)
    }

    /// Polls the prover for the state of a previously submitted request.
    pub async fn get_proof_status(
        &self,
        proof_id: &str,
    ) -> Result<(ProofStatus, Vec<u8>), ProverClientError> {
        let url = self
            .base_url
            .join(&format!("status/{proof_id}"))
            .expect("proof id is a path segment");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ProverClientError::Remote(response.status()));
        }
        let parsed: ProofStatusResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok((ProofStatus::from_response(&parsed.status), parsed.proof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_request_wire_shape() {
        let body = serde_json::to_value(SpanProofRequest { start: 1001, end: 1100 }).unwrap();
        assert_eq!(body, serde_json::json!({"start": 1001, "end": 1100}));
    }

    #[test]
    fn agg_request_encodes_subproofs_as_base64() {
        let body = serde_json::to_value(AggProofRequest {
            subproofs: vec![vec![1, 2, 3], vec![4, 5]],
            head: L1Head { number: 19_000_000, hash: B256::repeat_byte(0x11) },
        })
        .unwrap();

        assert_eq!(body["subproofs"][0], "AQID");
        assert_eq!(body["subproofs"][1], "BAU=");
        assert_eq!(body["head"]["number"], 19_000_000);
    }

    #[test]
    fn status_response_decodes_base64_proof() {
        let parsed: ProofStatusResponse =
            serde_json::from_str(r#"{"status": "PROOF_FULFILLED", "proof": "3q2+7w=="}"#).unwrap();
        assert_eq!(ProofStatus::from_response(&parsed.status), ProofStatus::Fulfilled);
        assert_eq!(parsed.proof, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn missing_proof_field_is_empty() {
        let parsed: ProofStatusResponse =
            serde_json::from_str(r#"{"status": "PROOF_PENDING"}"#).unwrap();
        assert_eq!(ProofStatus::from_response(&parsed.status), ProofStatus::Pending);
        assert!(parsed.proof.is_empty());
    }

    #[test]
    fn unrecognized_status_is_unknown() {
        assert_eq!(ProofStatus::from_response("PROOF_WITNESSGEN"), ProofStatus::Unknown);
    }
}
