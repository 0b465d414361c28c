//! Durable proof request store.
//!
//! The store is the single source of truth for the scheduler: no request
//! state is held in memory across ticks, so a restarted proposer resumes
//! exactly where the database says it was.

mod client;
#[cfg(test)]
mod tests;

pub use client::ProofStore;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};

/// Lifecycle of a proof request. Transitions only move forward:
/// `Unrequested -> Requested -> (Complete | Failed)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize, Display, EnumString,
)]
#[repr(i16)]
pub enum RequestStatus {
    Unrequested = 0,
    Requested = 1,
    Complete = 2,
    Failed = 3,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize, Display, EnumString,
)]
#[repr(i16)]
pub enum RequestType {
    Span = 0,
    Aggregation = 1,
}

/// One row of the `proof_requests` table.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ProofRequest {
    pub id: i64,
    pub req_type: RequestType,
    /// Inclusive L2 block range covered by the proof.
    pub start_block: i64,
    pub end_block: i64,
    pub status: RequestStatus,
    /// Handle returned by the prover; set exactly once when the request is
    /// submitted.
    pub prover_request_id: Option<String>,
    /// Unix seconds at which the request entered `Requested`; drives the
    /// proof timeout.
    pub request_time: Option<i64>,
    pub proof: Option<Vec<u8>>,
    /// L1 checkpoint an aggregation proof commits against.
    pub l1_block_number: Option<i64>,
    pub l1_block_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProofRequest {
    /// Number of L2 blocks covered by this request.
    pub fn num_blocks(&self) -> i64 {
        self.end_block - self.start_block + 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request not found")]
    NotFound,
    #[error("{req_type} request overlapping [{start}, {end}] already exists")]
    Duplicate { req_type: RequestType, start: i64, end: i64 },
    #[error("illegal status transition for request {id}: {from} -> {to}")]
    IllegalTransition { id: i64, from: RequestStatus, to: RequestStatus },
    #[error("no complete span partition covering [{start}, {end}]")]
    MissingPartition { start: i64, end: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
