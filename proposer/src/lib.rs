//! Proof orchestration core for an L2 output proposer.
//!
//! A periodic scheduler derives L2 block ranges to prove from on-chain
//! state and L1 batch data, schedules SPAN and AGG proofs against an
//! external Kona prover service, tracks every request's lifecycle in a
//! durable store, and recovers from timeouts by splitting or re-queueing
//! work. Proof generation is expensive; the store is the single source of
//! truth so a restart resumes exactly where the database says it was.

pub mod contract;
pub mod db;
pub mod env;
pub mod logger;
pub mod proposer;
pub mod prover;
pub mod span_batches;

pub use contract::{ContractAdapter, L1BlockRef, RollupClient};
pub use db::{ProofRequest, ProofStore, RequestStatus, RequestType, StoreError};
pub use env::{read_proposer_env, ProposerConfig};
pub use logger::setup_proposer_logger;
pub use proposer::Proposer;
pub use prover::{L1Head, ProofStatus, ProverClient, ProverClientError};
