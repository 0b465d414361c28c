//! Utilities for recovering OP Stack span batch data from L1.
//!
//! The decoder works in two stages, mirroring how the batcher publishes
//! data: [`fetch`] scans an L1 block window for batcher transactions and
//! caches their frames on disk, and [`reassemble`] rebuilds channels from
//! the cache and exposes the L2 block ranges covered by the span batches
//! inside them.

pub mod batch;
pub mod blobs;
pub mod channel;
pub mod fetch;
pub mod frame;
pub mod reassemble;

pub use batch::{BatchReader, SpanBatchHead};
pub use blobs::BeaconClient;
pub use channel::Channel;
pub use fetch::{fetch_batches, FetchConfig};
pub use frame::Frame;
pub use reassemble::{get_span_batch_range, ReassembleConfig, SpanBatchRange};
