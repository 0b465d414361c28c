//! Reading span batches out of reassembled channel data.
//!
//! A channel's payload is a compressed stream of RLP byte strings, one per
//! batch. Only the span batch prefix is decoded here: range derivation
//! needs the relative timestamp and block count, not the transactions.

use alloy_primitives::Bytes;
use alloy_rlp::Decodable;
use miniz_oxide::inflate::decompress_to_vec_zlib;

/// Zlib CMF low-nibble values for the deflate method.
const ZLIB_DEFLATE_COMPRESSION_METHOD: u8 = 8;
const ZLIB_RESERVED_COMPRESSION_METHOD: u8 = 15;

/// Version byte introducing a brotli-compressed channel (Fjord).
const CHANNEL_VERSION_BROTLI: u8 = 1;

/// Batch version bytes inside the decompressed stream.
const SINGULAR_BATCH_TYPE: u8 = 0;
const SPAN_BATCH_TYPE: u8 = 1;

/// Decompressed channels larger than this are rejected.
const MAX_RLP_BYTES_PER_CHANNEL: usize = 10_000_000;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecodeError {
    #[error("empty channel data")]
    EmptyChannel,
    #[error("unknown channel compression type: {0:#04x}")]
    UnknownCompression(u8),
    #[error("channel decompression failed")]
    Decompression,
    #[error("decompressed channel exceeds {MAX_RLP_BYTES_PER_CHANNEL} bytes")]
    ChannelTooLarge,
    #[error("malformed batch envelope")]
    MalformedEnvelope,
    #[error("malformed span batch prefix")]
    MalformedPrefix,
}

/// The decoded head of a span batch: everything needed to place it on the
/// L2 chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanBatchHead {
    /// Timestamp of the first block, relative to L2 genesis.
    pub rel_timestamp: u64,
    /// L1 origin number of the last block in the span.
    pub l1_origin_num: u64,
    /// Number of L2 blocks in the span.
    pub block_count: u64,
}

/// Iteratively consumes batches from a reassembled channel payload.
#[derive(Debug)]
pub struct BatchReader {
    decompressed: Vec<u8>,
    cursor: usize,
}

impl BatchReader {
    /// Decompresses the channel payload, sniffing zlib vs brotli from the
    /// leading byte the way the channel bank does.
    pub fn new(channel_data: &[u8]) -> Result<Self, BatchDecodeError> {
        let Some(&version) = channel_data.first() else {
            return Err(BatchDecodeError::EmptyChannel);
        };

        let decompressed = if (version & 0x0F) == ZLIB_DEFLATE_COMPRESSION_METHOD
            || (version & 0x0F) == ZLIB_RESERVED_COMPRESSION_METHOD
        {
            decompress_to_vec_zlib(channel_data).map_err(|_| BatchDecodeError::Decompression)?
        } else if version == CHANNEL_VERSION_BROTLI {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(&channel_data[1..], 4096);
            std::io::Read::read_to_end(&mut reader, &mut out)
                .map_err(|_| BatchDecodeError::Decompression)?;
            out
        } else {
            return Err(BatchDecodeError::UnknownCompression(version));
        };

        if decompressed.len() > MAX_RLP_BYTES_PER_CHANNEL {
            return Err(BatchDecodeError::ChannelTooLarge);
        }

        Ok(Self { decompressed, cursor: 0 })
    }

    /// Returns the head of the next span batch in the channel, skipping
    /// singular batches. `None` once the payload is exhausted.
    pub fn next_span_batch(&mut self) -> Result<Option<SpanBatchHead>, BatchDecodeError> {
        while self.cursor < self.decompressed.len() {
            let mut reader = &self.decompressed[self.cursor..];
            let envelope =
                Bytes::decode(&mut reader).map_err(|_| BatchDecodeError::MalformedEnvelope)?;
            self.cursor = self.decompressed.len() - reader.len();

            match envelope.first() {
                Some(&SPAN_BATCH_TYPE) => {
                    return decode_span_batch_head(&envelope[1..]).map(Some);
                }
                Some(&SINGULAR_BATCH_TYPE) => continue,
                _ => return Err(BatchDecodeError::MalformedEnvelope),
            }
        }
        Ok(None)
    }
}

/// Decodes the span batch prefix and the leading payload field:
/// `rel_timestamp ++ l1_origin_num ++ parent_check (20) ++
/// l1_origin_check (20) ++ block_count ++ ...`.
fn decode_span_batch_head(mut buf: &[u8]) -> Result<SpanBatchHead, BatchDecodeError> {
    let rel_timestamp = read_uvarint(&mut buf)?;
    let l1_origin_num = read_uvarint(&mut buf)?;
    if buf.len() < 40 {
        return Err(BatchDecodeError::MalformedPrefix);
    }
    buf = &buf[40..];
    let block_count = read_uvarint(&mut buf)?;
    if block_count == 0 {
        return Err(BatchDecodeError::MalformedPrefix);
    }
    Ok(SpanBatchHead { rel_timestamp, l1_origin_num, block_count })
}

/// Reads an unsigned LEB128 varint, the encoding Go's `binary.Uvarint`
/// produces for span batch fields.
fn read_uvarint(buf: &mut &[u8]) -> Result<u64, BatchDecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(BatchDecodeError::MalformedPrefix);
        };
        *buf = rest;
        if shift >= 64 {
            return Err(BatchDecodeError::MalformedPrefix);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
