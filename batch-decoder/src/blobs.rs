//! L1 beacon API client and EIP-4844 blob payload decoding.
//!
//! Post-ecotone batcher transactions carry their frames in blob sidecars
//! instead of calldata. The sidecars are fetched from a beacon node by
//! slot, and each blob is decoded back into the byte stream the batcher
//! originally submitted.

use alloy_primitives::hex;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::sync::OnceCell;

/// Bytes per blob (4096 field elements of 32 bytes).
const BLOB_SIZE: usize = 4096 * 32;

/// Maximum payload a blob can carry: 4x31 data bytes plus 3 reassembled
/// bytes per round, minus the version/length header.
const MAX_BLOB_DATA_SIZE: usize = (4 * 31 + 3) * 1024 - 4;

const ENCODING_VERSION: u8 = 0;
const ROUNDS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BeaconClientError {
    #[error("beacon request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed beacon response: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BlobDecodeError {
    #[error("invalid blob size: {0}")]
    InvalidSize(usize),
    #[error("unsupported blob encoding version: {0}")]
    InvalidVersion(u8),
    #[error("blob payload length out of range: {0}")]
    InvalidLength(u32),
    #[error("field element has high-order bits set")]
    InvalidFieldElement,
}

#[derive(Deserialize)]
struct VersionResponse {
    data: VersionData,
}

#[derive(Deserialize)]
struct VersionData {
    version: String,
}

#[derive(Deserialize)]
struct GenesisResponse {
    data: GenesisData,
}

#[derive(Deserialize)]
struct GenesisData {
    genesis_time: String,
}

#[derive(Deserialize)]
struct SpecResponse {
    data: SpecData,
}

#[derive(Deserialize)]
struct SpecData {
    #[serde(rename = "SECONDS_PER_SLOT")]
    seconds_per_slot: String,
}

#[derive(Deserialize)]
struct SidecarResponse {
    data: Vec<RawBlobSidecar>,
}

#[derive(Deserialize)]
struct RawBlobSidecar {
    index: String,
    blob: String,
}

/// A blob sidecar fetched from the beacon node, keyed by its position in
/// the block's blob list.
#[derive(Debug, Clone)]
pub struct BlobSidecar {
    pub index: u64,
    pub blob: Vec<u8>,
}

/// Minimal REST client for the beacon endpoints the batch decoder needs.
#[derive(Debug, Clone)]
pub struct BeaconClient {
    http: Client,
    base: Url,
    slot_config: OnceCell<(u64, u64)>,
}

impl BeaconClient {
    pub fn new(http: Client, base: Url) -> Self {
        Self { http, base, slot_config: OnceCell::new() }
    }

    fn endpoint(&self, path: &str) -> Result<Url, BeaconClientError> {
        self.base.join(path).map_err(|e| BeaconClientError::Decode(e.to_string()))
    }

    /// Returns the node version string. Used as a reachability check
    /// before a fetch pass.
    pub async fn get_version(&self) -> Result<String, BeaconClientError> {
        let url = self.endpoint("eth/v1/node/version")?;
        let resp: VersionResponse =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(resp.data.version)
    }

    /// Maps an L1 execution block timestamp to its beacon slot, fetching
    /// genesis time and slot duration once on first use.
    pub async fn slot_for_timestamp(&self, timestamp: u64) -> Result<u64, BeaconClientError> {
        let (genesis_time, seconds_per_slot) = *self
            .slot_config
            .get_or_try_init(|| async {
                let genesis_url = self.endpoint("eth/v1/beacon/genesis")?;
                let genesis: GenesisResponse =
                    self.http.get(genesis_url).send().await?.error_for_status()?.json().await?;
                let spec_url = self.endpoint("eth/v1/config/spec")?;
                let spec: SpecResponse =
                    self.http.get(spec_url).send().await?.error_for_status()?.json().await?;

                let genesis_time: u64 = genesis
                    .data
                    .genesis_time
                    .parse()
                    .map_err(|_| BeaconClientError::Decode("genesis_time".into()))?;
                let seconds_per_slot: u64 = spec
                    .data
                    .seconds_per_slot
                    .parse()
                    .map_err(|_| BeaconClientError::Decode("SECONDS_PER_SLOT".into()))?;
                Ok::<_, BeaconClientError>((genesis_time, seconds_per_slot))
            })
            .await?;

        if timestamp < genesis_time {
            return Err(BeaconClientError::Decode(format!(
                "block timestamp {timestamp} predates beacon genesis {genesis_time}"
            )));
        }
        Ok((timestamp - genesis_time) / seconds_per_slot)
    }

    /// Fetches the blob sidecars at `slot` whose indices are listed in
    /// `indices`.
    pub async fn blob_sidecars(
        &self,
        slot: u64,
        indices: &[u64],
    ) -> Result<Vec<BlobSidecar>, BeaconClientError> {
        let mut url = self.endpoint(&format!("eth/v1/beacon/blob_sidecars/{slot}"))?;
        if !indices.is_empty() {
            let joined =
                indices.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
            url.query_pairs_mut().append_pair("indices", &joined);
        }
        let resp: SidecarResponse =
            self.http.get(url).send().await?.error_for_status()?.json().await?;

        resp.data
            .into_iter()
            .map(|sidecar| {
                let index = sidecar
                    .index
                    .parse()
                    .map_err(|_| BeaconClientError::Decode("sidecar index".into()))?;
                let blob = hex::decode(&sidecar.blob)
                    .map_err(|_| BeaconClientError::Decode("sidecar blob".into()))?;
                Ok(BlobSidecar { index, blob })
            })
            .collect()
    }
}

/// Decodes an op-stack encoded blob back into the batcher byte stream.
///
/// The encoding packs 127 bytes into every group of four field elements:
/// 31 bytes in the low bytes of each element plus three bytes reassembled
/// from the four 6-bit high nibbles. The first element additionally holds
/// the version byte and a 24-bit big-endian payload length.
pub fn blob_to_data(blob: &[u8]) -> Result<Vec<u8>, BlobDecodeError> {
    if blob.len() != BLOB_SIZE {
        return Err(BlobDecodeError::InvalidSize(blob.len()));
    }
    if blob[1] != ENCODING_VERSION {
        return Err(BlobDecodeError::InvalidVersion(blob[1]));
    }
    let output_len = u32::from_be_bytes([0, blob[2], blob[3], blob[4]]);
    if output_len as usize > MAX_BLOB_DATA_SIZE {
        return Err(BlobDecodeError::InvalidLength(output_len));
    }

    let mut output = vec![0u8; MAX_BLOB_DATA_SIZE];
    output[..27].copy_from_slice(&blob[5..32]);

    let mut opos: usize = 28;
    let mut ipos: usize = 32;
    let mut encoded = [0u8; 4];
    encoded[0] = blob[0];
    for item in encoded.iter_mut().skip(1) {
        (*item, opos, ipos) = decode_field_element(blob, opos, ipos, &mut output)?;
    }
    opos = reassemble_bytes(opos, &encoded, &mut output);

    for _ in 1..ROUNDS {
        if opos >= output_len as usize {
            break;
        }
        for item in encoded.iter_mut() {
            (*item, opos, ipos) = decode_field_element(blob, opos, ipos, &mut output)?;
        }
        opos = reassemble_bytes(opos, &encoded, &mut output);
    }

    output.truncate(output_len as usize);
    Ok(output)
}

/// Copies the 31 low bytes of the field element at `ipos` into the output
/// and returns its high-order byte.
fn decode_field_element(
    blob: &[u8],
    opos: usize,
    ipos: usize,
    output: &mut [u8],
) -> Result<(u8, usize, usize), BlobDecodeError> {
    // The two highest bits of each field element must be unset so the
    // element stays below the BLS modulus.
    if blob[ipos] & 0b1100_0000 != 0 {
        return Err(BlobDecodeError::InvalidFieldElement);
    }
    let end = (opos + 31).min(output.len());
    output[opos..end].copy_from_slice(&blob[ipos + 1..ipos + 1 + (end - opos)]);
    Ok((blob[ipos], opos + 32, ipos + 32))
}

/// Rebuilds the three bytes spread across the four 6-bit high nibbles of a
/// round and stores them in the gaps the field-element copies left.
fn reassemble_bytes(mut opos: usize, encoded: &[u8; 4], output: &mut [u8]) -> usize {
    opos -= 1;
    let x = (encoded[0] & 0b0011_1111) | ((encoded[1] & 0b0011_0000) << 2);
    let y = (encoded[1] & 0b0000_1111) | ((encoded[3] & 0b0000_1111) << 4);
    let z = (encoded[2] & 0b0011_1111) | ((encoded[3] & 0b0011_0000) << 2);
    output[opos - 32] = z;
    output[opos - 32 * 2] = y;
    output[opos - 32 * 3] = x;
    opos
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-only inverse of [`blob_to_data`].
    fn data_to_blob(data: &[u8]) -> Vec<u8> {
        assert!(data.len() <= MAX_BLOB_DATA_SIZE);
        let mut padded = vec![0u8; MAX_BLOB_DATA_SIZE];
        padded[..data.len()].copy_from_slice(data);

        let mut blob = vec![0u8; BLOB_SIZE];
        blob[1] = ENCODING_VERSION;
        blob[2..5].copy_from_slice(&(data.len() as u32).to_be_bytes()[1..]);
        blob[5..32].copy_from_slice(&padded[..27]);

        let read_gap = |at: usize| padded[at];
        // Round 0: gaps at 27, 59, 91 hold the reassembled bytes.
        let (x, y, z) = (read_gap(27), read_gap(59), read_gap(91));
        blob[0] = x & 0b0011_1111;
        blob[32] = ((x >> 2) & 0b0011_0000) | (y & 0b0000_1111);
        blob[64] = z & 0b0011_1111;
        blob[96] = ((z >> 2) & 0b0011_0000) | ((y >> 4) & 0b0000_1111);
        blob[33..64].copy_from_slice(&padded[28..59]);
        blob[65..96].copy_from_slice(&padded[60..91]);
        blob[97..128].copy_from_slice(&padded[92..123]);

        for round in 1..ROUNDS {
            let base = 123 + 127 * (round - 1);
            if base >= data.len() {
                break;
            }
            let iblob = 128 * round;
            let (x, y, z) = (read_gap(base + 31), read_gap(base + 63), read_gap(base + 95));
            blob[iblob] = x & 0b0011_1111;
            blob[iblob + 32] = ((x >> 2) & 0b0011_0000) | (y & 0b0000_1111);
            blob[iblob + 64] = z & 0b0011_1111;
            blob[iblob + 96] = ((z >> 2) & 0b0011_0000) | ((y >> 4) & 0b0000_1111);
            blob[iblob + 1..iblob + 32].copy_from_slice(&padded[base..base + 31]);
            blob[iblob + 33..iblob + 64].copy_from_slice(&padded[base + 32..base + 63]);
            blob[iblob + 65..iblob + 96].copy_from_slice(&padded[base + 64..base + 95]);
            blob[iblob + 97..iblob + 128].copy_from_slice(&padded[base + 96..base + 127]);
        }
        blob
    }

    #[test]
    fn decodes_single_round_payload() {
        let data: Vec<u8> = (0u8..=122).collect();
        let blob = data_to_blob(&data);
        assert_eq!(blob_to_data(&blob).unwrap(), data);
    }

    #[test]
    fn decodes_multi_round_payload() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let blob = data_to_blob(&data);
        assert_eq!(blob_to_data(&blob).unwrap(), data);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut blob = data_to_blob(&[1, 2, 3]);
        blob[1] = 7;
        assert_eq!(blob_to_data(&blob).unwrap_err(), BlobDecodeError::InvalidVersion(7));
    }

    #[test]
    fn rejects_high_bits_in_field_element() {
        let mut blob = data_to_blob(&[1, 2, 3]);
        blob[32] |= 0b1000_0000;
        assert_eq!(blob_to_data(&blob).unwrap_err(), BlobDecodeError::InvalidFieldElement);
    }

    #[test]
    fn rejects_wrong_blob_size() {
        assert!(matches!(blob_to_data(&[0u8; 64]), Err(BlobDecodeError::InvalidSize(64))));
    }
}
