//! Parsing of channel frames out of batcher transaction data.

use serde::{Deserialize, Serialize};

/// Channel identifier shared by all frames of one channel.
pub type ChannelId = [u8; 16];

/// Version byte prefixing frame data in batcher transactions.
pub const DERIVATION_VERSION_0: u8 = 0;

/// Frames larger than this are rejected as malformed.
pub const MAX_FRAME_LEN: usize = 1_000_000;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseError {
    #[error("empty frame data")]
    Empty,
    #[error("unsupported derivation version: {0}")]
    UnsupportedVersion(u8),
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),
    #[error("frame data too large: {0} bytes")]
    DataTooLarge(usize),
    #[error("trailing bytes after last frame")]
    TrailingData,
}

/// A single channel frame as posted to the batch inbox.
///
/// Wire layout: `channel_id (16) ++ number (u16 be) ++ data_len (u32 be)
/// ++ data ++ is_last (1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: ChannelId,
    pub number: u16,
    pub data: alloy_primitives::Bytes,
    pub is_last: bool,
}

impl Frame {
    /// Decodes one frame from the front of `buf`, returning the number of
    /// bytes consumed.
    fn decode(buf: &[u8]) -> Result<(usize, Self), FrameParseError> {
        const HEADER_LEN: usize = 16 + 2 + 4;

        if buf.len() < HEADER_LEN + 1 {
            return Err(FrameParseError::Truncated(buf.len()));
        }
        let mut id = ChannelId::default();
        id.copy_from_slice(&buf[..16]);
        let number = u16::from_be_bytes([buf[16], buf[17]]);
        let data_len = u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]) as usize;

        if data_len > MAX_FRAME_LEN {
            return Err(FrameParseError::DataTooLarge(data_len));
        }
        if buf.len() < HEADER_LEN + data_len + 1 {
            return Err(FrameParseError::Truncated(buf.len()));
        }
        let data = buf[HEADER_LEN..HEADER_LEN + data_len].to_vec();
        let is_last = buf[HEADER_LEN + data_len] == 1;

        Ok((HEADER_LEN + data_len + 1, Self { id, number, data: data.into(), is_last }))
    }

    /// Parses the full on-chain serialization of one batcher transaction:
    /// a version byte followed by one or more concatenated frames. All
    /// frames must parse and no bytes may remain.
    pub fn parse_frames(encoded: &[u8]) -> Result<Vec<Self>, FrameParseError> {
        let Some(&version) = encoded.first() else {
            return Err(FrameParseError::Empty);
        };
        if version != DERIVATION_VERSION_0 {
            return Err(FrameParseError::UnsupportedVersion(version));
        }

        let buf = &encoded[1..];
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (consumed, frame) = Self::decode(&buf[offset..])?;
            frames.push(frame);
            offset += consumed;
        }
        if offset != buf.len() {
            return Err(FrameParseError::TrailingData);
        }
        if frames.is_empty() {
            return Err(FrameParseError::Empty);
        }
        Ok(frames)
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(23 + self.data.len());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.number.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.push(self.is_last as u8);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: u16, is_last: bool) -> Frame {
        Frame { id: [0xAB; 16], number, data: vec![0xCD; 40].into(), is_last }
    }

    #[test]
    fn parses_multiple_frames_from_one_tx() {
        let mut encoded = vec![DERIVATION_VERSION_0];
        encoded.extend_from_slice(&frame(0, false).encode());
        encoded.extend_from_slice(&frame(1, true).encode());

        let frames = Frame::parse_frames(&encoded).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frame(0, false));
        assert_eq!(frames[1], frame(1, true));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut encoded = vec![0x02];
        encoded.extend_from_slice(&frame(0, true).encode());
        assert_eq!(
            Frame::parse_frames(&encoded).unwrap_err(),
            FrameParseError::UnsupportedVersion(0x02)
        );
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut encoded = vec![DERIVATION_VERSION_0];
        let full = frame(0, true).encode();
        encoded.extend_from_slice(&full[..full.len() - 5]);
        assert!(matches!(
            Frame::parse_frames(&encoded).unwrap_err(),
            FrameParseError::Truncated(_)
        ));
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(Frame::parse_frames(&[]).unwrap_err(), FrameParseError::Empty);
        assert_eq!(
            Frame::parse_frames(&[DERIVATION_VERSION_0]).unwrap_err(),
            FrameParseError::Empty
        );
    }
}
