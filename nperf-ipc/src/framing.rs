//! Length-Prefixed Slot Encoding
//!
//! A mailbox slot holds exactly one frame written at offset 0:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | rkyv payload     |
//! +----------------+------------------+
//! ```
//!
//! The whole frame must fit in the channel capacity.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use thiserror::Error;

/// Size of the length prefix in bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: {size} bytes (capacity {capacity} bytes)")]
    FrameTooLarge { size: usize, capacity: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Largest payload a channel of `capacity` bytes can carry
pub fn max_payload(capacity: usize) -> usize {
    capacity.saturating_sub(FRAME_HEADER_LEN)
}

/// Serialize a message into a complete frame (prefix + payload).
pub fn encode_frame<T>(message: &T, capacity: usize) -> Result<Vec<u8>, FrameError>
where
    T: Serialize<AllocSerializer<256>>,
{
    let payload =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;

    let len = payload.len();
    if len > max_payload(capacity) {
        return Err(FrameError::FrameTooLarge {
            size: len + FRAME_HEADER_LEN,
            capacity,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a length prefix read from a slot and return the payload length.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN], capacity: usize) -> Result<usize, FrameError> {
    let len = u32::from_le_bytes(header) as usize;

    if len > max_payload(capacity) {
        return Err(FrameError::FrameTooLarge {
            size: len + FRAME_HEADER_LEN,
            capacity,
        });
    }

    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }

    Ok(len)
}

/// Validate and deserialize a payload previously sized by [`frame_len`].
pub fn decode_payload<T>(payload: &AlignedVec) -> Result<T, FrameError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let archived = rkyv::check_archived_root::<T>(payload)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;

    archived
        .deserialize(&mut Infallible)
        .map_err(|e| FrameError::Deserialization(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExperimentMessage, Measurement};

    fn split(frame: &[u8]) -> ([u8; FRAME_HEADER_LEN], AlignedVec) {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let mut payload = AlignedVec::new();
        payload.extend_from_slice(&frame[FRAME_HEADER_LEN..]);
        (header, payload)
    }

    #[test]
    fn test_frame_decodes() {
        let original = ExperimentMessage::result(4, Measurement::new("hash", 1_200, 64));
        let frame = encode_frame(&original, 4096).unwrap();

        let (header, payload) = split(&frame);
        assert_eq!(frame_len(header, 4096).unwrap(), payload.len());

        let decoded: ExperimentMessage = decode_payload(&payload).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_frame_too_large_for_capacity() {
        let message = ExperimentMessage::error(0, "x".repeat(512));
        let result = encode_frame(&message, 128);
        assert!(matches!(
            result,
            Err(FrameError::FrameTooLarge { capacity: 128, .. })
        ));
    }

    #[test]
    fn test_declared_length_beyond_capacity_rejected() {
        let header = 1_000u32.to_le_bytes();
        assert!(matches!(
            frame_len(header, 256),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            frame_len([0; 4], 256),
            Err(FrameError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut payload = AlignedVec::new();
        payload.extend_from_slice(&[0xff; 7]);
        let result: Result<ExperimentMessage, _> = decode_payload(&payload);
        assert!(matches!(result, Err(FrameError::Deserialization(_))));
    }
}
