use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::view::conical::{ConicalFrustumError, ConicalView, ConicalViewFrustum};

/// Most simultaneous viewpoints one observer may report (eyes, cameras)
pub const MAX_FRUSTUMS_PER_VIEW: usize = 8;

/// Upper bound on an encoded observer message, checked before decoding
pub const MAX_OBSERVER_MESSAGE_BYTES: usize = 1024;

/// Messages from observer to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObserverMessage {
    /// Current viewpoints; replaces any earlier report
    ViewState {
        /// Monotonic per observer; stale reports are ignored
        sequence: u64,
        frustums: Vec<ConicalViewFrustum>,
    },
    /// Client-side cap on packets per second (0 = uncapped)
    MaxPacketsPerSecond(u32),
    /// Observer is going away
    Leave,
}

impl ObserverMessage {
    pub fn view_state(sequence: u64, view: &ConicalView) -> Self {
        Self::ViewState {
            sequence,
            frustums: view.iter().copied().collect(),
        }
    }
}

/// Errors turning received bytes into a usable view
#[derive(Debug, thiserror::Error)]
pub enum ViewStateError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid frustum: {0}")]
    Frustum(#[from] ConicalFrustumError),
    #[error("view state has {count} frustums, at most {max} allowed")]
    TooManyFrustums { count: usize, max: usize },
    #[error("observer message of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// Decode and validate one observer message
///
/// Frustum records are validated during decoding, so a `ViewState` that
/// comes back is safe to score against.
pub fn decode_observer_message(
    data: &[u8],
    max_frustums: usize,
) -> Result<ObserverMessage, ViewStateError> {
    if data.len() > MAX_OBSERVER_MESSAGE_BYTES {
        return Err(ViewStateError::Oversized(data.len()));
    }
    let message: ObserverMessage = decode(data)?;
    if let ObserverMessage::ViewState { frustums, .. } = &message {
        if frustums.len() > max_frustums {
            return Err(ViewStateError::TooManyFrustums {
                count: frustums.len(),
                max: max_frustums,
            });
        }
    }
    Ok(message)
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers, so a frustum record is a flat 36 bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    decode_prefix(data).map(|(msg, _)| msg)
}

/// Decode one message from the front of `data`, returning bytes consumed
pub fn decode_prefix<T: DeserializeOwned>(data: &[u8]) -> Result<(T, usize), DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec3::Vec3;
    use crate::view::conical::SERIALIZED_SIZE;

    fn frustum(z: f32) -> ConicalViewFrustum {
        ConicalViewFrustum::new(Vec3::new(0.0, 0.0, z), Vec3::Z, 0.6, 2.0, 500.0).unwrap()
    }

    #[test]
    fn test_view_state_round_trip() {
        let msg = ObserverMessage::ViewState {
            sequence: 42,
            frustums: vec![frustum(0.0), frustum(1.0)],
        };
        let encoded = encode(&msg).unwrap();
        // variant tag + sequence + vec length + records
        assert_eq!(encoded.len(), 4 + 8 + 8 + 2 * SERIALIZED_SIZE);

        let decoded = decode_observer_message(&encoded, MAX_FRUSTUMS_PER_VIEW).unwrap();
        match decoded {
            ObserverMessage::ViewState { sequence, frustums } => {
                assert_eq!(sequence, 42);
                assert_eq!(frustums.len(), 2);
                assert!(frustums[1].is_very_similar(&frustum(1.0)));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_view_state_from_conical_view() {
        let mut view = ConicalView::new();
        view.set_conical([frustum(3.0)]);
        let msg = ObserverMessage::view_state(7, &view);
        assert_eq!(
            msg,
            ObserverMessage::ViewState {
                sequence: 7,
                frustums: vec![frustum(3.0)],
            }
        );
    }

    #[test]
    fn test_max_packets_message() {
        let encoded = encode(&ObserverMessage::MaxPacketsPerSecond(90)).unwrap();
        let decoded: ObserverMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, ObserverMessage::MaxPacketsPerSecond(90));
    }

    #[test]
    fn test_too_many_frustums_rejected() {
        let msg = ObserverMessage::ViewState {
            sequence: 1,
            frustums: vec![frustum(0.0); 3],
        };
        let encoded = encode(&msg).unwrap();
        assert!(matches!(
            decode_observer_message(&encoded, 2),
            Err(ViewStateError::TooManyFrustums { count: 3, max: 2 })
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let garbage = vec![0u8; MAX_OBSERVER_MESSAGE_BYTES + 1];
        assert!(matches!(
            decode_observer_message(&garbage, MAX_FRUSTUMS_PER_VIEW),
            Err(ViewStateError::Oversized(_))
        ));
    }

    #[test]
    fn test_invalid_frustum_in_message_rejected() {
        let msg = ObserverMessage::ViewState {
            sequence: 1,
            frustums: vec![frustum(0.0)],
        };
        let mut encoded = encode(&msg).unwrap();
        // angle field of the first record
        let angle_offset = 4 + 8 + 8 + 6 * 4;
        encoded[angle_offset..angle_offset + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(matches!(
            decode_observer_message(&encoded, MAX_FRUSTUMS_PER_VIEW),
            Err(ViewStateError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let mut bytes = encode(&ObserverMessage::Leave).unwrap();
        let leave_len = bytes.len();
        bytes.extend_from_slice(&[0xAB; 5]);
        let (msg, consumed): (ObserverMessage, usize) = decode_prefix(&bytes).unwrap();
        assert_eq!(msg, ObserverMessage::Leave);
        assert_eq!(consumed, leave_len);
    }

    #[test]
    fn test_invalid_decode() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        let result: Result<ObserverMessage, _> = decode(&garbage);
        assert!(result.is_err());
    }
}
