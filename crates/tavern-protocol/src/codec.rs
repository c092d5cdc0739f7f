//! Codec trait and the JSON implementation.
//!
//! The connection handler never touches `serde_json` directly: it asks a
//! [`Codec`] to turn frames into [`ClientEvent`](crate::ClientEvent)s and
//! [`ServerEvent`](crate::ServerEvent)s back into frames.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to frame bytes and decodes frame bytes to values.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into one frame.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value can't be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes one frame.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] producing JSON frames, the format browser clients speak.
///
/// ```rust
/// use tavern_protocol::{Codec, JsonCodec, ServerEvent, RoomId};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&ServerEvent::SessionReady(RoomId::from("R1"))).unwrap();
/// assert_eq!(bytes, br#"{"event":"session-ready","args":"R1"}"#);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
