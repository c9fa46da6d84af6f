//! Payload codecs.
//!
//! Envelopes, saga records and timeout records are turned into opaque byte
//! blobs before they reach the store. The host picks the wire format by
//! supplying a [`Codec`]; [`JsonCodec`] is the default.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to serialize {type_name}: {message}")]
    Serialize {
        type_name: &'static str,
        message: String,
    },

    #[error("Failed to deserialize {type_name}: {message}")]
    Deserialize {
        type_name: &'static str,
        message: String,
    },
}

/// Serializes values to and from opaque blobs.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize {
            type_name: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }
}

/// Serde helper that stores byte payloads as base64 text.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
