use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

/// The application payload codec. The sdk frames packet headers itself
/// and treats payload bytes as opaque beyond that; this trait is the
/// externally supplied boundary that turns typed values into those
/// bytes and back.
pub trait Serializer: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default JSON codec so the sdk is usable out of the box. Applications
/// with their own wire format plug in their own [`Serializer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
    }
}
