//! TICKVAULT - Payload Codec
//! The scheduler stores payloads as opaque bytes; a codec supplied by the
//! caller turns them back into values.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TickError};

/// Converts trigger payloads to and from their stored form.
pub trait Codec<T>: Send + Sync {
    /// Encode a payload; failures surface as `TickError::Serialization`.
    fn serialize(&self, payload: &T) -> Result<Vec<u8>>;

    /// Decode stored bytes; failures surface as `TickError::Deserialization`.
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// Codec for any serde type, using bincode.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, payload: &T) -> Result<Vec<u8>> {
        bincode::serialize(payload).map_err(|e| TickError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| TickError::Deserialization(e.to_string()))
    }
}
