//! CBOR record encoding.

use crate::error::{PersistenceError, PersistenceResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a record as CBOR.
pub fn encode_record<T: Serialize>(value: &T) -> PersistenceResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PersistenceError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR record.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> PersistenceResult<T> {
    ciborium::from_reader(bytes).map_err(|e| PersistenceError::codec(e.to_string()))
}
