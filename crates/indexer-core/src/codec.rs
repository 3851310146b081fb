#![allow(clippy::module_name_repetitions)]

//! Canonical codec for persisted index records.
//!
//! Value records and value-key lists are stored with a fixed-width
//! little-endian encoding: every length is a u64, and decoding rejects
//! trailing bytes. The encoding is deterministic, which the update path
//! relies on to detect whether a stored record actually changed.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::Value;

/// Codec failures. Any of these surfacing from a read means the stored
/// bytes are not a well-formed record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("invalid key encoding: {0}")]
    Key(#[from] multihash::Error),
}

/// Canonical encoder options (fixed-int, little-endian, no trailing bytes).
fn encoder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    encoder().serialize(value).map_err(CodecError::from)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    encoder().deserialize(bytes).map_err(CodecError::from)
}

/// Serialize a value record.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    encode(value)
}

/// Decode a value record.
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    decode(bytes)
}

/// Serialize a list of value keys: a length-prefixed sequence of
/// length-prefixed byte strings.
pub fn encode_value_keys(keys: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    encode(&keys)
}

/// Decode a list of value keys.
pub fn decode_value_keys(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    decode(bytes)
}
