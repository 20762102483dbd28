//! `MsgPack` encoding of messages for durable group stores.
//!
//! Uses `rmp_serde::to_vec_named()` so field names travel with the data and
//! records stay readable if fields are added later.

use crate::message::Message;

/// Errors raised while encoding or decoding a stored message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serializes a message to `MsgPack` bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Deserializes a message from `MsgPack` bytes.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a valid message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
