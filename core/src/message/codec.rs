// Message codec: bincode with size limits
//
// Queue entries carry a leading format version byte so that entries written
// by a newer build are detected instead of misparsed.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::types::{Content, Envelope};

/// Maximum encoded content size: 256 KB
pub const MAX_CONTENT_SIZE: usize = 256 * 1024;

/// Maximum decoded snapshot blob: 16 MB
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

/// Current layout of envelopes persisted in the retry queue
pub const STORED_ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("empty record")]
    Empty,
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

fn check_size(size: usize, max: usize) -> Result<(), CodecError> {
    if size > max {
        return Err(CodecError::TooLarge { size, max });
    }
    Ok(())
}

/// Serialize decrypted content into the plaintext handed to the cipher
pub fn encode_content(content: &Content) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(content)?;
    check_size(bytes.len(), MAX_CONTENT_SIZE)?;
    Ok(bytes)
}

/// Parse a decrypted plaintext
pub fn decode_content(bytes: &[u8]) -> Result<Content, CodecError> {
    check_size(bytes.len(), MAX_CONTENT_SIZE)?;
    Ok(bincode::deserialize(bytes)?)
}

/// Serialize an envelope for the retry queue
pub fn encode_stored_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(envelope)?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(STORED_ENVELOPE_VERSION);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Parse a queued envelope, rejecting unknown format versions
pub fn decode_stored_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let (version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if *version != STORED_ENVELOPE_VERSION {
        return Err(CodecError::UnsupportedVersion(*version));
    }
    Ok(bincode::deserialize(body)?)
}

/// Serialize a device-sync snapshot (contacts or groups) for upload
pub fn encode_snapshot<T: Serialize>(entries: &[T]) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(entries)?;
    check_size(bytes.len(), MAX_SNAPSHOT_SIZE)?;
    Ok(bytes)
}

/// Parse a downloaded device-sync snapshot
pub fn decode_snapshot<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, CodecError> {
    check_size(bytes.len(), MAX_SNAPSHOT_SIZE)?;
    Ok(bincode::deserialize(bytes)?)
}
