// Transport seam: the authenticated connection to the message service
//
// The websocket/HTTP stack lives behind this trait. The pipeline only needs
// to pull envelopes, acknowledge them, push ciphertext, and close.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::message::{Address, Envelope};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out waiting for an envelope")]
    Timeout,
    #[error("envelope with unsupported protocol version: {0}")]
    InvalidVersion(String),
    #[error("transport closed")]
    Closed,
    #[error("{0} is not registered")]
    UnregisteredUser(Address),
    #[error("network error: {0}")]
    Network(String),
}

/// Encrypted payload addressed to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: Address,
    pub timestamp: u64,
    pub body: Vec<u8>,
    /// Sealed-sender delivery. Always false until unidentified access
    /// material is available.
    pub unidentified: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait up to `timeout` for the next envelope
    async fn read(&self, timeout: Duration) -> Result<Envelope, TransportError>;

    /// Tell the server the envelope is safely stored and may be dropped
    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError>;

    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Close the connection. Pending and future reads fail with `Closed`.
    fn shutdown(&self);
}
