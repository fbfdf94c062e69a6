// sigmux core: per-account message pipeline
//
// One AccountManager per linked identity. Envelopes flow
// transport → retry queue → decrypt/dispatch → jobs → caller handler,
// and outbound messages flow through the send/fan-out pipeline.

pub mod account;
pub mod attachments;
pub mod crypto;
pub mod groups;
pub mod message;
pub mod pipeline;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use account::{
    AccountBuilder, AccountManager, AccountRegistry, ReceiveMessageHandler, ReceiveOptions,
};
pub use crypto::{IdentityKey, SessionCipher};
pub use message::{Address, DataMessageBuilder, DecryptedContent, Envelope};
pub use pipeline::{Job, ReceiveError, SendMessageResult, SendOutcome, SendTarget};
pub use store::{StorageBackend, TrustLevel};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Store(#[from] store::StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] message::CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),
    #[error("attachment error: {0}")]
    Attachment(#[from] attachments::AttachmentError),
    #[error("group not found")]
    GroupNotFound,
    #[error("not a member of group {0}")]
    NotAGroupMember(String),
    #[error("sync to own devices failed: {0:?}")]
    SyncFailed(pipeline::SendOutcome),
    #[error("invalid recipient")]
    InvalidRecipient,
    #[error("account is missing its {0} capability")]
    MissingCapability(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Milliseconds since the unix epoch, the unit every protocol timestamp uses.
pub(crate) fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
