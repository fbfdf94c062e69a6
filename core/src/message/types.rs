// Message types: envelopes off the wire and the content they decrypt to

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::crypto::IdentityKey;

/// A peer address. At least one of the two identifiers is present on a
/// valid address; the other may be filled in later by recipient resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub uuid: Option<Uuid>,
    pub number: Option<String>,
}

impl Address {
    pub fn new(uuid: Option<Uuid>, number: Option<String>) -> Self {
        Self { uuid, number }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self { uuid: Some(uuid), number: None }
    }

    pub fn from_number(number: impl Into<String>) -> Self {
        Self { uuid: None, number: Some(number.into()) }
    }

    pub fn is_valid(&self) -> bool {
        self.uuid.is_some() || self.number.is_some()
    }

    /// Two addresses refer to the same peer when an identifier present on
    /// both agrees. The uuid wins when both sides carry one.
    pub fn matches(&self, other: &Address) -> bool {
        if let (Some(a), Some(b)) = (self.uuid, other.uuid) {
            return a == b;
        }
        match (&self.number, &other.number) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Stable storage identifier: the uuid when known, else the number.
    pub fn identifier(&self) -> String {
        match (&self.uuid, &self.number) {
            (Some(uuid), _) => uuid.to_string(),
            (None, Some(number)) => number.clone(),
            (None, None) => String::new(),
        }
    }

    /// Log-safe form that keeps only the last two characters.
    pub fn redacted(&self) -> String {
        let id = self.identifier();
        let tail: String = id.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
        format!("***{}", tail)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

// ============================================================================
// ENVELOPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    Unknown,
    Ciphertext,
    KeyExchange,
    PreKeyBundle,
    Receipt,
    UnidentifiedSender,
}

/// An encrypted envelope as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeType,
    /// Absent for sealed-sender envelopes until decrypted
    pub source: Option<Address>,
    pub source_device: u32,
    pub protocol_version: u8,
    /// Sender timestamp (ms)
    pub timestamp: u64,
    pub server_received_timestamp: u64,
    pub server_delivered_timestamp: u64,
    /// Server-assigned token used for deduplication
    pub server_guid: Option<String>,
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn is_receipt(&self) -> bool {
        self.kind == EnvelopeType::Receipt
    }

    pub fn is_pre_key_bundle(&self) -> bool {
        self.kind == EnvelopeType::PreKeyBundle
    }

    pub fn is_unidentified_sender(&self) -> bool {
        self.kind == EnvelopeType::UnidentifiedSender
    }
}

// ============================================================================
// DECRYPTED CONTENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Data(DataMessage),
    Sync(SyncMessage),
    Typing(TypingMessage),
    Receipt(ReceiptMessage),
    Null,
}

/// The plaintext of an envelope plus the sender metadata the cipher recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedContent {
    pub sender: Address,
    pub sender_device: u32,
    pub timestamp: u64,
    pub needs_receipt: bool,
    pub body: Content,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataMessage {
    pub timestamp: u64,
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPointer>,
    pub group: Option<GroupContext>,
    pub expires_in_seconds: u32,
    pub expiration_update: bool,
    pub end_session: bool,
    pub profile_key: Option<Vec<u8>>,
}

/// Reference to an encrypted blob held by the attachment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPointer {
    pub remote_id: String,
    pub content_type: String,
    pub size: u64,
    pub key: Vec<u8>,
    pub file_name: Option<String>,
    pub preview: Option<Vec<u8>>,
}

// ----------------------------------------------------------------------------
// Group contexts
// ----------------------------------------------------------------------------

pub type GroupIdV2 = [u8; 32];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupContext {
    V1(GroupContextV1),
    V2(GroupContextV2),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupUpdateType {
    Unknown,
    Update,
    Deliver,
    Quit,
    RequestInfo,
}

/// Legacy group context. Membership travels in the message itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupContextV1 {
    pub id: Vec<u8>,
    pub kind: GroupUpdateType,
    pub name: Option<String>,
    pub members: Option<Vec<Address>>,
    pub avatar: Option<AttachmentPointer>,
}

impl GroupContextV1 {
    pub fn deliver(id: Vec<u8>) -> Self {
        Self { id, kind: GroupUpdateType::Deliver, name: None, members: None, avatar: None }
    }
}

/// Versioned group context. Carries the revision the sender is at and,
/// optionally, the delta that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupContextV2 {
    pub id: GroupIdV2,
    pub revision: u32,
    pub change: Option<GroupChange>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupChange {
    pub revision: u32,
    pub add_members: Vec<Address>,
    pub remove_members: Vec<Address>,
    pub title: Option<String>,
    pub expiration_timer: Option<u32>,
}

// ----------------------------------------------------------------------------
// Sync messages (from the account's own other devices)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncMessage {
    pub sent: Option<SentTranscript>,
    pub contacts: Option<ContactsSnapshot>,
    pub groups: Option<GroupsSnapshot>,
    pub request: Option<SyncRequest>,
    pub read: Vec<ReadMessage>,
    pub verified: Option<VerifiedMessage>,
    pub blocked: Option<BlockedList>,
}

/// Copy of a message this account sent from another device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentTranscript {
    /// None for group messages
    pub destination: Option<Address>,
    pub timestamp: u64,
    pub message: DataMessage,
    pub expiration_start_timestamp: u64,
    pub unidentified_status: Vec<(Address, bool)>,
    pub is_recipient_update: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactsSnapshot {
    pub blob: AttachmentPointer,
    /// A complete snapshot replaces all local contacts
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupsSnapshot {
    pub blob: AttachmentPointer,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    Contacts,
    Groups,
    Blocked,
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMessage {
    pub sender: Address,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifiedState {
    Default,
    Verified,
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedMessage {
    pub destination: Address,
    pub identity_key: IdentityKey,
    pub state: VerifiedState,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockedList {
    pub addresses: Vec<Address>,
    pub group_ids: Vec<Vec<u8>>,
}

/// One contact entry inside a contacts snapshot blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceContact {
    pub address: Address,
    pub name: Option<String>,
    pub color: Option<String>,
    pub avatar: Option<AttachmentPointer>,
    pub expiration_timer: Option<u32>,
    pub profile_key: Option<Vec<u8>>,
    pub blocked: bool,
    pub archived: bool,
    pub inbox_position: Option<u32>,
}

/// One group entry inside a groups snapshot blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub members: Vec<Address>,
    pub avatar: Option<AttachmentPointer>,
    pub expiration_timer: Option<u32>,
    pub active: bool,
    pub blocked: bool,
    pub archived: bool,
    pub inbox_position: Option<u32>,
}

// ----------------------------------------------------------------------------
// Typing and receipts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypingAction {
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingMessage {
    pub action: TypingAction,
    pub timestamp: u64,
    pub group_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptType {
    Delivery,
    Read,
    Viewed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMessage {
    pub kind: ReceiptType,
    pub timestamps: Vec<u64>,
    pub when: u64,
}
