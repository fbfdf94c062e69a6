// Message module: wire types, the outbound builder and the codec

pub mod builder;
pub mod codec;
pub mod types;

pub use builder::DataMessageBuilder;
pub use codec::{
    decode_content, decode_snapshot, decode_stored_envelope, encode_content, encode_snapshot,
    encode_stored_envelope, CodecError,
};
pub use types::{
    Address, AttachmentPointer, BlockedList, Content, ContactsSnapshot, DataMessage,
    DecryptedContent, DeviceContact, DeviceGroup, Envelope, EnvelopeType, GroupChange,
    GroupContext, GroupContextV1, GroupContextV2, GroupIdV2, GroupUpdateType, GroupsSnapshot,
    ReadMessage, ReceiptMessage, ReceiptType, SentTranscript, SyncMessage, SyncRequest,
    TypingAction, TypingMessage, VerifiedMessage, VerifiedState,
};
