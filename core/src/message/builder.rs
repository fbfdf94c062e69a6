// Outbound data message builder
//
// The send pipeline clones the builder per recipient so it can stamp each
// copy with that recipient's expiration timer.

use super::types::{AttachmentPointer, DataMessage, GroupContext};

#[derive(Debug, Clone, Default)]
pub struct DataMessageBuilder {
    timestamp: u64,
    body: Option<String>,
    attachments: Vec<AttachmentPointer>,
    group: Option<GroupContext>,
    expires_in_seconds: u32,
    expiration_update: bool,
    end_session: bool,
    profile_key: Option<Vec<u8>>,
}

impl DataMessageBuilder {
    /// Start a message stamped with the current time
    pub fn new() -> Self {
        Self {
            timestamp: crate::current_timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_attachment(mut self, pointer: AttachmentPointer) -> Self {
        self.attachments.push(pointer);
        self
    }

    pub fn as_group(mut self, group: GroupContext) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_expiration(mut self, seconds: u32) -> Self {
        self.expires_in_seconds = seconds;
        self
    }

    pub fn as_expiration_update(mut self) -> Self {
        self.expiration_update = true;
        self
    }

    pub fn as_end_session(mut self) -> Self {
        self.end_session = true;
        self
    }

    pub fn with_profile_key(mut self, key: Vec<u8>) -> Self {
        self.profile_key = Some(key);
        self
    }

    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_end_session(&self) -> bool {
        self.end_session
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn build(self) -> DataMessage {
        DataMessage {
            timestamp: self.timestamp,
            body: self.body,
            attachments: self.attachments,
            group: self.group,
            expires_in_seconds: self.expires_in_seconds,
            expiration_update: self.expiration_update,
            end_session: self.end_session,
            profile_key: self.profile_key,
        }
    }
}
