// Send pipeline: per-recipient encryption, group fan-out, sync transcripts
//
// Every recipient gets its own outcome. One recipient's identity or network
// failure never prevents delivery to the others.

use futures::future::join_all;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::account::AccountManager;
use crate::crypto::{CryptoError, IdentityKey};
use crate::message::{
    encode_content, Address, Content, DataMessage, DataMessageBuilder, GroupContext,
    GroupContextV1, GroupContextV2, GroupIdV2, ReadMessage, ReceiptMessage, ReceiptType,
    SentTranscript, SyncMessage, TypingMessage,
};
use crate::store::TrustLevel;
use crate::transport::{OutgoingMessage, TransportError};
use crate::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Success { unidentified: bool, duration: Duration },
    IdentityFailure { key: IdentityKey },
    NetworkFailure,
    InvalidRecipient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendMessageResult {
    pub address: Address,
    pub outcome: SendOutcome,
}

impl SendMessageResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SendOutcome::Success { .. })
    }

    pub fn is_identity_failure(&self) -> bool {
        matches!(self.outcome, SendOutcome::IdentityFailure { .. })
    }
}

/// Who a data message goes to
#[derive(Debug, Clone, PartialEq)]
pub enum SendTarget {
    Recipients(Vec<Address>),
    GroupV1(Vec<u8>),
    GroupV2(GroupIdV2),
}

impl AccountManager {
    /// Send a data message to a set of recipients or to every other member
    /// of a group, stamping the group's expiration timer on group sends.
    pub async fn send(
        &self,
        builder: DataMessageBuilder,
        target: SendTarget,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        match target {
            SendTarget::Recipients(recipients) => {
                if recipients.is_empty() {
                    return Err(CoreError::InvalidRecipient);
                }
                self.send_message(builder, recipients).await
            }
            SendTarget::GroupV1(group_id) => {
                let group = self
                    .state
                    .group_v1(&group_id)?
                    .ok_or(CoreError::GroupNotFound)?;
                if !group.is_member(self.self_address()) {
                    return Err(CoreError::NotAGroupMember(group.hex_id()));
                }
                let mut builder =
                    builder.as_group(GroupContext::V1(GroupContextV1::deliver(group_id)));
                if group.message_expiration_time != 0 {
                    builder = builder.with_expiration(group.message_expiration_time);
                }
                let recipients = self.other_members(&group.members);
                self.send_message(builder, recipients).await
            }
            SendTarget::GroupV2(group_id) => {
                let group = self
                    .state
                    .group_v2(&group_id)?
                    .ok_or(CoreError::GroupNotFound)?;
                if !group.is_member(self.self_address()) {
                    return Err(CoreError::NotAGroupMember(group.hex_id()));
                }
                let mut builder = builder.as_group(GroupContext::V2(GroupContextV2 {
                    id: group_id,
                    revision: group.revision,
                    change: None,
                }));
                if group.message_expiration_time != 0 {
                    builder = builder.with_expiration(group.message_expiration_time);
                }
                let recipients = self.other_members(&group.members);
                self.send_message(builder, recipients).await
            }
        }
    }

    pub(crate) fn other_members(&self, members: &[Address]) -> Vec<Address> {
        members
            .iter()
            .filter(|m| !self.state.is_self(m))
            .cloned()
            .collect()
    }

    /// Core fan-out. End-session teardown runs for every recipient after
    /// the send, whatever its outcome.
    pub async fn send_message(
        &self,
        mut builder: DataMessageBuilder,
        recipients: Vec<Address>,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let recipients = self.state.resolve_all(&recipients)?;
        if let Some(key) = self.state.own_profile_key()? {
            builder = builder.with_profile_key(key.as_bytes().to_vec());
        }
        let end_session = builder.is_end_session();

        let results = self.deliver(builder, &recipients).await;

        if end_session {
            for recipient in &recipients {
                self.end_session(recipient);
            }
        }
        results
    }

    async fn deliver(
        &self,
        builder: DataMessageBuilder,
        recipients: &[Address],
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        if builder.is_group() {
            let message = builder.build();
            return self.fan_out(&message, recipients).await;
        }

        if let [only] = recipients {
            if self.state.is_self(only) {
                let message = builder.build();
                return Ok(match self.send_transcript(Some(only), &message, Vec::new()).await {
                    Ok(_) => Vec::new(),
                    Err(outcome) => vec![SendMessageResult { address: only.clone(), outcome }],
                });
            }
        }

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let outcome = self.deliver_one(&builder, recipient).await;
            results.push(SendMessageResult { address: recipient.clone(), outcome });
        }
        Ok(results)
    }

    // A store or encoding fault here fails this recipient only.
    async fn deliver_one(&self, builder: &DataMessageBuilder, recipient: &Address) -> SendOutcome {
        let timer = match self.state.contact_expiration(recipient) {
            Ok(timer) => timer,
            Err(e) => {
                error!(peer = %recipient, error = %e, "expiration lookup failed, not sending");
                return SendOutcome::NetworkFailure;
            }
        };
        let message = builder.clone().with_expiration(timer).build();
        if self.state.is_self(recipient) {
            return match self.send_transcript(Some(recipient), &message, Vec::new()).await {
                Ok(duration) => SendOutcome::Success { unidentified: false, duration },
                Err(outcome) => outcome,
            };
        }
        match self.send_direct(recipient, &message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(peer = %recipient, error = %e, "send failed before delivery");
                SendOutcome::NetworkFailure
            }
        }
    }

    // 1:1 send followed by a transcript to our own devices that carries the
    // peer's actual outcome.
    async fn send_direct(
        &self,
        recipient: &Address,
        message: &DataMessage,
    ) -> Result<SendOutcome, CoreError> {
        let plaintext = encode_content(&Content::Data(message.clone()))?;
        let outcome = self.timed_send(recipient, &plaintext, message.timestamp).await;

        if let SendOutcome::Success { unidentified, .. } = outcome {
            let status = vec![(recipient.clone(), unidentified)];
            if let Err(e) = self.send_transcript(Some(recipient), message, status).await {
                warn!(peer = %recipient, outcome = ?e, "sent transcript failed");
            }
        }
        Ok(outcome)
    }

    // Group fan-out. Sends are multiplexed; results come back in recipient
    // order.
    async fn fan_out(
        &self,
        message: &DataMessage,
        recipients: &[Address],
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let plaintext = encode_content(&Content::Data(message.clone()))?;
        let sends = recipients
            .iter()
            .map(|recipient| self.timed_send(recipient, &plaintext, message.timestamp));
        let outcomes = join_all(sends).await;

        let results: Vec<SendMessageResult> = recipients
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(address, outcome)| SendMessageResult { address, outcome })
            .collect();

        let delivered: Vec<(Address, bool)> = results
            .iter()
            .filter_map(|r| match r.outcome {
                SendOutcome::Success { unidentified, .. } => Some((r.address.clone(), unidentified)),
                _ => None,
            })
            .collect();
        if !delivered.is_empty() {
            if let Err(e) = self.send_transcript(None, message, delivered).await {
                warn!(outcome = ?e, "group sent transcript failed");
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(recipients = results.len(), failed, "group send finished");
        Ok(results)
    }

    async fn timed_send(&self, recipient: &Address, plaintext: &[u8], timestamp: u64) -> SendOutcome {
        let started = Instant::now();
        match self.send_to(recipient, plaintext, timestamp).await {
            Ok(()) => SendOutcome::Success {
                unidentified: false,
                duration: started.elapsed(),
            },
            Err(outcome) => outcome,
        }
    }

    /// Encrypt and push `plaintext` to one address. Session-state access
    /// happens under the session lock; the network send does not.
    pub(crate) async fn send_to(
        &self,
        recipient: &Address,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<(), SendOutcome> {
        if !recipient.is_valid() {
            return Err(SendOutcome::InvalidRecipient);
        }

        let has_session = self.session_lock.with(|| self.cipher.has_session(recipient));
        if !has_session {
            match self.session_lock.with(|| self.cipher.establish_session(recipient)) {
                Ok(key) => {
                    if let Err(e) = self.state.observe_identity(recipient, &key) {
                        warn!(peer = %recipient, error = %e, "failed to record identity");
                    }
                }
                Err(e) => return Err(self.crypto_failure(recipient, e)),
            }
        }

        match self.state.current_identity(recipient) {
            Ok(Some(key)) => match self.state.is_trusted_for_send(recipient, &key) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(peer = %recipient, "identity not trusted, not sending");
                    return Err(SendOutcome::IdentityFailure { key });
                }
                Err(e) => {
                    warn!(peer = %recipient, error = %e, "trust lookup failed");
                    return Err(SendOutcome::NetworkFailure);
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %recipient, error = %e, "identity lookup failed");
                return Err(SendOutcome::NetworkFailure);
            }
        }

        let ciphertext = self
            .session_lock
            .with(|| self.cipher.encrypt(recipient, plaintext))
            .map_err(|e| self.crypto_failure(recipient, e))?;

        let outgoing = OutgoingMessage {
            destination: recipient.clone(),
            timestamp,
            body: ciphertext,
            unidentified: false,
        };
        match self.transport.send(outgoing).await {
            Ok(()) => Ok(()),
            Err(TransportError::UnregisteredUser(_)) => Err(SendOutcome::InvalidRecipient),
            Err(e) => {
                warn!(peer = %recipient, error = %e, "send failed");
                Err(SendOutcome::NetworkFailure)
            }
        }
    }

    // Map a cipher failure to an outcome. An identity fault demotes the
    // offending key so later sends are refused up front.
    fn crypto_failure(&self, recipient: &Address, error: CryptoError) -> SendOutcome {
        match error {
            CryptoError::UntrustedIdentity { address, key } => {
                if let Err(e) = self.state.save_identity(&address, &key, TrustLevel::Untrusted) {
                    warn!(peer = %address, error = %e, "failed to record untrusted identity");
                }
                SendOutcome::IdentityFailure { key }
            }
            other => {
                warn!(peer = %recipient, error = %other, "encrypt failed");
                SendOutcome::NetworkFailure
            }
        }
    }

    /// Tell our other devices about a message we sent. `destination` is
    /// None for group messages.
    async fn send_transcript(
        &self,
        destination: Option<&Address>,
        message: &DataMessage,
        unidentified_status: Vec<(Address, bool)>,
    ) -> Result<Duration, SendOutcome> {
        let expiration_start_timestamp = if message.expires_in_seconds > 0 {
            crate::current_timestamp_millis()
        } else {
            0
        };
        let sync = SyncMessage {
            sent: Some(SentTranscript {
                destination: destination.cloned(),
                timestamp: message.timestamp,
                message: message.clone(),
                expiration_start_timestamp,
                unidentified_status,
                is_recipient_update: false,
            }),
            ..Default::default()
        };
        let started = Instant::now();
        self.send_sync_message(sync, message.timestamp).await?;
        Ok(started.elapsed())
    }

    /// Deliver a sync message to our own other devices
    pub(crate) async fn send_sync_message(
        &self,
        sync: SyncMessage,
        timestamp: u64,
    ) -> Result<(), SendOutcome> {
        let plaintext = encode_content(&Content::Sync(sync)).map_err(|e| {
            warn!(error = %e, "failed to encode sync message");
            SendOutcome::NetworkFailure
        })?;
        let own = self.self_address().clone();
        self.send_to(&own, &plaintext, timestamp).await
    }

    pub async fn send_typing(
        &self,
        message: TypingMessage,
        recipient: &Address,
    ) -> Result<SendMessageResult, CoreError> {
        let recipient = self.state.resolve(recipient)?;
        let timestamp = message.timestamp;
        let plaintext = encode_content(&Content::Typing(message))?;
        let outcome = self.timed_send(&recipient, &plaintext, timestamp).await;
        Ok(SendMessageResult { address: recipient, outcome })
    }

    /// Send a receipt. Read receipts are mirrored to our other devices.
    pub async fn send_receipt(
        &self,
        receipt: ReceiptMessage,
        recipient: &Address,
    ) -> Result<SendMessageResult, CoreError> {
        let recipient = self.state.resolve(recipient)?;
        let timestamp = receipt.when;
        let read: Vec<ReadMessage> = match receipt.kind {
            ReceiptType::Read => receipt
                .timestamps
                .iter()
                .map(|ts| ReadMessage { sender: recipient.clone(), timestamp: *ts })
                .collect(),
            _ => Vec::new(),
        };
        let plaintext = encode_content(&Content::Receipt(receipt))?;
        let outcome = self.timed_send(&recipient, &plaintext, timestamp).await;

        if !read.is_empty() {
            let sync = SyncMessage { read, ..Default::default() };
            if let Err(e) = self.send_sync_message(sync, timestamp).await {
                warn!(outcome = ?e, "read sync failed");
            }
        }
        Ok(SendMessageResult { address: recipient, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_predicates() {
        let ok = SendMessageResult {
            address: Address::from_number("+1"),
            outcome: SendOutcome::Success { unidentified: false, duration: Duration::from_millis(3) },
        };
        let bad = SendMessageResult {
            address: Address::from_number("+2"),
            outcome: SendOutcome::IdentityFailure { key: IdentityKey::from_bytes(vec![1; 33]) },
        };
        assert!(ok.is_success());
        assert!(!bad.is_success());
        assert!(bad.is_identity_failure());
    }
}
