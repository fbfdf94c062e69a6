// Decrypt and dispatch one envelope
//
// Produces the decrypted content (or the error that stopped it) plus the
// follow-up jobs the content calls for. Store mutations that the content
// implies happen here, synchronously; network work is left to the jobs.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::account::AccountManager;
use crate::crypto::{CryptoError, IdentityKey, Plaintext};
use crate::message::{
    decode_content, Address, CodecError, Content, DataMessage, DecryptedContent, Envelope,
    GroupContext, SyncMessage, SyncRequest,
};
use crate::pipeline::Job;
use crate::store::{ProfileKey, StoreError, TrustLevel};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReceiveError {
    #[error("untrusted identity key for {address}")]
    UntrustedIdentity { address: Address, key: IdentityKey },
    #[error("decrypt failed: {0}")]
    Crypto(CryptoError),
    #[error("malformed content: {0}")]
    Malformed(#[from] CodecError),
    #[error("storage error while dispatching: {0}")]
    Store(#[from] StoreError),
}

/// Result of processing one envelope
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub content: Option<DecryptedContent>,
    pub error: Option<ReceiveError>,
    pub jobs: Vec<Job>,
}

impl ProcessOutcome {
    fn failed(error: ReceiveError) -> Self {
        Self { content: None, error: Some(error), jobs: Vec::new() }
    }
}

impl AccountManager {
    /// Decrypt `envelope` and apply what it says to local state.
    /// Receipt envelopes carry no ciphertext and pass through untouched.
    pub fn process_envelope(&self, envelope: &Envelope, ignore_attachments: bool) -> ProcessOutcome {
        if envelope.is_receipt() {
            return ProcessOutcome::default();
        }

        let plaintext = match self.decrypt(envelope) {
            Ok(p) => p,
            Err(e) => return ProcessOutcome::failed(e),
        };
        let body = match decode_content(&plaintext.bytes) {
            Ok(body) => body,
            Err(e) => return ProcessOutcome::failed(e.into()),
        };
        let content = DecryptedContent {
            sender: plaintext.sender,
            sender_device: plaintext.sender_device,
            timestamp: plaintext.timestamp,
            needs_receipt: plaintext.needs_receipt,
            body,
        };

        let mut outcome = ProcessOutcome::default();
        match self.dispatch(envelope, &content, ignore_attachments) {
            Ok(jobs) => outcome.jobs = jobs,
            Err(e) => {
                error!(error = %e, "failed to apply received content");
                outcome.error = Some(e.into());
            }
        }
        outcome.content = Some(content);
        outcome
    }

    fn decrypt(&self, envelope: &Envelope) -> Result<Plaintext, ReceiveError> {
        let result = self.session_lock.with(|| self.cipher.decrypt(envelope));
        match result {
            Ok(plaintext) => {
                if let Some(key) = &plaintext.identity {
                    if let Err(e) = self.state.observe_identity(&plaintext.sender, key) {
                        warn!(error = %e, "failed to record sender identity");
                    }
                }
                Ok(plaintext)
            }
            Err(CryptoError::UntrustedIdentity { address, key }) => {
                if let Err(e) = self.state.save_identity(&address, &key, TrustLevel::Untrusted) {
                    error!(peer = %address, error = %e, "failed to record untrusted identity");
                }
                Err(ReceiveError::UntrustedIdentity { address, key })
            }
            Err(e) => {
                debug!(error = %e, "decrypt failed");
                Err(ReceiveError::Crypto(e))
            }
        }
    }

    fn dispatch(
        &self,
        envelope: &Envelope,
        content: &DecryptedContent,
        ignore_attachments: bool,
    ) -> Result<Vec<Job>, StoreError> {
        let source = self.state.resolve(&content.sender)?;
        let mut jobs = Vec::new();

        match &content.body {
            Content::Data(message) => {
                if content.needs_receipt {
                    jobs.push(Job::SendDeliveryReceipt {
                        to: source.clone(),
                        timestamps: vec![message.timestamp],
                    });
                }
                jobs.extend(self.handle_data_message(
                    message,
                    &source,
                    Some(&source),
                    ignore_attachments,
                )?);
            }
            Content::Sync(sync) => {
                if self.state.is_self(&source) {
                    jobs.extend(self.handle_sync_message(sync, &source, ignore_attachments));
                } else {
                    warn!(peer = %source, "dropping sync message from another account");
                }
            }
            Content::Typing(_) | Content::Receipt(_) | Content::Null => {}
        }

        if envelope.is_pre_key_bundle() {
            jobs.push(Job::RefreshPreKeys);
        }
        Ok(jobs)
    }

    /// `peer` is the 1:1 counterparty: the sender for incoming messages,
    /// the destination for our own sent transcripts, None for group
    /// transcripts.
    fn handle_data_message(
        &self,
        message: &DataMessage,
        source: &Address,
        peer: Option<&Address>,
        ignore_attachments: bool,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();

        match &message.group {
            Some(GroupContext::V1(context)) => {
                let expiration = message.expiration_update.then_some(message.expires_in_seconds);
                jobs.extend(self.state.apply_group_v1(context, source, expiration)?);
            }
            Some(GroupContext::V2(context)) => {
                jobs.extend(self.state.reconcile_group_v2(context)?);
            }
            None => {
                if let Some(peer) = peer {
                    self.state.set_contact_expiration(peer, message.expires_in_seconds)?;
                }
            }
        }

        if message.end_session {
            if let Some(peer) = peer {
                self.end_session(peer);
            }
        }

        if !message.attachments.is_empty() {
            if ignore_attachments {
                debug!(count = message.attachments.len(), "not retrieving attachments");
            } else {
                jobs.extend(message.attachments.iter().cloned().map(Job::RetrieveAttachment));
            }
        }

        // Transcripts carry our own key, which is managed separately.
        if let (Some(bytes), false) = (&message.profile_key, self.state.is_self(source)) {
            match ProfileKey::from_slice(bytes) {
                Some(key) => self.state.store_profile_key(source, &key)?,
                None => debug!(len = bytes.len(), "ignoring profile key of wrong length"),
            }
        }
        Ok(jobs)
    }

    // Each submessage is handled on its own; a failure in one is logged and
    // the rest still run.
    fn handle_sync_message(
        &self,
        sync: &SyncMessage,
        source: &Address,
        ignore_attachments: bool,
    ) -> Vec<Job> {
        let mut jobs = Vec::new();

        if let Some(sent) = &sync.sent {
            let result = sent
                .destination
                .as_ref()
                .map(|d| self.state.resolve(d))
                .transpose()
                .and_then(|destination| {
                    self.handle_data_message(
                        &sent.message,
                        source,
                        destination.as_ref(),
                        ignore_attachments,
                    )
                });
            match result {
                Ok(more) => jobs.extend(more),
                Err(e) => warn!(error = %e, "failed to apply sent transcript"),
            }
        }

        if let Some(request) = sync.request {
            match request {
                SyncRequest::Contacts => jobs.push(Job::SendContactsSync),
                SyncRequest::Groups => jobs.push(Job::SendGroupsSync),
                other => debug!(request = ?other, "unsupported sync request"),
            }
        }

        if let Some(groups) = &sync.groups {
            jobs.push(Job::IngestGroupSnapshot(groups.clone()));
        }

        if let Some(contacts) = &sync.contacts {
            jobs.push(Job::IngestContactSnapshot(contacts.clone()));
        }

        if let Some(verified) = &sync.verified {
            let level = TrustLevel::from_verified_state(verified.state);
            let result = self
                .state
                .resolve(&verified.destination)
                .and_then(|peer| self.state.save_identity(&peer, &verified.identity_key, level));
            if let Err(e) = result {
                warn!(error = %e, "failed to apply verified sync");
            }
        }

        if !sync.read.is_empty() {
            debug!(count = sync.read.len(), "read sync received");
        }

        if let Some(blocked) = &sync.blocked {
            debug!(
                addresses = blocked.addresses.len(),
                groups = blocked.group_ids.len(),
                "blocked list sync is not stored"
            );
        }

        jobs
    }
}
