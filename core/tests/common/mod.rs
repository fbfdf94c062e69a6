// Shared fakes for the integration tests
//
// The fake cipher is an identity transform, so anything the fake transport
// records can be decoded straight back into `Content`.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use sigmux_core::attachments::{AccountPaths, AttachmentError, AttachmentStore};
use sigmux_core::crypto::{CryptoError, Plaintext, PreKeyRecord, PreKeyService};
use sigmux_core::groups::{GroupError, GroupStateFetcher};
use sigmux_core::message::{
    decode_content, encode_content, Address, AttachmentPointer, Content, DecryptedContent,
    Envelope, EnvelopeType, GroupIdV2,
};
use sigmux_core::store::{GroupV2State, MemoryStorage, StorageBackend};
use sigmux_core::transport::{OutgoingMessage, Transport, TransportError};
use sigmux_core::{AccountManager, IdentityKey, ReceiveError, ReceiveMessageHandler, SessionCipher};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn key(byte: u8) -> IdentityKey {
    IdentityKey::from_bytes(vec![byte; 33])
}

pub fn peer(n: u8) -> Address {
    Address::new(
        Some(Uuid::from_bytes([n; 16])),
        Some(format!("+1555000{:04}", n)),
    )
}

// ============================================================================
// CIPHER
// ============================================================================

#[derive(Default)]
pub struct FakeCipher {
    sessions: Mutex<HashSet<String>>,
    /// Key a peer presents when a session is built with it
    pub remote_keys: Mutex<HashMap<String, IdentityKey>>,
    /// Peers whose encrypt fails with an identity fault
    pub untrusted_on_encrypt: Mutex<HashSet<String>>,
    /// Decrypt failures keyed by envelope timestamp
    pub decrypt_errors: Mutex<HashMap<u64, CryptoError>>,
    /// Identity reported on decrypt, keyed by sender
    pub decrypt_identities: Mutex<HashMap<String, IdentityKey>>,
    pub needs_receipt: AtomicBool,
    pub deleted_sessions: Mutex<Vec<Address>>,
}

impl FakeCipher {
    pub fn set_remote_key(&self, peer: &Address, key: IdentityKey) {
        self.remote_keys.lock().insert(peer.identifier(), key);
    }

    pub fn fail_encrypt_with_identity(&self, peer: &Address) {
        self.untrusted_on_encrypt.lock().insert(peer.identifier());
    }
}

impl SessionCipher for FakeCipher {
    fn has_session(&self, peer: &Address) -> bool {
        self.sessions.lock().contains(&peer.identifier())
    }

    fn establish_session(&self, peer: &Address) -> Result<IdentityKey, CryptoError> {
        self.sessions.lock().insert(peer.identifier());
        Ok(self
            .remote_keys
            .lock()
            .get(&peer.identifier())
            .cloned()
            .unwrap_or_else(|| key(0xEE)))
    }

    fn encrypt(&self, peer: &Address, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.untrusted_on_encrypt.lock().contains(&peer.identifier()) {
            let key = self
                .remote_keys
                .lock()
                .get(&peer.identifier())
                .cloned()
                .unwrap_or_else(|| key(0xEE));
            return Err(CryptoError::UntrustedIdentity { address: peer.clone(), key });
        }
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, envelope: &Envelope) -> Result<Plaintext, CryptoError> {
        if let Some(err) = self.decrypt_errors.lock().get(&envelope.timestamp) {
            return Err(err.clone());
        }
        let sender = envelope
            .source
            .clone()
            .ok_or_else(|| CryptoError::InvalidMessage("no source".into()))?;
        let identity = self.decrypt_identities.lock().get(&sender.identifier()).cloned();
        Ok(Plaintext {
            sender,
            sender_device: envelope.source_device,
            timestamp: envelope.timestamp,
            needs_receipt: self.needs_receipt.load(Ordering::SeqCst),
            identity,
            bytes: envelope.content.clone(),
        })
    }

    fn delete_all_sessions(&self, peer: &Address) {
        self.sessions.lock().remove(&peer.identifier());
        self.deleted_sessions.lock().push(peer.clone());
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Default)]
pub struct FakeTransport {
    inbox: Mutex<VecDeque<Result<Envelope, TransportError>>>,
    closed: AtomicBool,
    pub acked: Mutex<Vec<Envelope>>,
    pub sent: Mutex<Vec<OutgoingMessage>>,
    /// Destinations whose sends fail, keyed by identifier
    pub failures: Mutex<HashMap<String, TransportError>>,
    pub reads: AtomicUsize,
}

impl FakeTransport {
    pub fn push(&self, envelope: Envelope) {
        self.inbox.lock().push_back(Ok(envelope));
    }

    pub fn push_error(&self, error: TransportError) {
        self.inbox.lock().push_back(Err(error));
    }

    pub fn fail_sends_to(&self, peer: &Address, error: TransportError) {
        self.failures.lock().insert(peer.identifier(), error);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Everything sent so far, decoded
    pub fn sent_contents(&self) -> Vec<(Address, Content)> {
        self.sent
            .lock()
            .iter()
            .map(|m| {
                let content = decode_content(&m.body).expect("fake cipher is an identity transform");
                (m.destination.clone(), content)
            })
            .collect()
    }

    /// Data messages sent to anyone but `own`
    pub fn data_sends(&self, own: &Address) -> Vec<Address> {
        self.sent_contents()
            .into_iter()
            .filter(|(to, c)| !to.matches(own) && matches!(c, Content::Data(_)))
            .map(|(to, _)| to)
            .collect()
    }

    /// Sent-transcript sync messages addressed to `own`
    pub fn transcripts(&self, own: &Address) -> Vec<sigmux_core::message::SentTranscript> {
        self.sent_contents()
            .into_iter()
            .filter(|(to, _)| to.matches(own))
            .filter_map(|(_, c)| match c {
                Content::Sync(sync) => sync.sent,
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn read(&self, _timeout: Duration) -> Result<Envelope, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.inbox.lock().pop_front() {
            Some(next) => next,
            None => Err(TransportError::Timeout),
        }
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.acked.lock().push(envelope.clone());
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if let Some(err) = self.failures.lock().get(&message.destination.identifier()) {
            return Err(err.clone());
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// ATTACHMENTS, GROUP SERVICE, PRE-KEYS
// ============================================================================

#[derive(Default)]
pub struct FakeAttachments {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: AtomicUsize,
}

impl FakeAttachments {
    pub fn host(&self, bytes: Vec<u8>) -> AttachmentPointer {
        let remote_id = Uuid::new_v4().to_string();
        let size = bytes.len() as u64;
        self.blobs.lock().insert(remote_id.clone(), bytes);
        AttachmentPointer {
            remote_id,
            content_type: "application/octet-stream".into(),
            size,
            key: vec![0; 32],
            file_name: None,
            preview: None,
        }
    }
}

#[async_trait]
impl AttachmentStore for FakeAttachments {
    async fn retrieve(
        &self,
        pointer: &AttachmentPointer,
        max_size: u64,
    ) -> Result<Vec<u8>, AttachmentError> {
        let bytes = self
            .blobs
            .lock()
            .get(&pointer.remote_id)
            .cloned()
            .ok_or_else(|| AttachmentError::NotFound(pointer.remote_id.clone()))?;
        if bytes.len() as u64 > max_size {
            return Err(AttachmentError::TooLarge { size: bytes.len() as u64, max: max_size });
        }
        Ok(bytes)
    }

    async fn upload(
        &self,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AttachmentPointer, AttachmentError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(self.host(bytes))
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    pub states: Mutex<HashMap<GroupIdV2, GroupV2State>>,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl GroupStateFetcher for FakeFetcher {
    async fn fetch_group(&self, group_id: &GroupIdV2) -> Result<GroupV2State, GroupError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.states.lock().get(group_id).cloned().ok_or(GroupError::NotFound)
    }
}

pub struct FakePreKeys {
    pub available: AtomicUsize,
    pub uploaded: AtomicUsize,
}

impl Default for FakePreKeys {
    fn default() -> Self {
        Self { available: AtomicUsize::new(100), uploaded: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl PreKeyService for FakePreKeys {
    async fn available_count(&self) -> Result<u32, TransportError> {
        Ok(self.available.load(Ordering::SeqCst) as u32)
    }

    fn generate(&self, ids: &[u32]) -> Vec<PreKeyRecord> {
        ids.iter().map(|id| PreKeyRecord { id: *id, record: vec![1, 2, 3] }).collect()
    }

    async fn upload(&self, keys: &[PreKeyRecord]) -> Result<(), TransportError> {
        self.uploaded.fetch_add(keys.len(), Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub manager: AccountManager,
    pub cipher: Arc<FakeCipher>,
    pub transport: Arc<FakeTransport>,
    pub attachments: Arc<FakeAttachments>,
    pub fetcher: Arc<FakeFetcher>,
    pub prekeys: Arc<FakePreKeys>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryStorage::new()))
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_fetcher(backend, Arc::new(FakeFetcher::default()))
    }

    pub fn with_fetcher(backend: Arc<dyn StorageBackend>, fetcher: Arc<FakeFetcher>) -> Self {
        let cipher = Arc::new(FakeCipher::default());
        let transport = Arc::new(FakeTransport::default());
        let attachments = Arc::new(FakeAttachments::default());
        let prekeys = Arc::new(FakePreKeys::default());
        let dir = tempfile::tempdir().expect("tempdir");

        let manager = AccountManager::builder(self_address(), backend)
            .cipher(cipher.clone())
            .transport(transport.clone())
            .attachments(attachments.clone())
            .group_fetcher(fetcher.clone())
            .prekey_service(prekeys.clone())
            .paths(AccountPaths::new(dir.path()))
            .build()
            .expect("build account");

        Self { manager, cipher, transport, attachments, fetcher, prekeys, dir }
    }

    pub fn me(&self) -> Address {
        self.manager.self_address().clone()
    }
}

pub fn self_address() -> Address {
    Address::new(
        Some(Uuid::from_bytes([0xAA; 16])),
        Some("+15559990000".into()),
    )
}

/// An envelope whose "ciphertext" is the encoded content
pub fn envelope(from: &Address, content: &Content, timestamp: u64) -> Envelope {
    Envelope {
        kind: EnvelopeType::Ciphertext,
        source: Some(from.clone()),
        source_device: 1,
        protocol_version: 3,
        timestamp,
        server_received_timestamp: timestamp,
        server_delivered_timestamp: timestamp,
        server_guid: Some(format!("guid-{}", timestamp)),
        content: encode_content(content).expect("encode"),
    }
}

pub fn receipt_envelope(from: &Address, timestamp: u64) -> Envelope {
    Envelope {
        kind: EnvelopeType::Receipt,
        source: Some(from.clone()),
        source_device: 1,
        protocol_version: 3,
        timestamp,
        server_received_timestamp: timestamp,
        server_delivered_timestamp: timestamp,
        server_guid: None,
        content: Vec::new(),
    }
}

pub type Call = (Envelope, Option<DecryptedContent>, Option<ReceiveError>);

/// Handler that records every call
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<Call>>,
}

impl ReceiveMessageHandler for Recorder {
    fn handle_message(
        &self,
        envelope: &Envelope,
        content: Option<&DecryptedContent>,
        error: Option<&ReceiveError>,
    ) {
        self.calls
            .lock()
            .push((envelope.clone(), content.cloned(), error.cloned()));
    }
}
