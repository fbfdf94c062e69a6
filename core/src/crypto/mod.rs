// Cryptography seam: the session cipher capability and identity keys
//
// The ratchet itself lives behind `SessionCipher`. Every call into it goes
// through the account's `SessionLock`, held only for the duration of the
// call and never across an await point.

pub mod prekeys;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::message::{Address, Envelope};

pub use prekeys::{
    refresh_pre_keys, PreKeyRecord, PreKeyService, PREKEY_BATCH_SIZE, PREKEY_MAXIMUM_ID,
    PREKEY_MINIMUM_COUNT,
};

/// A peer's long-term public identity key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(Vec<u8>);

impl IdentityKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Blake3 of the key bytes, hex encoded. Used as the record key in the
    /// trust store and shown to operators.
    pub fn fingerprint(&self) -> String {
        hex::encode(blake3::hash(&self.0).as_bytes())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", &self.fingerprint()[..16])
    }
}

/// Output of a successful decrypt
#[derive(Debug, Clone, PartialEq)]
pub struct Plaintext {
    pub sender: Address,
    pub sender_device: u32,
    pub timestamp: u64,
    pub needs_receipt: bool,
    /// Sender identity key, when the envelope established or carried one
    pub identity: Option<IdentityKey>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("untrusted identity key for {address}")]
    UntrustedIdentity { address: Address, key: IdentityKey },
    #[error("legacy message format")]
    LegacyMessage,
    #[error("duplicate message")]
    DuplicateMessage,
    #[error("no session with {0}")]
    NoSession(Address),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// End-to-end session cipher for one account.
///
/// Implementations mutate ratchet state on every call and are therefore
/// only invoked under the account's session lock.
pub trait SessionCipher: Send + Sync {
    fn has_session(&self, peer: &Address) -> bool;

    /// Build a session from the peer's published keys and return the
    /// identity key it was built against.
    fn establish_session(&self, peer: &Address) -> Result<IdentityKey, CryptoError>;

    fn encrypt(&self, peer: &Address, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, envelope: &Envelope) -> Result<Plaintext, CryptoError>;

    fn delete_all_sessions(&self, peer: &Address);
}

/// Per-account mutual exclusion around session-state mutation
#[derive(Default)]
pub struct SessionLock(Mutex<()>);

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let key = IdentityKey::from_bytes(vec![5u8; 33]);
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, IdentityKey::from_bytes(vec![5u8; 33]).fingerprint());
        assert_ne!(fp, IdentityKey::from_bytes(vec![6u8; 33]).fingerprint());
    }

    #[test]
    fn test_session_lock_serializes() {
        let lock = Arc::new(SessionLock::new());
        let counter = Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        lock.with(|| *counter.lock() += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 800);
    }
}
