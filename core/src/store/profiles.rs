// Profile keys: the account's own key and the keys peers have shared

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::backend::{StorageBackend, StoreError};
use crate::message::Address;

const PROFILE_PREFIX: &str = "profile_";
const OWN_PROFILE_KEY: &[u8] = b"profilemeta_self";

pub const PROFILE_KEY_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ProfileKey([u8; PROFILE_KEY_LEN]);

impl ProfileKey {
    /// Accepts exactly 32 bytes; anything else is not a profile key.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; PROFILE_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn generate() -> Self {
        let mut raw = [0u8; PROFILE_KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProfileKey(..)")
    }
}

#[derive(Clone)]
pub struct ProfileKeyStore {
    backend: Arc<dyn StorageBackend>,
}

impl ProfileKeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key(address: &Address) -> String {
        format!("{}{}", PROFILE_PREFIX, address.identifier())
    }

    fn decode(bytes: Option<Vec<u8>>, key: &str) -> Result<Option<ProfileKey>, StoreError> {
        match bytes {
            Some(bytes) => ProfileKey::from_slice(&bytes).map(Some).ok_or_else(|| {
                StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("profile key of {} bytes", bytes.len()),
                }
            }),
            None => Ok(None),
        }
    }

    pub fn store(&self, address: &Address, key: &ProfileKey) -> Result<(), StoreError> {
        self.backend.put(Self::key(address).as_bytes(), key.as_bytes())?;
        self.backend.flush()
    }

    pub fn get(&self, address: &Address) -> Result<Option<ProfileKey>, StoreError> {
        let key = Self::key(address);
        Self::decode(self.backend.get(key.as_bytes())?, &key)
    }

    pub fn own(&self) -> Result<Option<ProfileKey>, StoreError> {
        Self::decode(self.backend.get(OWN_PROFILE_KEY)?, "profilemeta_self")
    }

    pub fn set_own(&self, key: &ProfileKey) -> Result<(), StoreError> {
        self.backend.put(OWN_PROFILE_KEY, key.as_bytes())?;
        self.backend.flush()
    }
}
