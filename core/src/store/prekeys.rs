// One-time pre-key records and the id allocation offset

use std::sync::Arc;

use super::backend::{StorageBackend, StoreError};

const PREKEY_PREFIX: &str = "prekey_";
const PREKEY_OFFSET_KEY: &[u8] = b"prekeymeta_offset";

#[derive(Clone)]
pub struct PreKeyStore {
    backend: Arc<dyn StorageBackend>,
}

impl PreKeyStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key(id: u32) -> String {
        format!("{}{:08x}", PREKEY_PREFIX, id)
    }

    pub fn store(&self, id: u32, record: &[u8]) -> Result<(), StoreError> {
        self.backend.put(Self::key(id).as_bytes(), record)
    }

    pub fn load(&self, id: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.get(Self::key(id).as_bytes())
    }

    pub fn contains(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self.load(id)?.is_some())
    }

    /// Consumed when a peer builds a session with it
    pub fn remove(&self, id: u32) -> Result<(), StoreError> {
        self.backend.remove(Self::key(id).as_bytes())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(PREKEY_PREFIX.as_bytes())
    }

    /// Next id to hand out. Starts at zero for a fresh account.
    pub fn next_offset(&self) -> Result<u32, StoreError> {
        match self.backend.get(PREKEY_OFFSET_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    key: "prekeymeta_offset".into(),
                    reason: format!("expected 4 bytes, found {}", bytes.len()),
                })?;
                Ok(u32::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn set_next_offset(&self, offset: u32) -> Result<(), StoreError> {
        self.backend.put(PREKEY_OFFSET_KEY, &offset.to_be_bytes())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    #[test]
    fn test_store_count_remove() {
        let store = PreKeyStore::new(Arc::new(MemoryStorage::new()));
        store.store(1, b"a").unwrap();
        store.store(2, b"b").unwrap();
        assert_eq!(store.count().unwrap(), 2);
        store.remove(1).unwrap();
        assert!(!store.contains(1).unwrap());
        assert_eq!(store.load(2).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_offset_defaults_to_zero() {
        let store = PreKeyStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(store.next_offset().unwrap(), 0);
        store.set_next_offset(101).unwrap();
        assert_eq!(store.next_offset().unwrap(), 101);
        // meta key must not be counted as a pre-key
        assert_eq!(store.count().unwrap(), 0);
    }
}
