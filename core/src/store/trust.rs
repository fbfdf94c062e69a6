// Identity trust store
//
// Records every identity key ever observed for a peer together with its
// trust level. The first key seen for a peer is trusted on first use; a
// different key showing up later starts out untrusted until an operator
// or a verified sync message says otherwise.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::backend::{get_json, put_json, scan_json, StorageBackend, StoreError};
use crate::crypto::IdentityKey;
use crate::message::{Address, VerifiedState};

const TRUST_PREFIX: &str = "trust_";
const CURRENT_PREFIX: &str = "trustcur_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    TrustedUnverified,
    TrustedVerified,
    Untrusted,
}

impl TrustLevel {
    pub fn from_verified_state(state: VerifiedState) -> Self {
        match state {
            VerifiedState::Default => TrustLevel::TrustedUnverified,
            VerifiedState::Verified => TrustLevel::TrustedVerified,
            VerifiedState::Unverified => TrustLevel::Untrusted,
        }
    }

    pub fn to_verified_state(self) -> VerifiedState {
        match self {
            TrustLevel::TrustedUnverified => VerifiedState::Default,
            TrustLevel::TrustedVerified => VerifiedState::Verified,
            TrustLevel::Untrusted => VerifiedState::Unverified,
        }
    }

    pub fn is_trusted(self) -> bool {
        !matches!(self, TrustLevel::Untrusted)
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trusted_unverified" | "unverified" => Ok(TrustLevel::TrustedUnverified),
            "trusted_verified" | "verified" => Ok(TrustLevel::TrustedVerified),
            "untrusted" => Ok(TrustLevel::Untrusted),
            other => Err(format!("unknown trust level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTrustRecord {
    pub address: Address,
    pub key: IdentityKey,
    pub trust_level: TrustLevel,
    /// When the key was first recorded (ms)
    pub added: u64,
}

#[derive(Clone)]
pub struct TrustStore {
    backend: Arc<dyn StorageBackend>,
}

impl TrustStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn peer_prefix(peer: &Address) -> String {
        format!("{}{}_", TRUST_PREFIX, peer.identifier())
    }

    fn record_key(peer: &Address, key: &IdentityKey) -> String {
        format!("{}{}", Self::peer_prefix(peer), key.fingerprint())
    }

    fn current_key(peer: &Address) -> String {
        format!("{}{}", CURRENT_PREFIX, peer.identifier())
    }

    /// The key most recently observed or saved for a peer
    pub fn lookup(&self, peer: &Address) -> Result<Option<IdentityKey>, StoreError> {
        let Some(fingerprint) = get_json::<String>(&*self.backend, &Self::current_key(peer))?
        else {
            return Ok(None);
        };
        let key = format!("{}{}", Self::peer_prefix(peer), fingerprint);
        Ok(get_json::<IdentityTrustRecord>(&*self.backend, &key)?.map(|r| r.key))
    }

    pub fn record(
        &self,
        peer: &Address,
        key: &IdentityKey,
    ) -> Result<Option<IdentityTrustRecord>, StoreError> {
        get_json(&*self.backend, &Self::record_key(peer, key))
    }

    /// Record `key` for `peer` at `level` and make it the current key.
    /// This is the only way a key's level changes once recorded.
    pub fn save(
        &self,
        peer: &Address,
        key: &IdentityKey,
        level: TrustLevel,
    ) -> Result<(), StoreError> {
        let added = self
            .record(peer, key)?
            .map(|r| r.added)
            .unwrap_or_else(crate::current_timestamp_millis);
        let record = IdentityTrustRecord {
            address: peer.clone(),
            key: key.clone(),
            trust_level: level,
            added,
        };
        put_json(&*self.backend, &Self::record_key(peer, key), &record)?;
        put_json(&*self.backend, &Self::current_key(peer), &key.fingerprint())?;
        self.backend.flush()?;
        info!(peer = %peer, level = ?level, "saved identity");
        Ok(())
    }

    /// Note a key seen on the wire. A known key keeps its level; an unseen
    /// key is trusted only if it is the first one for this peer.
    pub fn observe(&self, peer: &Address, key: &IdentityKey) -> Result<TrustLevel, StoreError> {
        if let Some(existing) = self.record(peer, key)? {
            let fingerprint = key.fingerprint();
            let current: Option<String> = get_json(&*self.backend, &Self::current_key(peer))?;
            if current.as_deref() != Some(fingerprint.as_str()) {
                put_json(&*self.backend, &Self::current_key(peer), &fingerprint)?;
                self.backend.flush()?;
            }
            return Ok(existing.trust_level);
        }

        let known = self.backend.count_prefix(Self::peer_prefix(peer).as_bytes())?;
        let level = if known == 0 {
            TrustLevel::TrustedUnverified
        } else {
            warn!(peer = %peer, "identity key changed");
            TrustLevel::Untrusted
        };
        self.save(peer, key, level)?;
        Ok(level)
    }

    /// Whether messages may be encrypted to `peer` under `key`.
    /// Unknown keys are not trusted.
    pub fn is_trusted_for_send(
        &self,
        peer: &Address,
        key: &IdentityKey,
    ) -> Result<bool, StoreError> {
        Ok(self
            .record(peer, key)?
            .map_or(false, |r| r.trust_level.is_trusted()))
    }

    pub fn identities(&self, peer: &Address) -> Result<Vec<IdentityTrustRecord>, StoreError> {
        let mut records: Vec<IdentityTrustRecord> =
            scan_json(&*self.backend, &Self::peer_prefix(peer))?;
        records.sort_by_key(|r| r.added);
        Ok(records)
    }

    /// Move every record kept under `from` to `to`, once both are known to
    /// name the same peer. Records already present under `to` win.
    pub fn merge_into(&self, from: &Address, to: &Address) -> Result<(), StoreError> {
        if from.identifier() == to.identifier() {
            return Ok(());
        }
        let records: Vec<IdentityTrustRecord> =
            scan_json(&*self.backend, &Self::peer_prefix(from))?;
        if records.is_empty() {
            return Ok(());
        }

        for mut record in records {
            self.backend.remove(Self::record_key(from, &record.key).as_bytes())?;
            if self.record(to, &record.key)?.is_none() {
                record.address = to.clone();
                put_json(&*self.backend, &Self::record_key(to, &record.key), &record)?;
            }
        }
        let current: Option<String> = get_json(&*self.backend, &Self::current_key(from))?;
        if let Some(fingerprint) = current {
            if get_json::<String>(&*self.backend, &Self::current_key(to))?.is_none() {
                put_json(&*self.backend, &Self::current_key(to), &fingerprint)?;
            }
            self.backend.remove(Self::current_key(from).as_bytes())?;
        }
        self.backend.flush()?;
        info!(from = %from, to = %to, "merged identity records");
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<IdentityTrustRecord>, StoreError> {
        let mut records: Vec<IdentityTrustRecord> = scan_json(&*self.backend, TRUST_PREFIX)?;
        records.sort_by(|a, b| {
            a.address
                .identifier()
                .cmp(&b.address.identifier())
                .then(a.added.cmp(&b.added))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    fn store() -> TrustStore {
        TrustStore::new(Arc::new(MemoryStorage::new()))
    }

    fn key(b: u8) -> IdentityKey {
        IdentityKey::from_bytes(vec![b; 33])
    }

    #[test]
    fn test_first_key_trusted_on_first_use() {
        let trust = store();
        let peer = Address::from_number("+15550000001");
        assert_eq!(trust.observe(&peer, &key(1)).unwrap(), TrustLevel::TrustedUnverified);
        assert!(trust.is_trusted_for_send(&peer, &key(1)).unwrap());
        assert_eq!(trust.lookup(&peer).unwrap(), Some(key(1)));
    }

    #[test]
    fn test_changed_key_is_untrusted() {
        let trust = store();
        let peer = Address::from_number("+15550000001");
        trust.observe(&peer, &key(1)).unwrap();
        assert_eq!(trust.observe(&peer, &key(2)).unwrap(), TrustLevel::Untrusted);
        assert!(!trust.is_trusted_for_send(&peer, &key(2)).unwrap());
        assert_eq!(trust.lookup(&peer).unwrap(), Some(key(2)));
        assert_eq!(trust.identities(&peer).unwrap().len(), 2);
    }

    #[test]
    fn test_untrusted_stays_untrusted_until_saved() {
        let trust = store();
        let peer = Address::from_number("+15550000001");
        trust.save(&peer, &key(1), TrustLevel::Untrusted).unwrap();
        assert_eq!(trust.observe(&peer, &key(1)).unwrap(), TrustLevel::Untrusted);
        assert!(!trust.is_trusted_for_send(&peer, &key(1)).unwrap());

        trust.save(&peer, &key(1), TrustLevel::TrustedVerified).unwrap();
        assert!(trust.is_trusted_for_send(&peer, &key(1)).unwrap());
    }

    #[test]
    fn test_merge_keeps_trust_of_number_only_records() {
        let trust = store();
        let number = Address::from_number("+15550000001");
        let full = Address::new(Some(uuid::Uuid::new_v4()), Some("+15550000001".into()));
        trust.save(&number, &key(1), TrustLevel::Untrusted).unwrap();

        trust.merge_into(&number, &full).unwrap();
        assert!(trust.identities(&number).unwrap().is_empty());
        let records = trust.identities(&full).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, full);
        assert_eq!(trust.lookup(&full).unwrap(), Some(key(1)));
        assert!(!trust.is_trusted_for_send(&full, &key(1)).unwrap());
        // A second key under the merged form is not first use
        assert_eq!(trust.observe(&full, &key(2)).unwrap(), TrustLevel::Untrusted);
    }

    #[test]
    fn test_current_key_switch_is_flushed() {
        use crate::store::backend::CountingStorage;
        use std::sync::atomic::Ordering;

        let backend = Arc::new(CountingStorage::default());
        let trust = TrustStore::new(backend.clone());
        let peer = Address::from_number("+15550000001");
        trust.observe(&peer, &key(1)).unwrap();
        trust.observe(&peer, &key(2)).unwrap();

        backend.flushes.store(0, Ordering::SeqCst);
        trust.observe(&peer, &key(1)).unwrap();
        assert_eq!(trust.lookup(&peer).unwrap(), Some(key(1)));
        assert_eq!(backend.flushes.load(Ordering::SeqCst), 1);

        trust.observe(&peer, &key(1)).unwrap();
        assert_eq!(backend.flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_key_not_trusted() {
        let trust = store();
        let peer = Address::from_number("+15550000001");
        assert!(!trust.is_trusted_for_send(&peer, &key(9)).unwrap());
        assert!(trust.lookup(&peer).unwrap().is_none());
    }

    #[test]
    fn test_verified_state_mapping() {
        assert_eq!(
            TrustLevel::from_verified_state(VerifiedState::Unverified),
            TrustLevel::Untrusted
        );
        assert_eq!(
            TrustLevel::TrustedVerified.to_verified_state(),
            VerifiedState::Verified
        );
        assert_eq!("verified".parse::<TrustLevel>(), Ok(TrustLevel::TrustedVerified));
    }
}
