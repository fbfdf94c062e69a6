// Account state: the persistent maps owned by one account
//
// Reads are open to callers. Mutations are crate-private and each runs as
// one read-modify-write under the state lock, so concurrent receive and
// send paths never interleave partial updates.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crypto::IdentityKey;
use crate::groups::{self, v2};
use crate::message::{Address, DeviceContact, DeviceGroup, GroupContextV1, GroupContextV2};
use crate::pipeline::Job;
use crate::store::{
    ContactInfo, ContactStore, EnvelopeQueue, GroupInfoV1, GroupStore, GroupV2State,
    IdentityTrustRecord, PreKeyStore, ProfileKey, ProfileKeyStore, RecipientStore,
    StorageBackend, StoreError, TrustLevel, TrustStore,
};

pub struct AccountState {
    self_address: Address,
    backend: Arc<dyn StorageBackend>,
    queue: EnvelopeQueue,
    trust: TrustStore,
    contacts: ContactStore,
    groups: GroupStore,
    recipients: RecipientStore,
    profiles: ProfileKeyStore,
    prekeys: PreKeyStore,
    write_lock: Mutex<()>,
}

impl AccountState {
    pub fn open(self_address: Address, backend: Arc<dyn StorageBackend>) -> Result<Self, StoreError> {
        let state = Self {
            queue: EnvelopeQueue::new(backend.clone())?,
            trust: TrustStore::new(backend.clone()),
            contacts: ContactStore::new(backend.clone()),
            groups: GroupStore::new(backend.clone()),
            recipients: RecipientStore::new(backend.clone()),
            profiles: ProfileKeyStore::new(backend.clone()),
            prekeys: PreKeyStore::new(backend.clone()),
            backend,
            self_address: self_address.clone(),
            write_lock: Mutex::new(()),
        };
        state.recipients.resolve(&self_address)?;
        if state.profiles.own()?.is_none() {
            state.profiles.set_own(&ProfileKey::generate())?;
            info!("generated own profile key");
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    pub fn is_self(&self, address: &Address) -> bool {
        self.self_address.matches(address)
    }

    pub fn queue(&self) -> &EnvelopeQueue {
        &self.queue
    }

    pub(crate) fn prekeys(&self) -> &PreKeyStore {
        &self.prekeys
    }

    pub fn contact(&self, address: &Address) -> Result<Option<ContactInfo>, StoreError> {
        self.contacts.get(address)
    }

    pub fn contacts(&self) -> Result<Vec<ContactInfo>, StoreError> {
        self.contacts.list()
    }

    /// Expiration timer for 1:1 messages to `address`, 0 when unset
    pub fn contact_expiration(&self, address: &Address) -> Result<u32, StoreError> {
        Ok(self
            .contacts
            .get(address)?
            .map_or(0, |c| c.message_expiration_time))
    }

    pub fn group_v1(&self, group_id: &[u8]) -> Result<Option<GroupInfoV1>, StoreError> {
        self.groups.get(group_id)
    }

    pub fn groups_v1(&self) -> Result<Vec<GroupInfoV1>, StoreError> {
        self.groups.list()
    }

    pub fn group_v2(&self, group_id: &[u8; 32]) -> Result<Option<GroupV2State>, StoreError> {
        self.groups.get_v2(group_id)
    }

    pub fn groups_v2(&self) -> Result<Vec<GroupV2State>, StoreError> {
        self.groups.list_v2()
    }

    /// Trust reads go through the fullest known address so every form of a
    /// peer sees the same records.
    pub fn identities(&self, peer: &Address) -> Result<Vec<IdentityTrustRecord>, StoreError> {
        self.trust.identities(&self.recipients.lookup(peer)?)
    }

    pub fn all_identities(&self) -> Result<Vec<IdentityTrustRecord>, StoreError> {
        self.trust.all()
    }

    pub fn current_identity(&self, peer: &Address) -> Result<Option<IdentityKey>, StoreError> {
        self.trust.lookup(&self.recipients.lookup(peer)?)
    }

    pub fn is_trusted_for_send(&self, peer: &Address, key: &IdentityKey) -> Result<bool, StoreError> {
        self.trust.is_trusted_for_send(&self.recipients.lookup(peer)?, key)
    }

    pub fn own_profile_key(&self) -> Result<Option<ProfileKey>, StoreError> {
        self.profiles.own()
    }

    pub fn profile_key(&self, address: &Address) -> Result<Option<ProfileKey>, StoreError> {
        self.profiles.get(address)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub(crate) fn resolve(&self, address: &Address) -> Result<Address, StoreError> {
        let _guard = self.write_lock.lock();
        self.resolve_locked(address)
    }

    pub(crate) fn resolve_all(&self, addresses: &[Address]) -> Result<Vec<Address>, StoreError> {
        let _guard = self.write_lock.lock();
        self.resolve_all_locked(addresses)
    }

    // Caller holds the write lock. When a number-only peer gains its uuid,
    // identity records kept under the number move to the merged address.
    fn resolve_locked(&self, address: &Address) -> Result<Address, StoreError> {
        let before = self.recipients.known(address)?;
        let resolved = self.recipients.resolve(address)?;
        if let Some(before) = before {
            if before.uuid.is_none() && resolved.uuid.is_some() {
                self.trust.merge_into(&before, &resolved)?;
            }
        }
        Ok(resolved)
    }

    fn resolve_all_locked(&self, addresses: &[Address]) -> Result<Vec<Address>, StoreError> {
        addresses.iter().map(|a| self.resolve_locked(a)).collect()
    }

    pub(crate) fn observe_identity(
        &self,
        peer: &Address,
        key: &IdentityKey,
    ) -> Result<TrustLevel, StoreError> {
        let _guard = self.write_lock.lock();
        let peer = self.resolve_locked(peer)?;
        self.trust.observe(&peer, key)
    }

    pub(crate) fn save_identity(
        &self,
        peer: &Address,
        key: &IdentityKey,
        level: TrustLevel,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let peer = self.resolve_locked(peer)?;
        self.trust.save(&peer, key, level)
    }

    pub(crate) fn set_contact_expiration(
        &self,
        address: &Address,
        seconds: u32,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut contact = self.contacts.get_or_default(address)?;
        contact.message_expiration_time = seconds;
        self.contacts.update(&contact)
    }

    pub(crate) fn apply_group_v1(
        &self,
        context: &GroupContextV1,
        source: &Address,
        expiration: Option<u32>,
    ) -> Result<Vec<Job>, StoreError> {
        let _guard = self.write_lock.lock();
        let mut context = context.clone();
        if let Some(members) = &context.members {
            context.members = Some(self.resolve_all_locked(members)?);
        }
        groups::apply_v1(&self.groups, &context, source, expiration)
    }

    pub(crate) fn reconcile_group_v2(&self, context: &GroupContextV2) -> Result<Vec<Job>, StoreError> {
        let _guard = self.write_lock.lock();
        v2::reconcile_v2(&self.groups, context)
    }

    pub(crate) fn store_fetched_group_v2(&self, state: &GroupV2State) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        v2::store_fetched_state(&self.groups, state)
    }

    pub(crate) fn update_group_v1(&self, group: &GroupInfoV1) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.groups.update(group)
    }

    /// Apply `f` to a stored V1 group and persist the result
    pub(crate) fn modify_group_v1<F>(&self, group_id: &[u8], f: F) -> Result<Option<GroupInfoV1>, StoreError>
    where
        F: FnOnce(&mut GroupInfoV1),
    {
        let _guard = self.write_lock.lock();
        let Some(mut group) = self.groups.get(group_id)? else {
            return Ok(None);
        };
        f(&mut group);
        self.groups.update(&group)?;
        Ok(Some(group))
    }

    pub(crate) fn ingest_group_snapshot(
        &self,
        entries: &[DeviceGroup],
        complete: bool,
    ) -> Result<Vec<Job>, StoreError> {
        let _guard = self.write_lock.lock();
        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut entry = entry.clone();
            entry.members = self.resolve_all_locked(&entry.members)?;
            resolved.push(entry);
        }
        groups::ingest_group_snapshot(&self.groups, &resolved, complete)
    }

    /// Apply a device-sync contacts snapshot. A complete snapshot replaces
    /// every local contact.
    pub(crate) fn ingest_contact_snapshot(
        &self,
        entries: &[DeviceContact],
        complete: bool,
    ) -> Result<Vec<Job>, StoreError> {
        let _guard = self.write_lock.lock();
        if complete {
            let removed = self.contacts.clear()?;
            debug!(removed, "cleared contacts before complete snapshot");
        }

        let mut jobs = Vec::new();
        for entry in entries {
            let address = self.resolve_locked(&entry.address)?;
            let mut contact = self.contacts.get_or_default(&address)?;
            contact.address = address.clone();
            contact.update_from(entry);
            self.contacts.update(&contact)?;

            if let Some(avatar) = &entry.avatar {
                jobs.push(Job::RetrieveContactAvatar {
                    address: address.clone(),
                    pointer: avatar.clone(),
                });
            }
            if let Some(bytes) = &entry.profile_key {
                match ProfileKey::from_slice(bytes) {
                    Some(key) => self.profiles.store(&address, &key)?,
                    None => warn!(peer = %address, len = bytes.len(), "ignoring malformed profile key"),
                }
            }
        }
        info!(count = entries.len(), complete, "ingested contacts snapshot");
        Ok(jobs)
    }

    pub(crate) fn store_profile_key(&self, address: &Address, key: &ProfileKey) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.profiles.store(address, key)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }
}
