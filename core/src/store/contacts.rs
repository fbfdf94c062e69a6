// Contact store
//
// Local view of the account's contacts. Entries arrive from device-sync
// snapshots and from expiration timer changes in 1:1 conversations.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::backend::{get_json, put_json, remove_prefix, scan_json, StorageBackend, StoreError};
use crate::message::{Address, DeviceContact};

const CONTACT_PREFIX: &str = "contact_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub address: Address,
    pub name: Option<String>,
    pub color: Option<String>,
    /// Disappearing-message timer in seconds, 0 when off
    pub message_expiration_time: u32,
    pub blocked: bool,
    pub archived: bool,
    pub inbox_position: Option<u32>,
    pub has_avatar: bool,
}

impl ContactInfo {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            color: None,
            message_expiration_time: 0,
            blocked: false,
            archived: false,
            inbox_position: None,
            has_avatar: false,
        }
    }

    /// Overlay a snapshot entry. Fields the snapshot leaves empty keep
    /// their local value.
    pub fn update_from(&mut self, entry: &DeviceContact) {
        if entry.name.is_some() {
            self.name = entry.name.clone();
        }
        if entry.color.is_some() {
            self.color = entry.color.clone();
        }
        if let Some(timer) = entry.expiration_timer {
            self.message_expiration_time = timer;
        }
        self.blocked = entry.blocked;
        self.archived = entry.archived;
        self.inbox_position = entry.inbox_position;
        self.has_avatar = self.has_avatar || entry.avatar.is_some();
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.identifier())
    }
}

#[derive(Clone)]
pub struct ContactStore {
    backend: Arc<dyn StorageBackend>,
}

impl ContactStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key(address: &Address) -> String {
        format!("{}{}", CONTACT_PREFIX, address.identifier())
    }

    pub fn get(&self, address: &Address) -> Result<Option<ContactInfo>, StoreError> {
        get_json(&*self.backend, &Self::key(address))
    }

    pub fn get_or_default(&self, address: &Address) -> Result<ContactInfo, StoreError> {
        Ok(self
            .get(address)?
            .unwrap_or_else(|| ContactInfo::new(address.clone())))
    }

    /// Insert or replace
    pub fn update(&self, contact: &ContactInfo) -> Result<(), StoreError> {
        put_json(&*self.backend, &Self::key(&contact.address), contact)?;
        self.backend.flush()
    }

    pub fn list(&self) -> Result<Vec<ContactInfo>, StoreError> {
        let mut contacts: Vec<ContactInfo> = scan_json(&*self.backend, CONTACT_PREFIX)?;
        contacts.sort_by_key(|c| c.display_name());
        Ok(contacts)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        let removed = remove_prefix(&*self.backend, CONTACT_PREFIX)?;
        self.backend.flush()?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(CONTACT_PREFIX.as_bytes())
    }
}
