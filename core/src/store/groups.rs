// Group store: legacy (V1) group records and versioned (V2) group state

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::backend::{get_json, put_json, remove_prefix, scan_json, StorageBackend, StoreError};
use crate::message::{Address, DeviceGroup, GroupIdV2};

const GROUP_V1_PREFIX: &str = "groupv1_";
const GROUP_V2_PREFIX: &str = "groupv2_";

/// Membership helpers shared by both group kinds. Addresses are compared
/// with `Address::matches`, so a uuid-only and a number-only form of the
/// same peer never both end up in a member list.
fn add_member(members: &mut Vec<Address>, address: &Address) -> bool {
    if members.iter().any(|m| m.matches(address)) {
        return false;
    }
    members.push(address.clone());
    true
}

fn remove_member(members: &mut Vec<Address>, address: &Address) -> bool {
    let before = members.len();
    members.retain(|m| !m.matches(address));
    members.len() != before
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfoV1 {
    pub group_id: Vec<u8>,
    pub name: Option<String>,
    pub members: Vec<Address>,
    pub has_avatar: bool,
    pub message_expiration_time: u32,
    pub active: bool,
    pub blocked: bool,
    pub archived: bool,
    pub inbox_position: Option<u32>,
}

impl GroupInfoV1 {
    pub fn new(group_id: Vec<u8>) -> Self {
        Self {
            group_id,
            name: None,
            members: Vec::new(),
            has_avatar: false,
            message_expiration_time: 0,
            active: true,
            blocked: false,
            archived: false,
            inbox_position: None,
        }
    }

    pub fn from_snapshot(entry: &DeviceGroup) -> Self {
        Self {
            group_id: entry.id.clone(),
            name: entry.name.clone(),
            members: Vec::new(),
            has_avatar: entry.avatar.is_some(),
            message_expiration_time: entry.expiration_timer.unwrap_or(0),
            active: entry.active,
            blocked: entry.blocked,
            archived: entry.archived,
            inbox_position: entry.inbox_position,
        }
        .with_members(&entry.members)
    }

    fn with_members(mut self, members: &[Address]) -> Self {
        self.add_members(members);
        self
    }

    pub fn hex_id(&self) -> String {
        hex::encode(&self.group_id)
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m.matches(address))
    }

    /// Union `members` into the current member list
    pub fn add_members(&mut self, members: &[Address]) {
        for member in members {
            add_member(&mut self.members, member);
        }
    }

    pub fn remove_member(&mut self, address: &Address) -> bool {
        remove_member(&mut self.members, address)
    }

    pub fn to_snapshot(&self) -> DeviceGroup {
        DeviceGroup {
            id: self.group_id.clone(),
            name: self.name.clone(),
            members: self.members.clone(),
            avatar: None,
            expiration_timer: Some(self.message_expiration_time),
            active: self.active,
            blocked: self.blocked,
            archived: self.archived,
            inbox_position: self.inbox_position,
        }
    }
}

/// Authoritative state of a versioned group at a given revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupV2State {
    pub group_id: GroupIdV2,
    pub revision: u32,
    pub title: Option<String>,
    pub members: Vec<Address>,
    pub message_expiration_time: u32,
}

impl GroupV2State {
    pub fn new(group_id: GroupIdV2, revision: u32) -> Self {
        Self {
            group_id,
            revision,
            title: None,
            members: Vec::new(),
            message_expiration_time: 0,
        }
    }

    pub fn hex_id(&self) -> String {
        hex::encode(self.group_id)
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m.matches(address))
    }

    pub(crate) fn add_member(&mut self, address: &Address) -> bool {
        add_member(&mut self.members, address)
    }

    pub(crate) fn remove_member(&mut self, address: &Address) -> bool {
        remove_member(&mut self.members, address)
    }
}

#[derive(Clone)]
pub struct GroupStore {
    backend: Arc<dyn StorageBackend>,
}

impl GroupStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn v1_key(group_id: &[u8]) -> String {
        format!("{}{}", GROUP_V1_PREFIX, hex::encode(group_id))
    }

    fn v2_key(group_id: &GroupIdV2) -> String {
        format!("{}{}", GROUP_V2_PREFIX, hex::encode(group_id))
    }

    pub fn get(&self, group_id: &[u8]) -> Result<Option<GroupInfoV1>, StoreError> {
        get_json(&*self.backend, &Self::v1_key(group_id))
    }

    /// Insert or replace a V1 group
    pub fn update(&self, group: &GroupInfoV1) -> Result<(), StoreError> {
        put_json(&*self.backend, &Self::v1_key(&group.group_id), group)?;
        self.backend.flush()
    }

    pub fn list(&self) -> Result<Vec<GroupInfoV1>, StoreError> {
        scan_json(&*self.backend, GROUP_V1_PREFIX)
    }

    /// Drop every V1 group, used before applying a complete snapshot
    pub fn clear(&self) -> Result<usize, StoreError> {
        let removed = remove_prefix(&*self.backend, GROUP_V1_PREFIX)?;
        self.backend.flush()?;
        Ok(removed)
    }

    pub fn get_v2(&self, group_id: &GroupIdV2) -> Result<Option<GroupV2State>, StoreError> {
        get_json(&*self.backend, &Self::v2_key(group_id))
    }

    pub fn update_v2(&self, state: &GroupV2State) -> Result<(), StoreError> {
        put_json(&*self.backend, &Self::v2_key(&state.group_id), state)?;
        self.backend.flush()
    }

    pub fn list_v2(&self) -> Result<Vec<GroupV2State>, StoreError> {
        scan_json(&*self.backend, GROUP_V2_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;
    use uuid::Uuid;

    #[test]
    fn test_add_members_is_union() {
        let uuid = Uuid::new_v4();
        let mut group = GroupInfoV1::new(vec![1; 16]);
        group.add_members(&[Address::new(Some(uuid), Some("+1".into()))]);
        group.add_members(&[Address::from_uuid(uuid), Address::from_number("+2")]);
        assert_eq!(group.members.len(), 2);
        assert!(group.is_member(&Address::from_number("+1")));
    }

    #[test]
    fn test_remove_member() {
        let mut group = GroupInfoV1::new(vec![1; 16]);
        group.add_members(&[Address::from_number("+1"), Address::from_number("+2")]);
        assert!(group.remove_member(&Address::from_number("+1")));
        assert!(!group.remove_member(&Address::from_number("+1")));
        assert_eq!(group.members, vec![Address::from_number("+2")]);
    }

    #[test]
    fn test_v1_and_v2_records_are_separate() {
        let store = GroupStore::new(Arc::new(MemoryStorage::new()));
        store.update(&GroupInfoV1::new(vec![7; 16])).unwrap();
        store.update_v2(&GroupV2State::new([7; 32], 3)).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.list_v2().unwrap().len(), 1);
        assert_eq!(store.clear().unwrap(), 1);
        assert_eq!(store.get_v2(&[7; 32]).unwrap().map(|s| s.revision), Some(3));
    }
}
