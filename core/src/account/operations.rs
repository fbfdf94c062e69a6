// Account-level operations built on the send pipeline: legacy group
// management, expiration timers, trust decisions, device sync replies.

use tracing::{debug, info, warn};

use super::AccountManager;
use crate::attachments;
use crate::groups::new_group_id;
use crate::message::{
    encode_snapshot, Address, AttachmentPointer, ContactsSnapshot, DataMessageBuilder,
    DeviceContact, GroupContext, GroupContextV1, GroupUpdateType, GroupsSnapshot, SyncMessage,
    SyncRequest, VerifiedMessage,
};
use crate::pipeline::SendMessageResult;
use crate::store::{GroupInfoV1, TrustLevel};
use crate::CoreError;

const SNAPSHOT_CONTENT_TYPE: &str = "application/octet-stream";

impl AccountManager {
    /// Create a legacy group (when `group_id` is None) or update one we
    /// belong to, then announce the result to every other member.
    pub async fn update_group(
        &self,
        group_id: Option<Vec<u8>>,
        name: Option<String>,
        members: Vec<Address>,
        avatar: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<SendMessageResult>), CoreError> {
        let mut group = match group_id {
            Some(id) => {
                let group = self.state.group_v1(&id)?.ok_or(CoreError::GroupNotFound)?;
                if !group.is_member(self.self_address()) {
                    return Err(CoreError::NotAGroupMember(group.hex_id()));
                }
                group
            }
            None => {
                let mut group = GroupInfoV1::new(new_group_id());
                group.add_members(&[self.self_address().clone()]);
                info!(group = %group.hex_id(), "creating group");
                group
            }
        };

        if name.is_some() {
            group.name = name;
        }
        let members = self.state.resolve_all(&members)?;
        group.add_members(&members);
        if let Some(bytes) = avatar {
            attachments::save_file(&self.paths.group_avatar_file(&group.group_id), &bytes).await?;
            group.has_avatar = true;
        }
        self.state.update_group_v1(&group)?;

        let recipients = self.other_members(&group.members);
        let results = self.send_group_update(&group.group_id, recipients).await?;
        Ok((group.group_id, results))
    }

    /// Send our view of a legacy group to `recipients`
    pub async fn send_group_update(
        &self,
        group_id: &[u8],
        recipients: Vec<Address>,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let group = self.state.group_v1(group_id)?.ok_or(CoreError::GroupNotFound)?;
        let avatar = if group.has_avatar { self.upload_group_avatar(&group).await } else { None };
        let mut builder = DataMessageBuilder::new().as_group(GroupContext::V1(GroupContextV1 {
            id: group.group_id.clone(),
            kind: GroupUpdateType::Update,
            name: group.name.clone(),
            members: Some(group.members.clone()),
            avatar,
        }));
        if group.message_expiration_time != 0 {
            builder = builder.with_expiration(group.message_expiration_time);
        }
        self.send_message(builder, recipients).await
    }

    async fn upload_group_avatar(&self, group: &GroupInfoV1) -> Option<AttachmentPointer> {
        let path = self.paths.group_avatar_file(&group.group_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(group = %group.hex_id(), error = %e, "no local avatar to attach");
                return None;
            }
        };
        match self.attachments.upload("image/*", bytes).await {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                warn!(group = %group.hex_id(), error = %e, "avatar upload failed");
                None
            }
        }
    }

    /// Ask `to` for the state of a group we have no record of
    pub async fn send_group_info_request(
        &self,
        group_id: Vec<u8>,
        to: &Address,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let builder = DataMessageBuilder::new().as_group(GroupContext::V1(GroupContextV1 {
            id: group_id,
            kind: GroupUpdateType::RequestInfo,
            name: None,
            members: None,
            avatar: None,
        }));
        self.send_message(builder, vec![to.clone()]).await
    }

    /// Leave a legacy group: tell the other members, then drop ourselves
    /// from the local record.
    pub async fn quit_group(&self, group_id: &[u8]) -> Result<Vec<SendMessageResult>, CoreError> {
        let group = self.state.group_v1(group_id)?.ok_or(CoreError::GroupNotFound)?;
        if !group.is_member(self.self_address()) {
            return Err(CoreError::NotAGroupMember(group.hex_id()));
        }
        let builder = DataMessageBuilder::new().as_group(GroupContext::V1(GroupContextV1 {
            id: group.group_id.clone(),
            kind: GroupUpdateType::Quit,
            name: None,
            members: None,
            avatar: None,
        }));
        let results = self.send_message(builder, self.other_members(&group.members)).await?;

        let self_address = self.self_address().clone();
        self.state.modify_group_v1(group_id, |g| {
            g.remove_member(&self_address);
            g.active = false;
        })?;
        info!(group = %group.hex_id(), "left group");
        Ok(results)
    }

    pub async fn set_group_expiration(
        &self,
        group_id: &[u8],
        seconds: u32,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let group = self
            .state
            .modify_group_v1(group_id, |g| g.message_expiration_time = seconds)?
            .ok_or(CoreError::GroupNotFound)?;
        let builder = DataMessageBuilder::new()
            .as_group(GroupContext::V1(GroupContextV1::deliver(group.group_id.clone())))
            .as_expiration_update()
            .with_expiration(seconds);
        self.send_message(builder, self.other_members(&group.members)).await
    }

    pub async fn set_contact_expiration(
        &self,
        peer: &Address,
        seconds: u32,
    ) -> Result<Vec<SendMessageResult>, CoreError> {
        let peer = self.state.resolve(peer)?;
        self.state.set_contact_expiration(&peer, seconds)?;
        let builder = DataMessageBuilder::new().as_expiration_update();
        self.send_message(builder, vec![peer]).await
    }

    /// Set the trust level of a key already recorded for `peer`, identified
    /// by its fingerprint, and tell our other devices. Returns false when
    /// no such key is known.
    pub async fn trust_identity(
        &self,
        peer: &Address,
        fingerprint: &str,
        level: TrustLevel,
    ) -> Result<bool, CoreError> {
        let peer = self.state.resolve(peer)?;
        let Some(record) = self
            .state
            .identities(&peer)?
            .into_iter()
            .find(|r| r.key.fingerprint().eq_ignore_ascii_case(fingerprint))
        else {
            return Ok(false);
        };

        self.state.save_identity(&peer, &record.key, level)?;
        let now = crate::current_timestamp_millis();
        let sync = SyncMessage {
            verified: Some(VerifiedMessage {
                destination: peer.clone(),
                identity_key: record.key,
                state: level.to_verified_state(),
                timestamp: now,
            }),
            ..Default::default()
        };
        if let Err(outcome) = self.send_sync_message(sync, now).await {
            warn!(peer = %peer, outcome = ?outcome, "verified sync failed");
        }
        Ok(true)
    }

    /// Ask our other devices to send us a snapshot
    pub async fn request_sync(&self, request: SyncRequest) -> Result<(), CoreError> {
        let sync = SyncMessage { request: Some(request), ..Default::default() };
        self.send_sync_message(sync, crate::current_timestamp_millis())
            .await
            .map_err(CoreError::SyncFailed)
    }

    /// Upload a complete contacts snapshot and point our devices at it
    pub async fn send_contacts_sync(&self) -> Result<(), CoreError> {
        let mut entries = Vec::new();
        for contact in self.state.contacts()? {
            let profile_key = self
                .state
                .profile_key(&contact.address)?
                .map(|k| k.as_bytes().to_vec());
            entries.push(DeviceContact {
                address: contact.address,
                name: contact.name,
                color: contact.color,
                avatar: None,
                expiration_timer: Some(contact.message_expiration_time),
                profile_key,
                blocked: contact.blocked,
                archived: contact.archived,
                inbox_position: contact.inbox_position,
            });
        }
        let count = entries.len();
        let blob = self
            .attachments
            .upload(SNAPSHOT_CONTENT_TYPE, encode_snapshot(&entries)?)
            .await?;
        let sync = SyncMessage {
            contacts: Some(ContactsSnapshot { blob, complete: true }),
            ..Default::default()
        };
        self.send_sync_message(sync, crate::current_timestamp_millis())
            .await
            .map_err(CoreError::SyncFailed)?;
        info!(count, "sent contacts sync");
        Ok(())
    }

    /// Upload a complete groups snapshot and point our devices at it
    pub async fn send_groups_sync(&self) -> Result<(), CoreError> {
        let entries: Vec<_> = self.state.groups_v1()?.iter().map(GroupInfoV1::to_snapshot).collect();
        let count = entries.len();
        let blob = self
            .attachments
            .upload(SNAPSHOT_CONTENT_TYPE, encode_snapshot(&entries)?)
            .await?;
        let sync = SyncMessage {
            groups: Some(GroupsSnapshot { blob, complete: true }),
            ..Default::default()
        };
        self.send_sync_message(sync, crate::current_timestamp_millis())
            .await
            .map_err(CoreError::SyncFailed)?;
        info!(count, "sent groups sync");
        Ok(())
    }
}
