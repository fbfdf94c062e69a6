// Group reconciliation
//
// Legacy (V1) groups carry their membership inside messages and are merged
// additively here. Versioned (V2) groups are tracked by revision in `v2`.

pub mod v2;

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};

use crate::message::{Address, DeviceGroup, GroupContextV1, GroupUpdateType};
use crate::pipeline::Job;
use crate::store::{GroupInfoV1, GroupStore, StoreError};

pub use v2::{apply_delta, reconcile_v2, DeltaOutcome, GroupStateFetcher};

/// Length of a freshly minted legacy group id
pub const GROUP_V1_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("group not found")]
    NotFound,
    #[error("failed to fetch group state: {0}")]
    Fetch(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn new_group_id() -> Vec<u8> {
    let mut id = vec![0u8; GROUP_V1_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Apply an incoming legacy group context from `source`.
///
/// `expiration` is set when the carrying message was an expiration-timer
/// update; it is applied whatever the context type.
pub fn apply_v1(
    store: &GroupStore,
    context: &GroupContextV1,
    source: &Address,
    expiration: Option<u32>,
) -> Result<Vec<Job>, StoreError> {
    let mut jobs = Vec::new();
    let mut group = store.get(&context.id)?;
    let mut changed = false;
    let group_hex = hex::encode(&context.id);

    match context.kind {
        GroupUpdateType::Update => {
            let entry = group.get_or_insert_with(|| {
                info!(group = %group_hex, "creating group from update");
                GroupInfoV1::new(context.id.clone())
            });
            if let Some(avatar) = &context.avatar {
                entry.has_avatar = true;
                jobs.push(Job::RetrieveGroupAvatar {
                    group_id: context.id.clone(),
                    pointer: avatar.clone(),
                });
            }
            if context.name.is_some() {
                entry.name = context.name.clone();
            }
            if let Some(members) = &context.members {
                entry.add_members(members);
            }
            changed = true;
        }
        GroupUpdateType::Deliver => {
            if group.is_none() {
                debug!(group = %group_hex, "message for unknown group, requesting info");
                jobs.push(Job::SendGroupInfoRequest {
                    group_id: context.id.clone(),
                    to: source.clone(),
                });
            }
        }
        GroupUpdateType::Quit => match group.as_mut() {
            Some(entry) => {
                changed = entry.remove_member(source);
            }
            None => {
                jobs.push(Job::SendGroupInfoRequest {
                    group_id: context.id.clone(),
                    to: source.clone(),
                });
            }
        },
        GroupUpdateType::RequestInfo => {
            if group.is_some() {
                jobs.push(Job::SendGroupUpdate {
                    group_id: context.id.clone(),
                    to: source.clone(),
                });
            }
        }
        GroupUpdateType::Unknown => {
            debug!(group = %group_hex, "ignoring group context of unknown type");
        }
    }

    if let (Some(seconds), Some(entry)) = (expiration, group.as_mut()) {
        entry.message_expiration_time = seconds;
        changed = true;
    }

    if let (true, Some(entry)) = (changed, group.as_ref()) {
        store.update(entry)?;
    }
    Ok(jobs)
}

/// Apply a device-sync groups snapshot. A complete snapshot replaces all
/// local V1 groups; otherwise only the listed groups are replaced.
pub fn ingest_group_snapshot(
    store: &GroupStore,
    entries: &[DeviceGroup],
    complete: bool,
) -> Result<Vec<Job>, StoreError> {
    if complete {
        let removed = store.clear()?;
        debug!(removed, "cleared groups before complete snapshot");
    }

    let mut jobs = Vec::new();
    for entry in entries {
        store.update(&GroupInfoV1::from_snapshot(entry))?;
        if let Some(avatar) = &entry.avatar {
            jobs.push(Job::RetrieveGroupAvatar {
                group_id: entry.id.clone(),
                pointer: avatar.clone(),
            });
        }
    }
    info!(count = entries.len(), complete, "ingested groups snapshot");
    Ok(jobs)
}
