// Follow-up jobs produced while dispatching received content
//
// Each job runs in its own task so a failure or panic in one never stops
// the others or the receive loop.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::account::AccountManager;
use crate::attachments::{self, AttachmentError, MAX_ATTACHMENT_SIZE, MAX_AVATAR_SIZE};
use crate::crypto::prekeys::{refresh_pre_keys, PreKeyError};
use crate::groups::GroupError;
use crate::message::{
    decode_snapshot, Address, AttachmentPointer, CodecError, ContactsSnapshot, DeviceContact,
    DeviceGroup, GroupIdV2, GroupsSnapshot, ReceiptMessage, ReceiptType,
};
use crate::store::StoreError;
use crate::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    SendDeliveryReceipt { to: Address, timestamps: Vec<u64> },
    RefreshPreKeys,
    /// Ask a member for the state of a group we do not know
    SendGroupInfoRequest { group_id: Vec<u8>, to: Address },
    /// Answer a member's info request with our view of the group
    SendGroupUpdate { group_id: Vec<u8>, to: Address },
    SendContactsSync,
    SendGroupsSync,
    RetrieveAttachment(AttachmentPointer),
    RetrieveGroupAvatar { group_id: Vec<u8>, pointer: AttachmentPointer },
    RetrieveContactAvatar { address: Address, pointer: AttachmentPointer },
    IngestGroupSnapshot(GroupsSnapshot),
    IngestContactSnapshot(ContactsSnapshot),
    RefreshGroupV2(GroupIdV2),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::SendDeliveryReceipt { .. } => "send_delivery_receipt",
            Job::RefreshPreKeys => "refresh_pre_keys",
            Job::SendGroupInfoRequest { .. } => "send_group_info_request",
            Job::SendGroupUpdate { .. } => "send_group_update",
            Job::SendContactsSync => "send_contacts_sync",
            Job::SendGroupsSync => "send_groups_sync",
            Job::RetrieveAttachment(_) => "retrieve_attachment",
            Job::RetrieveGroupAvatar { .. } => "retrieve_group_avatar",
            Job::RetrieveContactAvatar { .. } => "retrieve_contact_avatar",
            Job::IngestGroupSnapshot(_) => "ingest_group_snapshot",
            Job::IngestContactSnapshot(_) => "ingest_contact_snapshot",
            Job::RefreshGroupV2(_) => "refresh_group_v2",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    PreKeys(#[from] PreKeyError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("send to {0} failed")]
    SendFailed(Address),
}

impl AccountManager {
    /// Run each job to completion in its own task, logging failures.
    pub async fn run_jobs(&self, jobs: Vec<Job>) {
        for job in jobs {
            let name = job.name();
            let this = self.clone();
            let handle = tokio::spawn(async move { this.run_job(job).await });
            match handle.await {
                Ok(Ok(())) => debug!(job = name, "job finished"),
                Ok(Err(e)) => warn!(job = name, error = %e, "job failed"),
                Err(e) => error!(job = name, error = %e, "job panicked"),
            }
        }
    }

    pub async fn run_job(&self, job: Job) -> Result<(), JobError> {
        match job {
            Job::SendDeliveryReceipt { to, timestamps } => {
                let receipt = ReceiptMessage {
                    kind: ReceiptType::Delivery,
                    timestamps,
                    when: crate::current_timestamp_millis(),
                };
                let result = self.send_receipt(receipt, &to).await?;
                if !result.is_success() {
                    return Err(JobError::SendFailed(to));
                }
                Ok(())
            }
            Job::RefreshPreKeys => {
                refresh_pre_keys(self.state.prekeys(), &*self.prekey_service).await?;
                Ok(())
            }
            Job::SendGroupInfoRequest { group_id, to } => {
                let results = self.send_group_info_request(group_id, &to).await?;
                require_success(results, to)
            }
            Job::SendGroupUpdate { group_id, to } => {
                let results = self.send_group_update(&group_id, vec![to.clone()]).await?;
                require_success(results, to)
            }
            Job::SendContactsSync => Ok(self.send_contacts_sync().await?),
            Job::SendGroupsSync => Ok(self.send_groups_sync().await?),
            Job::RetrieveAttachment(pointer) => self.retrieve_attachment(&pointer).await,
            Job::RetrieveGroupAvatar { group_id, pointer } => {
                let path = self.paths.group_avatar_file(&group_id);
                Ok(self.save_avatar(&pointer, path).await?)
            }
            Job::RetrieveContactAvatar { address, pointer } => {
                let path = self.paths.contact_avatar_file(&address);
                Ok(self.save_avatar(&pointer, path).await?)
            }
            Job::IngestGroupSnapshot(snapshot) => {
                let bytes = self
                    .attachments
                    .retrieve(&snapshot.blob, MAX_ATTACHMENT_SIZE)
                    .await?;
                let entries: Vec<DeviceGroup> = decode_snapshot(&bytes)?;
                let follow_up = self.state.ingest_group_snapshot(&entries, snapshot.complete)?;
                self.run_avatar_jobs(follow_up).await;
                Ok(())
            }
            Job::IngestContactSnapshot(snapshot) => {
                let bytes = self
                    .attachments
                    .retrieve(&snapshot.blob, MAX_ATTACHMENT_SIZE)
                    .await?;
                let entries: Vec<DeviceContact> = decode_snapshot(&bytes)?;
                let follow_up = self.state.ingest_contact_snapshot(&entries, snapshot.complete)?;
                self.run_avatar_jobs(follow_up).await;
                Ok(())
            }
            Job::RefreshGroupV2(group_id) => {
                let fetched = self.group_fetcher.fetch_group(&group_id).await?;
                if self.state.store_fetched_group_v2(&fetched)? {
                    debug!(group = %fetched.hex_id(), revision = fetched.revision, "replaced group state");
                }
                Ok(())
            }
        }
    }

    // Avatar downloads queued by snapshot ingestion. Each failure is logged
    // and the rest still run.
    async fn run_avatar_jobs(&self, jobs: Vec<Job>) {
        for job in jobs {
            let result = match &job {
                Job::RetrieveGroupAvatar { group_id, pointer } => {
                    self.save_avatar(pointer, self.paths.group_avatar_file(group_id)).await
                }
                Job::RetrieveContactAvatar { address, pointer } => {
                    self.save_avatar(pointer, self.paths.contact_avatar_file(address)).await
                }
                other => {
                    debug!(job = other.name(), "not an avatar job, skipping");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(job = job.name(), error = %e, "avatar download failed");
            }
        }
    }

    async fn save_avatar(
        &self,
        pointer: &AttachmentPointer,
        path: std::path::PathBuf,
    ) -> Result<(), AttachmentError> {
        let bytes = self.attachments.retrieve(pointer, MAX_AVATAR_SIZE).await?;
        attachments::save_file(&path, &bytes).await
    }

    async fn retrieve_attachment(&self, pointer: &AttachmentPointer) -> Result<(), JobError> {
        if let Some(preview) = &pointer.preview {
            let path = self.paths.attachment_preview_file(&pointer.remote_id);
            attachments::save_file(&path, preview).await?;
        }
        let bytes = self.attachments.retrieve(pointer, MAX_ATTACHMENT_SIZE).await?;
        attachments::save_file(&self.paths.attachment_file(&pointer.remote_id), &bytes).await?;
        debug!(attachment = %pointer.remote_id, size = bytes.len(), "stored attachment");
        Ok(())
    }
}

fn require_success(
    results: Vec<crate::pipeline::SendMessageResult>,
    to: Address,
) -> Result<(), JobError> {
    if results.iter().any(|r| r.address.matches(&to) && !r.is_success()) {
        return Err(JobError::SendFailed(to));
    }
    Ok(())
}
