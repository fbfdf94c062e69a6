// Attachment service seam and on-disk layout for downloaded blobs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::message::{Address, AttachmentPointer};

/// Cap on a single attachment download: 150 MB
pub const MAX_ATTACHMENT_SIZE: u64 = 150 * 1024 * 1024;

/// Cap on avatar downloads: 10 MB
pub const MAX_AVATAR_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment {0} not found")]
    NotFound(String),
    #[error("attachment of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("attachment service error: {0}")]
    Service(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Download and decrypt the blob behind `pointer`
    async fn retrieve(
        &self,
        pointer: &AttachmentPointer,
        max_size: u64,
    ) -> Result<Vec<u8>, AttachmentError>;

    /// Encrypt and upload `bytes`, returning a pointer peers can fetch
    async fn upload(
        &self,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AttachmentPointer, AttachmentError>;
}

/// Where an account keeps downloaded files
#[derive(Debug, Clone)]
pub struct AccountPaths {
    root: PathBuf,
}

impl AccountPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attachment_file(&self, remote_id: &str) -> PathBuf {
        self.root.join("attachments").join(sanitize(remote_id))
    }

    pub fn attachment_preview_file(&self, remote_id: &str) -> PathBuf {
        self.root
            .join("attachments")
            .join(format!("{}.preview", sanitize(remote_id)))
    }

    pub fn group_avatar_file(&self, group_id: &[u8]) -> PathBuf {
        self.root
            .join("avatars")
            .join(format!("group-{}", hex::encode(group_id)))
    }

    pub fn contact_avatar_file(&self, address: &Address) -> PathBuf {
        self.root
            .join("avatars")
            .join(format!("contact-{}", sanitize(&address.identifier())))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '+' { c } else { '_' })
        .collect()
}

/// Write `bytes` to `path`, creating parent directories
pub async fn save_file(path: &Path, bytes: &[u8]) -> Result<(), AttachmentError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
