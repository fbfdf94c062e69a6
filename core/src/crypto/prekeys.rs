// Pre-key maintenance: top up the server's one-time key supply

use async_trait::async_trait;
use tracing::{debug, info};

use crate::store::{PreKeyStore, StoreError};
use crate::transport::TransportError;

/// Replenish when the server holds fewer than this many keys
pub const PREKEY_MINIMUM_COUNT: u32 = 20;

/// Keys generated per refresh
pub const PREKEY_BATCH_SIZE: u32 = 100;

/// Key ids are 24-bit and wrap at this bound
pub const PREKEY_MAXIMUM_ID: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyRecord {
    pub id: u32,
    /// Serialized private record kept locally
    pub record: Vec<u8>,
}

/// Generation and publication of one-time pre-keys
#[async_trait]
pub trait PreKeyService: Send + Sync {
    /// Number of unused one-time keys the server still holds
    async fn available_count(&self) -> Result<u32, TransportError>;

    fn generate(&self, ids: &[u32]) -> Vec<PreKeyRecord>;

    async fn upload(&self, keys: &[PreKeyRecord]) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PreKeyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Ids for the next batch starting at `offset`, wrapping at the 24-bit bound
pub fn batch_ids(offset: u32) -> Vec<u32> {
    (0..PREKEY_BATCH_SIZE)
        .map(|i| (offset + i) % PREKEY_MAXIMUM_ID)
        .collect()
}

/// Generate, persist and upload a new batch when the server is running low.
/// Returns the number of keys published.
pub async fn refresh_pre_keys(
    store: &PreKeyStore,
    service: &dyn PreKeyService,
) -> Result<usize, PreKeyError> {
    let available = service.available_count().await?;
    if available >= PREKEY_MINIMUM_COUNT {
        debug!(available, "pre-key supply sufficient");
        return Ok(0);
    }

    let offset = store.next_offset()?;
    let keys = service.generate(&batch_ids(offset));
    for key in &keys {
        store.store(key.id, &key.record)?;
    }
    store.set_next_offset((offset + PREKEY_BATCH_SIZE + 1) % PREKEY_MAXIMUM_ID)?;
    store.flush()?;

    service.upload(&keys).await?;
    info!(available, published = keys.len(), "refreshed pre-keys");
    Ok(keys.len())
}
