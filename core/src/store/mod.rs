// Store module: per-account persistence on a shared storage backend

pub mod backend;
pub mod contacts;
pub mod groups;
pub mod prekeys;
pub mod profiles;
pub mod queue;
pub mod recipients;
pub mod trust;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StoreError};
pub use contacts::{ContactInfo, ContactStore};
pub use groups::{GroupInfoV1, GroupStore, GroupV2State};
pub use prekeys::PreKeyStore;
pub use profiles::{ProfileKey, ProfileKeyStore};
pub use queue::{EnvelopeQueue, QueueId};
pub use recipients::RecipientStore;
pub use trust::{IdentityTrustRecord, TrustLevel, TrustStore};
