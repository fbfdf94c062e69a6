// Account directories under the data root
//
// <data_dir>/accounts/<uuid>/store   sled database
// <data_dir>/accounts/<uuid>/files   attachments and avatars

use anyhow::{Context, Result};
use sigmux_core::account::AccountState;
use sigmux_core::attachments::AccountPaths;
use sigmux_core::store::{RecipientStore, SledStorage, StorageBackend, TrustStore};
use sigmux_core::Address;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct AccountDir {
    pub uuid: Uuid,
    pub root: PathBuf,
}

/// An account store opened for inspection
pub struct OpenAccount {
    pub state: AccountState,
    pub trust: TrustStore,
    pub recipients: RecipientStore,
}

impl AccountDir {
    fn accounts_root(data_dir: &Path) -> PathBuf {
        data_dir.join("accounts")
    }

    /// Every account directory, sorted by uuid
    pub fn list(data_dir: &Path) -> Result<Vec<AccountDir>> {
        let root = Self::accounts_root(data_dir);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut accounts = Vec::new();
        for entry in std::fs::read_dir(&root).context("Failed to read accounts directory")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(uuid) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };
            accounts.push(AccountDir { uuid, root: entry.path() });
        }
        accounts.sort_by_key(|a| a.uuid);
        Ok(accounts)
    }

    pub fn locate(data_dir: &Path, account: &str) -> Result<AccountDir> {
        let uuid = Uuid::parse_str(account).context("Account must be a uuid")?;
        let root = Self::accounts_root(data_dir).join(uuid.to_string());
        if !root.exists() {
            anyhow::bail!("No account {} under {}", uuid, data_dir.display());
        }
        Ok(AccountDir { uuid, root })
    }

    /// Create the directory for a new account and initialize its store
    pub fn create(data_dir: &Path, uuid: Uuid, number: Option<String>) -> Result<AccountDir> {
        let root = Self::accounts_root(data_dir).join(uuid.to_string());
        if root.exists() {
            anyhow::bail!("Account {} already exists", uuid);
        }
        std::fs::create_dir_all(root.join("files"))
            .context("Failed to create account directory")?;

        let dir = AccountDir { uuid, root };
        let backend = dir.backend()?;
        let address = Address::new(Some(uuid), number);
        let state = AccountState::open(address, backend).context("Failed to initialize account store")?;
        state.flush()?;
        Ok(dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn paths(&self) -> AccountPaths {
        AccountPaths::new(self.root.join("files"))
    }

    fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        let storage = SledStorage::open(self.store_path())
            .context("Failed to open account store (is the daemon running?)")?;
        Ok(Arc::new(storage))
    }

    pub fn open(&self) -> Result<OpenAccount> {
        let backend = self.backend()?;
        let state = AccountState::open(Address::from_uuid(self.uuid), backend.clone())
            .context("Failed to load account state")?;
        Ok(OpenAccount {
            state,
            trust: TrustStore::new(backend.clone()),
            recipients: RecipientStore::new(backend),
        })
    }
}

/// Parse a uuid or phone number into an address
pub fn parse_address(value: &str) -> Result<Address> {
    if let Ok(uuid) = Uuid::parse_str(value) {
        return Ok(Address::from_uuid(uuid));
    }
    if value.starts_with('+') && value.len() > 1 && value[1..].chars().all(|c| c.is_ascii_digit()) {
        return Ok(Address::from_number(value));
    }
    anyhow::bail!("Not a uuid or +E164 number: {}", value)
}
