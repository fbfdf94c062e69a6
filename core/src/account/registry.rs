// Registry of open accounts, at most one manager per account uuid

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use super::{AccountBuilder, AccountManager};
use crate::CoreError;

#[derive(Default)]
pub struct AccountRegistry {
    accounts: RwLock<HashMap<Uuid, AccountManager>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the open manager for the builder's account, building and
    /// registering it first if needed. Concurrent opens of the same account
    /// all get the same manager.
    pub fn open(&self, builder: AccountBuilder) -> Result<AccountManager, CoreError> {
        let uuid = builder
            .self_address()
            .uuid
            .ok_or_else(|| CoreError::InvalidInput("account address has no uuid".into()))?;

        if let Some(existing) = self.accounts.read().get(&uuid) {
            return Ok(existing.clone());
        }

        let mut accounts = self.accounts.write();
        if let Some(existing) = accounts.get(&uuid) {
            return Ok(existing.clone());
        }
        let manager = builder.build()?;
        accounts.insert(uuid, manager.clone());
        info!(account = %manager.self_address(), "opened account");
        Ok(manager)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<AccountManager> {
        self.accounts.read().get(uuid).cloned()
    }

    /// Remove and shut down an account. Returns false if it was not open.
    pub fn close(&self, uuid: &Uuid) -> bool {
        let removed = self.accounts.write().remove(uuid);
        match removed {
            Some(manager) => {
                manager.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn list_open(&self) -> Vec<Uuid> {
        let mut open: Vec<Uuid> = self.accounts.read().keys().copied().collect();
        open.sort();
        open
    }

    pub fn close_all(&self) {
        let drained: Vec<AccountManager> = self.accounts.write().drain().map(|(_, m)| m).collect();
        for manager in drained {
            manager.shutdown();
        }
    }
}
