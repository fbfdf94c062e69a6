// Recipient resolution: merge uuid-only and number-only forms of a peer
// into the fullest address known, so every other store keys on one form.

use std::sync::Arc;

use super::backend::{get_json, put_json, StorageBackend, StoreError};
use crate::message::Address;

const BY_UUID_PREFIX: &str = "recip_u_";
const BY_NUMBER_PREFIX: &str = "recip_n_";

#[derive(Clone)]
pub struct RecipientStore {
    backend: Arc<dyn StorageBackend>,
}

impl RecipientStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn save(&self, address: &Address) -> Result<(), StoreError> {
        if let Some(uuid) = address.uuid {
            put_json(&*self.backend, &format!("{}{}", BY_UUID_PREFIX, uuid), address)?;
        }
        if let Some(number) = &address.number {
            put_json(&*self.backend, &format!("{}{}", BY_NUMBER_PREFIX, number), address)?;
        }
        Ok(())
    }

    /// The stored record matching `address` by uuid, else by number
    pub fn known(&self, address: &Address) -> Result<Option<Address>, StoreError> {
        if let Some(uuid) = address.uuid {
            let found: Option<Address> =
                get_json(&*self.backend, &format!("{}{}", BY_UUID_PREFIX, uuid))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        match &address.number {
            Some(number) => get_json(&*self.backend, &format!("{}{}", BY_NUMBER_PREFIX, number)),
            None => Ok(None),
        }
    }

    /// The fullest known form of `address` without recording anything
    pub fn lookup(&self, address: &Address) -> Result<Address, StoreError> {
        Ok(Self::merge(self.known(address)?.as_ref(), address))
    }

    /// Return the fullest known form of `address`, recording any new
    /// identifier it contributes.
    pub fn resolve(&self, address: &Address) -> Result<Address, StoreError> {
        let known = self.known(address)?;
        let resolved = Self::merge(known.as_ref(), address);
        if known.as_ref() != Some(&resolved) {
            self.save(&resolved)?;
        }
        Ok(resolved)
    }

    fn merge(known: Option<&Address>, address: &Address) -> Address {
        match known {
            // A number re-registered under a new uuid moves to it.
            Some(k) if k.uuid.is_some() && address.uuid.is_some() && k.uuid != address.uuid => {
                address.clone()
            }
            Some(k) => Address::new(
                k.uuid.or(address.uuid),
                k.number.clone().or_else(|| address.number.clone()),
            ),
            None => address.clone(),
        }
    }
}
