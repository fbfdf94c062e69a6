// Account session manager
//
// An AccountManager binds one account's persistent state to the
// capabilities it talks through (cipher, transport, attachment service,
// group service, pre-key service). It is cheap to clone; clones share
// everything.

pub mod operations;
pub mod receiver;
pub mod registry;
pub mod state;

use std::sync::Arc;
use tracing::info;

use crate::attachments::{AccountPaths, AttachmentStore};
use crate::crypto::{PreKeyService, SessionCipher, SessionLock};
use crate::groups::GroupStateFetcher;
use crate::message::Address;
use crate::store::StorageBackend;
use crate::transport::Transport;
use crate::CoreError;

pub use receiver::{ReceiveMessageHandler, ReceiveOptions};
pub use registry::AccountRegistry;
pub use state::AccountState;

#[derive(Clone)]
pub struct AccountManager {
    pub(crate) state: Arc<AccountState>,
    pub(crate) cipher: Arc<dyn SessionCipher>,
    pub(crate) session_lock: Arc<SessionLock>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) attachments: Arc<dyn AttachmentStore>,
    pub(crate) group_fetcher: Arc<dyn GroupStateFetcher>,
    pub(crate) prekey_service: Arc<dyn PreKeyService>,
    pub(crate) paths: AccountPaths,
}

impl AccountManager {
    pub fn builder(self_address: Address, backend: Arc<dyn StorageBackend>) -> AccountBuilder {
        AccountBuilder::new(self_address, backend)
    }

    pub fn self_address(&self) -> &Address {
        self.state.self_address()
    }

    /// Read access to the account's stores
    pub fn state(&self) -> &AccountState {
        &self.state
    }

    pub fn paths(&self) -> &AccountPaths {
        &self.paths
    }

    /// Close the transport. A running receive loop ends after the envelope
    /// it is currently processing.
    pub fn shutdown(&self) {
        self.transport.shutdown();
        if let Err(e) = self.state.flush() {
            tracing::warn!(error = %e, "flush on shutdown failed");
        }
        info!(account = %self.self_address(), "account shut down");
    }

    /// Drop every session with `peer`. Invoked for end-session messages.
    pub(crate) fn end_session(&self, peer: &Address) {
        self.session_lock.with(|| self.cipher.delete_all_sessions(peer));
        info!(peer = %peer, "ended session");
    }
}

/// Assembles an AccountManager from its state backend and capabilities
pub struct AccountBuilder {
    self_address: Address,
    backend: Arc<dyn StorageBackend>,
    cipher: Option<Arc<dyn SessionCipher>>,
    transport: Option<Arc<dyn Transport>>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    group_fetcher: Option<Arc<dyn GroupStateFetcher>>,
    prekey_service: Option<Arc<dyn PreKeyService>>,
    paths: Option<AccountPaths>,
}

impl AccountBuilder {
    pub fn new(self_address: Address, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            self_address,
            backend,
            cipher: None,
            transport: None,
            attachments: None,
            group_fetcher: None,
            prekey_service: None,
            paths: None,
        }
    }

    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    pub fn cipher(mut self, cipher: Arc<dyn SessionCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn attachments(mut self, attachments: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn group_fetcher(mut self, fetcher: Arc<dyn GroupStateFetcher>) -> Self {
        self.group_fetcher = Some(fetcher);
        self
    }

    pub fn prekey_service(mut self, service: Arc<dyn PreKeyService>) -> Self {
        self.prekey_service = Some(service);
        self
    }

    pub fn paths(mut self, paths: AccountPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn build(self) -> Result<AccountManager, CoreError> {
        if !self.self_address.is_valid() {
            return Err(CoreError::InvalidInput("account address is empty".into()));
        }
        let state = AccountState::open(self.self_address, self.backend)?;
        Ok(AccountManager {
            state: Arc::new(state),
            cipher: self.cipher.ok_or(CoreError::MissingCapability("cipher"))?,
            session_lock: Arc::new(SessionLock::new()),
            transport: self.transport.ok_or(CoreError::MissingCapability("transport"))?,
            attachments: self
                .attachments
                .ok_or(CoreError::MissingCapability("attachments"))?,
            group_fetcher: self
                .group_fetcher
                .ok_or(CoreError::MissingCapability("group fetcher"))?,
            prekey_service: self
                .prekey_service
                .ok_or(CoreError::MissingCapability("pre-key service"))?,
            paths: self.paths.ok_or(CoreError::MissingCapability("paths"))?,
        })
    }
}
