// Envelope retry queue: durable landing spot for every received envelope
//
// An envelope is written here before the server is acknowledged and removed
// only after the caller's handler has seen it. Anything left over after a
// crash is replayed on the next receive.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, warn};

use super::backend::{StorageBackend, StoreError};
use crate::message::{decode_stored_envelope, encode_stored_envelope, Envelope};

const QUEUE_PREFIX: &[u8] = b"envq_";
const QUEUE_NEXT_ID_KEY: &[u8] = b"envqmeta_next_id";

pub type QueueId = u64;

pub struct EnvelopeQueue {
    backend: Arc<dyn StorageBackend>,
    next_id: Mutex<QueueId>,
}

impl EnvelopeQueue {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Result<Self, StoreError> {
        let stored = match backend.get(QUEUE_NEXT_ID_KEY)? {
            Some(bytes) => decode_id(&bytes).unwrap_or(0),
            None => 0,
        };
        // Never reuse an id still present, even if the counter was lost.
        let highest = backend
            .scan_prefix(QUEUE_PREFIX)?
            .iter()
            .filter_map(|(key, _)| decode_id(&key[QUEUE_PREFIX.len()..]))
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);

        Ok(Self {
            backend,
            next_id: Mutex::new(stored.max(highest)),
        })
    }

    fn key(id: QueueId) -> Vec<u8> {
        let mut key = QUEUE_PREFIX.to_vec();
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// Persist an envelope and flush before returning its id
    pub fn enqueue(&self, envelope: &Envelope) -> Result<QueueId, StoreError> {
        let bytes =
            encode_stored_envelope(envelope).map_err(|e| StoreError::Encode(e.to_string()))?;

        let mut next = self.next_id.lock();
        let id = *next;
        self.backend.put(&Self::key(id), &bytes)?;
        self.backend.put(QUEUE_NEXT_ID_KEY, &(id + 1).to_be_bytes())?;
        self.backend.flush()?;
        *next = id + 1;
        Ok(id)
    }

    /// Oldest entry, if any
    pub fn next_unprocessed(&self) -> Result<Option<(QueueId, Envelope)>, StoreError> {
        self.next_after(None)
    }

    /// Oldest entry with an id greater than `cursor`. Entries that fail to
    /// decode are deleted and skipped. The scan starts just past `cursor`.
    pub fn next_after(
        &self,
        cursor: Option<QueueId>,
    ) -> Result<Option<(QueueId, Envelope)>, StoreError> {
        let mut start = match cursor {
            Some(c) if c == QueueId::MAX => return Ok(None),
            Some(c) => Self::key(c + 1),
            None => QUEUE_PREFIX.to_vec(),
        };
        while let Some((key, value)) = self.backend.first_from(QUEUE_PREFIX, &start)? {
            start = key.clone();
            start.push(0);
            let Some(id) = decode_id(&key[QUEUE_PREFIX.len()..]) else {
                warn!("queue key with malformed id, dropping");
                self.drop_key(&key);
                continue;
            };
            match decode_stored_envelope(&value) {
                Ok(envelope) => return Ok(Some((id, envelope))),
                Err(e) => {
                    error!(id, error = %e, "malformed queued envelope, deleting");
                    self.drop_key(&key);
                }
            }
        }
        Ok(None)
    }

    fn drop_key(&self, key: &[u8]) {
        if let Err(e) = self.backend.remove(key) {
            warn!(error = %e, "failed to delete malformed queue entry");
        }
    }

    pub fn delete(&self, id: QueueId) -> Result<(), StoreError> {
        self.backend.remove(&Self::key(id))?;
        self.backend.flush()
    }

    /// Ids of every entry still waiting, oldest first
    pub fn pending(&self) -> Result<Vec<QueueId>, StoreError> {
        Ok(self
            .backend
            .scan_prefix(QUEUE_PREFIX)?
            .iter()
            .filter_map(|(key, _)| decode_id(&key[QUEUE_PREFIX.len()..]))
            .collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(QUEUE_PREFIX)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn decode_id(bytes: &[u8]) -> Option<QueueId> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}
