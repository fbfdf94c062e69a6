// Receive loop
//
// Replays whatever the retry queue still holds, then reads from the
// transport until it times out (when asked to) or is closed. Every envelope
// is persisted before it is acknowledged and deleted only after the handler
// has been called, so a crash at any point loses nothing.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::AccountManager;
use crate::message::{DecryptedContent, Envelope};
use crate::pipeline::ReceiveError;
use crate::store::QueueId;
use crate::transport::TransportError;
use crate::CoreError;

/// Default wait for the next envelope
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub timeout: Duration,
    /// Stop at the first read timeout instead of waiting again
    pub return_on_timeout: bool,
    pub ignore_attachments: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            return_on_timeout: false,
            ignore_attachments: false,
        }
    }
}

/// Caller callback for every processed envelope. Exactly one of `content`
/// and `error` is normally set; both are None for receipts.
pub trait ReceiveMessageHandler: Send + Sync {
    fn handle_message(
        &self,
        envelope: &Envelope,
        content: Option<&DecryptedContent>,
        error: Option<&ReceiveError>,
    );
}

impl<F> ReceiveMessageHandler for F
where
    F: Fn(&Envelope, Option<&DecryptedContent>, Option<&ReceiveError>) + Send + Sync,
{
    fn handle_message(
        &self,
        envelope: &Envelope,
        content: Option<&DecryptedContent>,
        error: Option<&ReceiveError>,
    ) {
        self(envelope, content, error)
    }
}

impl AccountManager {
    /// Process every envelope left in the retry queue, oldest first.
    /// Returns how many were replayed.
    pub async fn retry_queued(
        &self,
        handler: &dyn ReceiveMessageHandler,
        ignore_attachments: bool,
    ) -> Result<usize, CoreError> {
        let mut cursor = None;
        let mut replayed = 0;
        while let Some((id, envelope)) = self.state.queue().next_after(cursor)? {
            cursor = Some(id);
            self.handle_envelope(&envelope, Some(id), handler, ignore_attachments)
                .await;
            replayed += 1;
        }
        Ok(replayed)
    }

    pub async fn receive_messages(
        &self,
        options: &ReceiveOptions,
        handler: &dyn ReceiveMessageHandler,
    ) -> Result<(), CoreError> {
        let replayed = self.retry_queued(handler, options.ignore_attachments).await?;
        if replayed > 0 {
            info!(replayed, "replayed queued envelopes");
        }

        loop {
            let envelope = match self.transport.read(options.timeout).await {
                Ok(envelope) => envelope,
                Err(TransportError::Timeout) => {
                    if options.return_on_timeout {
                        return Ok(());
                    }
                    continue;
                }
                Err(TransportError::InvalidVersion(detail)) => {
                    warn!(detail = %detail, "ignoring envelope with invalid version");
                    continue;
                }
                Err(TransportError::Closed) => {
                    info!("transport closed, receive loop ending");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let queue_id = match self.state.queue().enqueue(&envelope) {
                Ok(id) => {
                    if let Err(e) = self.transport.acknowledge(&envelope).await {
                        warn!(error = %e, "acknowledge failed");
                    }
                    Some(id)
                }
                Err(e) => {
                    // Left unacknowledged so the server redelivers it.
                    error!(error = %e, "failed to persist envelope");
                    None
                }
            };

            self.handle_envelope(&envelope, queue_id, handler, options.ignore_attachments)
                .await;
        }
    }

    async fn handle_envelope(
        &self,
        envelope: &Envelope,
        queue_id: Option<QueueId>,
        handler: &dyn ReceiveMessageHandler,
        ignore_attachments: bool,
    ) {
        let outcome = self.process_envelope(envelope, ignore_attachments);
        self.run_jobs(outcome.jobs).await;
        handler.handle_message(envelope, outcome.content.as_ref(), outcome.error.as_ref());

        if let Some(id) = queue_id {
            match self.state.queue().delete(id) {
                Ok(()) => debug!(id, "envelope done"),
                Err(e) => error!(id, error = %e, "failed to delete processed envelope"),
            }
        }
    }
}
