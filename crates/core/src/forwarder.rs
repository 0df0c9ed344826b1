//! Forwarding to the next stage.
//!
//! The forwarder builds the next-stage envelope and sends it. Building is the
//! only place the completion mask changes, and it only ever ORs in the bit of
//! the stage that just finished.
//!
//! Every send opens a fresh client and sender and closes both before
//! returning, whether the send succeeded or not. Failures are logged and
//! returned; there is no retry here.

use qp_protocol::{Envelope, StageId, StageMessage, StagePayload};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::transport::{OutboundMessage, Transport, TransportError};

#[derive(Error, Debug)]
pub enum ForwardError {
    /// The terminal stage has nowhere to forward to.
    #[error("Stage {0} is terminal and does not forward")]
    TerminalStage(StageId),

    #[error("Failed to serialize envelope for queue {queue}: {source}")]
    Serialize {
        queue: String,
        source: serde_json::Error,
    },

    #[error("Error forwarding message to {queue} queue: {source}")]
    Send {
        queue: String,
        source: TransportError,
    },
}

/// Build the envelope for the stage after `message.stage()`.
///
/// All fields of the input are carried over, `completedStages` gains the
/// bit of the completed stage, and `payload` is recorded under the next
/// stage's key.
pub fn build_next_envelope(
    message: &StageMessage,
    payload: StagePayload,
) -> Result<(StageId, Envelope), ForwardError> {
    let completed = message.stage();
    let next = completed
        .next()
        .ok_or(ForwardError::TerminalStage(completed))?;

    let mut envelope = message.envelope().with_record(next, payload);
    envelope.completed_stages = envelope.completed_stages.with(completed);

    Ok((next, envelope))
}

/// Sends envelopes to stage queues through a [`Transport`].
#[derive(Clone)]
pub struct Forwarder {
    transport: Arc<dyn Transport>,
}

impl Forwarder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Build the next-stage envelope and send it to that stage's queue.
    ///
    /// Returns the stage the envelope was sent to and the envelope itself.
    pub async fn forward(
        &self,
        message: &StageMessage,
        payload: StagePayload,
    ) -> Result<(StageId, Envelope), ForwardError> {
        let (next, envelope) = build_next_envelope(message, payload)?;

        if let Some(previous) = message.stage().previous() {
            if !message.completed_stages().contains(previous) {
                warn!(
                    stage = %message.stage(),
                    idempotency_id = message.idempotency_id(),
                    completed_stages = message.completed_stages().bits(),
                    "Forwarding a message whose previous stage is not marked complete"
                );
            }
        }

        self.send_to_queue(next.queue_name(), &envelope).await?;
        Ok((next, envelope))
    }

    /// Send one envelope to `queue`.
    ///
    /// The client and sender are acquired for this call only and are always
    /// closed before returning.
    pub async fn send_to_queue(&self, queue: &str, envelope: &Envelope) -> Result<(), ForwardError> {
        let body = envelope.to_value().map_err(|source| ForwardError::Serialize {
            queue: queue.to_string(),
            source,
        })?;

        let result = self.send_scoped(queue, OutboundMessage::new(body)).await;

        match &result {
            Ok(()) => info!(
                queue,
                idempotency_id = %envelope.idempotency_id,
                "Successfully forwarded message to {queue} queue"
            ),
            Err(e) => error!(
                queue,
                idempotency_id = %envelope.idempotency_id,
                error = %e,
                "Error forwarding message to {queue} queue"
            ),
        }

        result.map_err(|source| ForwardError::Send {
            queue: queue.to_string(),
            source,
        })
    }

    async fn send_scoped(&self, queue: &str, message: OutboundMessage) -> Result<(), TransportError> {
        let mut client = self.transport.connect().await?;

        let sent = match client.create_sender(queue).await {
            Ok(mut sender) => {
                let sent = sender.send_message(message).await;
                if let Err(e) = sender.close().await {
                    warn!(queue, error = %e, "Failed to close sender");
                }
                sent
            }
            Err(e) => Err(e),
        };

        if let Err(e) = client.close().await {
            warn!(queue, error = %e, "Failed to close transport client");
        }

        sent
    }
}
