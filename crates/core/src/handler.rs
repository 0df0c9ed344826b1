//! Per-stage message handlers.
//!
//! A [`StageHandler`] is what the hosting runtime invokes when a message
//! arrives on a stage queue. For every stage but the last it runs
//! validate → process → forward, in that order, and stops at the first error.
//! The terminal stage validates only to log what it received, then returns
//! without sending anything and without failing.
//!
//! Handlers hold no mutable state. Running one twice on the same input is
//! safe: everything it emits is derived from the input envelope.

use chrono::{DateTime, Utc};
use qp_protocol::{validate, Envelope, StageId, ValidationError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::forwarder::{ForwardError, Forwarder};
use crate::processor::{ProcessingError, StageProcessor};
use crate::transport::QueueMessage;

/// Diagnostics handle for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: Uuid,
    pub function_name: String,
    pub queue_name: String,

    /// Delivery attempt, starting at 1.
    pub delivery_count: u32,

    pub enqueued_at: Option<DateTime<Utc>>,
}

impl InvocationContext {
    /// Context for a direct invocation outside any queue delivery.
    pub fn new(stage: StageId) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            function_name: function_name(stage),
            queue_name: stage.queue_name().to_string(),
            delivery_count: 1,
            enqueued_at: None,
        }
    }

    /// Context for a message received from `stage`'s queue.
    pub fn from_delivery(stage: StageId, message: &QueueMessage) -> Self {
        Self {
            delivery_count: message.delivery_count,
            enqueued_at: Some(message.enqueued_at),
            ..Self::new(stage)
        }
    }
}

/// Name under which a stage's handler is registered with the host.
pub fn function_name(stage: StageId) -> String {
    format!("queue-pipeline-{stage}")
}

/// What a successful invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The next-stage envelope was sent to `to`'s queue.
    Forwarded { to: StageId, envelope: Envelope },

    /// Terminal stage reached. `valid` records whether the message passed
    /// validation; it is logged either way.
    Terminated { valid: bool },
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Forwarding(#[from] ForwardError),
}

/// Handler bound to one stage.
#[derive(Clone)]
pub struct StageHandler {
    stage: StageId,
    processor: Arc<dyn StageProcessor>,
    forwarder: Forwarder,
}

impl StageHandler {
    pub fn new(stage: StageId, processor: Arc<dyn StageProcessor>, forwarder: Forwarder) -> Self {
        Self {
            stage,
            processor,
            forwarder,
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Handle one raw inbound message.
    pub async fn handle(
        &self,
        raw: &Value,
        ctx: &InvocationContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let span = info_span!(
            "invocation",
            function = %ctx.function_name,
            stage = %self.stage,
            invocation_id = %ctx.invocation_id,
            delivery_count = ctx.delivery_count,
        );

        if self.stage.is_terminal() {
            return Ok(self.terminate(raw).instrument(span).await);
        }
        self.advance(raw).instrument(span).await
    }

    async fn advance(&self, raw: &Value) -> Result<HandlerOutcome, HandlerError> {
        let message = validate(raw, self.stage)?;
        info!(
            idempotency_id = message.idempotency_id(),
            completed_stages = message.completed_stages().bits(),
            "Received message"
        );

        let payload = self.processor.process(&message).await?;
        debug!(idempotency_id = message.idempotency_id(), "Processing complete");

        let (to, envelope) = self.forwarder.forward(&message, payload).await?;
        Ok(HandlerOutcome::Forwarded { to, envelope })
    }

    async fn terminate(&self, raw: &Value) -> HandlerOutcome {
        match validate(raw, self.stage) {
            Ok(message) => {
                info!(
                    idempotency_id = message.idempotency_id(),
                    completed_stages = message.completed_stages().bits(),
                    body = %raw,
                    "Pipeline complete"
                );
                HandlerOutcome::Terminated { valid: true }
            }
            Err(e) => {
                warn!(error = %e, body = %raw, "Terminal stage received a malformed message");
                HandlerOutcome::Terminated { valid: false }
            }
        }
    }
}

/// The handlers for every stage, in pipeline order.
#[derive(Clone)]
pub struct StageHandlers {
    handlers: Vec<StageHandler>,
}

impl StageHandlers {
    /// One handler per stage, all sharing `processor` and `forwarder`.
    pub fn standard(processor: Arc<dyn StageProcessor>, forwarder: Forwarder) -> Self {
        let handlers = StageId::ALL
            .into_iter()
            .map(|stage| StageHandler::new(stage, Arc::clone(&processor), forwarder.clone()))
            .collect();
        Self { handlers }
    }

    pub fn get(&self, stage: StageId) -> Option<&StageHandler> {
        self.handlers.iter().find(|h| h.stage == stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageHandler> {
        self.handlers.iter()
    }
}
