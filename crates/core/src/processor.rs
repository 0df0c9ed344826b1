//! Stage processors.
//!
//! A processor turns a validated stage message into the payload for the next
//! stage. It reads the message and never mutates it. If it fails, nothing is
//! forwarded.

use async_trait::async_trait;
use qp_protocol::{StageId, StageMessage, StagePayload};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Processing failed at {stage}: {reason}")]
    Failed { stage: StageId, reason: String },

    /// The terminal stage has no successor to produce a payload for.
    #[error("Stage {0} has no next stage to produce a payload for")]
    NoNextStage(StageId),
}

/// Domain work performed by a stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError>;
}

/// Placeholder work: waits for a fixed delay, then returns a fixed payload
/// naming the next stage (`"Step 2 data"` for stage 1).
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// No delay, for tests and dry runs.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

/// Data the placeholder produces for `next`.
pub fn simulated_data_for(next: StageId) -> String {
    format!("Step {} data", next.index() + 1)
}

#[async_trait]
impl StageProcessor for SimulatedWork {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError> {
        let stage = message.stage();
        let next = stage.next().ok_or(ProcessingError::NoNextStage(stage))?;

        info!(
            stage = %stage,
            idempotency_id = message.idempotency_id(),
            data = %message.payload().some_data,
            "Processing data"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(StagePayload::new(simulated_data_for(next)))
    }
}
