//! Stage identifiers for the fixed pipeline topology.
//!
//! The pipeline is a closed, ordered sequence of stages. Each stage owns one
//! queue, one payload key on the envelope and one bit in the completion mask.
//! Nothing about the topology is configurable at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One position in the ordered pipeline.
///
/// The declaration order is the pipeline order. Bit positions, payload keys
/// and queue names are all derived from the position, never stored.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    /// Entry stage, triggered by an external producer.
    Step1,

    /// Intermediate stage.
    Step2,

    /// Terminal stage. Consumes and logs, never forwards.
    Step3,
}

impl StageId {
    /// All stages in pipeline order.
    pub const ALL: [StageId; 3] = [StageId::Step1, StageId::Step2, StageId::Step3];

    /// Zero-based position in the pipeline.
    pub const fn index(self) -> u32 {
        match self {
            StageId::Step1 => 0,
            StageId::Step2 => 1,
            StageId::Step3 => 2,
        }
    }

    /// Completion-mask bit owned by this stage (`1 << index`).
    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    /// Name of the top-level envelope field carrying this stage's payload.
    pub const fn payload_key(self) -> &'static str {
        match self {
            StageId::Step1 => "step1",
            StageId::Step2 => "step2",
            StageId::Step3 => "step3",
        }
    }

    /// Name of the queue this stage consumes from.
    pub const fn queue_name(self) -> &'static str {
        match self {
            StageId::Step1 => "pipeline-step1",
            StageId::Step2 => "pipeline-step2",
            StageId::Step3 => "pipeline-step3",
        }
    }

    /// Human-readable message type name, used in validation errors.
    pub const fn message_type(self) -> &'static str {
        match self {
            StageId::Step1 => "Step1Message",
            StageId::Step2 => "Step2Message",
            StageId::Step3 => "Step3Message",
        }
    }

    /// The stage that consumes this stage's output, or `None` for the terminal stage.
    pub const fn next(self) -> Option<StageId> {
        match self {
            StageId::Step1 => Some(StageId::Step2),
            StageId::Step2 => Some(StageId::Step3),
            StageId::Step3 => None,
        }
    }

    /// The stage that produces this stage's input, or `None` for the entry stage.
    pub const fn previous(self) -> Option<StageId> {
        match self {
            StageId::Step1 => None,
            StageId::Step2 => Some(StageId::Step1),
            StageId::Step3 => Some(StageId::Step2),
        }
    }

    /// The entry stage is the only one whose input comes from outside the pipeline.
    pub const fn is_entry(self) -> bool {
        self.previous().is_none()
    }

    pub const fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Look up a stage by its envelope payload key (`"step2"`).
    pub fn from_payload_key(key: &str) -> Option<StageId> {
        StageId::ALL.into_iter().find(|s| s.payload_key() == key)
    }

    /// Look up a stage by the queue it consumes from.
    pub fn from_queue_name(queue: &str) -> Option<StageId> {
        StageId::ALL.into_iter().find(|s| s.queue_name() == queue)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload_key())
    }
}

/// Error returned when a string does not name a known stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage '{0}' (expected one of step1, step2, step3)")]
pub struct UnknownStage(pub String);

impl FromStr for StageId {
    type Err = UnknownStage;

    /// Accepts the payload key (`step2`), the 1-based position (`2`) or the
    /// queue name (`pipeline-step2`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lowered = trimmed.to_ascii_lowercase();

        if let Some(stage) = StageId::from_payload_key(&lowered) {
            return Ok(stage);
        }
        if let Some(stage) = StageId::from_queue_name(&lowered) {
            return Ok(stage);
        }
        if let Ok(position) = lowered.parse::<u32>() {
            if let Some(stage) = StageId::ALL.into_iter().find(|s| s.index() + 1 == position) {
                return Ok(stage);
            }
        }

        Err(UnknownStage(trimmed.to_string()))
    }
}
