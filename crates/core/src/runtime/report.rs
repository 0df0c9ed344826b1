//! Summary of a drain run.

use qp_protocol::{Envelope, StageId};
use std::collections::BTreeMap;

use crate::handler::HandlerOutcome;

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    /// The handler returned normally.
    Completed(HandlerOutcome),

    /// The handler failed and the message was put back for redelivery.
    Abandoned { error: String, delivery_count: u32 },

    /// The handler failed on the last allowed delivery.
    DeadLettered { reason: String },
}

/// Per-stage invocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub invocations: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub stages: BTreeMap<StageId, StageStats>,

    /// Every envelope a handler forwarded, with its destination, in order.
    pub forwarded: Vec<(StageId, Envelope)>,

    /// Terminal invocations, split by whether the message validated.
    pub terminated_valid: usize,
    pub terminated_invalid: usize,

    /// Messages moved to a dead-letter queue, with the failing stage and reason.
    pub dead_lettered: Vec<(StageId, String)>,
}

impl DrainReport {
    pub fn record(&mut self, stage: StageId, result: &DeliveryResult) {
        let stats = self.stages.entry(stage).or_default();
        stats.invocations += 1;

        match result {
            DeliveryResult::Completed(HandlerOutcome::Forwarded { to, envelope }) => {
                self.forwarded.push((*to, envelope.clone()));
            }
            DeliveryResult::Completed(HandlerOutcome::Terminated { valid: true }) => {
                self.terminated_valid += 1;
            }
            DeliveryResult::Completed(HandlerOutcome::Terminated { valid: false }) => {
                self.terminated_invalid += 1;
            }
            DeliveryResult::Abandoned { .. } => stats.failures += 1,
            DeliveryResult::DeadLettered { reason } => {
                stats.failures += 1;
                self.dead_lettered.push((stage, reason.clone()));
            }
        }
    }

    pub fn stats(&self, stage: StageId) -> StageStats {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    /// The last envelope forwarded to the terminal stage, if any.
    pub fn final_envelope(&self) -> Option<&Envelope> {
        self.forwarded
            .iter()
            .rev()
            .find(|(to, _)| to.is_terminal())
            .map(|(_, envelope)| envelope)
    }

    pub fn total_invocations(&self) -> usize {
        self.stages.values().map(|s| s.invocations).sum()
    }
}
