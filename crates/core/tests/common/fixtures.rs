//! Envelope fixtures and pipeline builders.

use qp_core::forwarder::Forwarder;
use qp_core::handler::{StageHandler, StageHandlers};
use qp_core::processor::{SimulatedWork, StageProcessor};
use qp_core::runtime::{HostOptions, PipelineHost};
use qp_core::transport::InMemoryBroker;
use qp_protocol::StageId;
use serde_json::{json, Value};
use std::sync::Arc;

/// Entry message as an external producer would submit it.
pub fn step1_message(id: &str, data: &str) -> Value {
    json!({
        "idempotencyId": id,
        "completedStages": 0,
        "step1": { "someData": data }
    })
}

/// What stage 1 emits for `step1_message(id, data)`.
pub fn step2_message(id: &str, data: &str) -> Value {
    json!({
        "idempotencyId": id,
        "completedStages": 1,
        "step1": { "someData": data },
        "step2": { "someData": "Step 2 data" }
    })
}

pub fn step3_message(id: &str, data: &str) -> Value {
    json!({
        "idempotencyId": id,
        "completedStages": 3,
        "step1": { "someData": data },
        "step2": { "someData": "Step 2 data" },
        "step3": { "someData": "Step 3 data" }
    })
}

/// Handler for `stage` with instant simulated work, sending through `broker`.
pub fn instant_handler(stage: StageId, broker: &InMemoryBroker) -> StageHandler {
    StageHandler::new(
        stage,
        Arc::new(SimulatedWork::instant()),
        Forwarder::new(Arc::new(broker.clone())),
    )
}

/// Host over `broker` using `processor` for every stage.
pub fn host_with(
    broker: &InMemoryBroker,
    processor: Arc<dyn StageProcessor>,
    options: HostOptions,
) -> PipelineHost {
    let handlers = StageHandlers::standard(processor, Forwarder::new(Arc::new(broker.clone())));
    PipelineHost::new(broker.clone(), handlers, options)
}
