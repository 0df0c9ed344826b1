//! Local hosting runtime.
//!
//! Stands in for the function host: it pulls messages from the in-memory
//! broker, invokes the matching [`StageHandler`], and applies the broker's
//! delivery policy. A failed invocation is abandoned for redelivery until the
//! delivery limit is hit, then dead-lettered. The handlers themselves never
//! retry.
//!
//! Two modes are offered:
//! - [`PipelineHost::drain`] pumps every queue in stage order until all are
//!   empty. Deterministic, used by the CLI and tests.
//! - [`PipelineHost::run`] runs one worker per stage, each allowed a bounded
//!   number of concurrent invocations, until shut down.

pub mod report;

use qp_protocol::StageId;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::models::GlobalConfig;
use crate::handler::{InvocationContext, StageHandlers};
use crate::transport::{InMemoryBroker, QueueMessage, TransportError};

pub use report::{DeliveryResult, DrainReport, StageStats};

/// Delivery policy and concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOptions {
    /// Deliveries attempted before a message is dead-lettered.
    pub max_delivery_count: u32,

    /// Concurrent invocations per stage in [`PipelineHost::run`].
    pub max_concurrent_calls: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
            max_concurrent_calls: 16,
        }
    }
}

impl From<&GlobalConfig> for HostOptions {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            max_delivery_count: config.max_delivery_count.max(1),
            max_concurrent_calls: config.max_concurrent_calls.max(1),
        }
    }
}

/// Binds stage handlers to the broker's queues.
pub struct PipelineHost {
    broker: InMemoryBroker,
    handlers: StageHandlers,
    options: HostOptions,
}

impl PipelineHost {
    pub fn new(broker: InMemoryBroker, handlers: StageHandlers, options: HostOptions) -> Self {
        Self {
            broker,
            handlers,
            options,
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn options(&self) -> HostOptions {
        self.options
    }

    /// Invoke `stage`'s handler for one received message and settle it.
    ///
    /// # Errors
    ///
    /// Only broker errors surface here. Handler errors are settled by
    /// abandoning or dead-lettering the message and reported in the result.
    pub async fn deliver(
        &self,
        stage: StageId,
        message: QueueMessage,
    ) -> Result<DeliveryResult, TransportError> {
        let queue = stage.queue_name();
        let handler = self
            .handlers
            .get(stage)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;

        let ctx = InvocationContext::from_delivery(stage, &message);

        match handler.handle(&message.body, &ctx).await {
            Ok(outcome) => {
                debug!(queue, message_id = %message.message_id, "Invocation succeeded");
                Ok(DeliveryResult::Completed(outcome))
            }
            Err(e) => {
                let reason = e.to_string();
                let delivery_count = message.delivery_count;

                if delivery_count >= self.options.max_delivery_count {
                    error!(
                        queue,
                        message_id = %message.message_id,
                        delivery_count,
                        error = %reason,
                        "Invocation failed on final delivery, dead-lettering"
                    );
                    self.broker.dead_letter(queue, message, reason.clone())?;
                    Ok(DeliveryResult::DeadLettered { reason })
                } else {
                    warn!(
                        queue,
                        message_id = %message.message_id,
                        delivery_count,
                        error = %reason,
                        "Invocation failed, abandoning for redelivery"
                    );
                    self.broker.abandon(queue, message)?;
                    Ok(DeliveryResult::Abandoned {
                        error: reason,
                        delivery_count,
                    })
                }
            }
        }
    }

    /// Deliver messages in stage order until every queue is empty.
    pub async fn drain(&self) -> Result<DrainReport, TransportError> {
        let mut report = DrainReport::default();

        loop {
            let mut progressed = false;

            for stage in StageId::ALL {
                while let Some(message) = self.broker.try_receive(stage.queue_name())? {
                    progressed = true;
                    let result = self.deliver(stage, message).await?;
                    report.record(stage, &result);
                }
            }

            if !progressed {
                break;
            }
        }

        info!(
            invocations = report.total_invocations(),
            dead_lettered = report.dead_lettered.len(),
            "Pipeline drained"
        );
        Ok(report)
    }

    /// Run one worker per stage until `shutdown` turns `true`.
    ///
    /// In-flight invocations are allowed to finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut workers = JoinSet::new();

        for stage in StageId::ALL {
            let host = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { host.stage_worker(stage, shutdown).await });
        }

        info!(
            stages = StageId::ALL.len(),
            max_concurrent_calls = self.options.max_concurrent_calls,
            "Pipeline host started"
        );

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Stage worker stopped with a broker error");
                    outcome = Err(e);
                }
                Err(e) => error!(error = %e, "Stage worker panicked"),
            }
        }

        info!("Pipeline host stopped");
        outcome
    }

    async fn stage_worker(
        self: Arc<Self>,
        stage: StageId,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let queue = stage.queue_name();
        let limit = Arc::new(Semaphore::new(self.options.max_concurrent_calls));
        let mut in_flight = JoinSet::new();
        let mut outcome = Ok(());

        while !*shutdown.borrow() {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.broker.receive(queue) => match received {
                    Ok(message) => message,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                },
            };

            let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                break;
            };

            let host = Arc::clone(&self);
            in_flight.spawn(async move {
                let result = host.deliver(stage, message).await;
                drop(permit);
                if let Err(e) = result {
                    error!(queue, error = %e, "Failed to settle message");
                }
            });

            // Reap finished invocations so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        // Dropping the set would abort invocations that already hold a message.
        while in_flight.join_next().await.is_some() {}
        debug!(queue, "Stage worker stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::Forwarder;
    use crate::processor::SimulatedWork;
    use crate::transport::OutboundMessage;
    use serde_json::json;

    fn host(broker: &InMemoryBroker, max_delivery_count: u32) -> PipelineHost {
        let handlers = StageHandlers::standard(
            Arc::new(SimulatedWork::instant()),
            Forwarder::new(Arc::new(broker.clone())),
        );
        PipelineHost::new(
            broker.clone(),
            handlers,
            HostOptions {
                max_delivery_count,
                max_concurrent_calls: 4,
            },
        )
    }

    #[tokio::test]
    async fn test_drain_runs_message_through_all_stages() {
        let broker = InMemoryBroker::new("test");
        broker
            .enqueue(
                StageId::Step1.queue_name(),
                OutboundMessage::new(json!({
                    "idempotencyId": "abc",
                    "completedStages": 0,
                    "step1": {"someData": "x"}
                })),
            )
            .unwrap();

        let report = host(&broker, 3).drain().await.unwrap();

        assert_eq!(report.total_invocations(), 3);
        assert_eq!(report.terminated_valid, 1);
        let last = report.final_envelope().unwrap();
        assert_eq!(last.completed_stages.bits(), 3);
        assert!(broker.is_idle().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_message_is_dead_lettered_after_limit() {
        let broker = InMemoryBroker::new("test");
        broker
            .enqueue(StageId::Step1.queue_name(), OutboundMessage::new(json!({"bad": true})))
            .unwrap();

        let report = host(&broker, 3).drain().await.unwrap();

        assert_eq!(report.stats(StageId::Step1).invocations, 3);
        assert_eq!(report.stats(StageId::Step1).failures, 3);
        assert_eq!(report.dead_lettered.len(), 1);
        assert!(report.dead_lettered[0].1.contains("Step1Message"));

        let dead = broker.dead_letters(StageId::Step1.queue_name()).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.delivery_count, 3);
        assert_eq!(report.stats(StageId::Step2).invocations, 0);
    }

    #[tokio::test]
    async fn test_options_from_config_clamp_to_one() {
        let config = GlobalConfig {
            max_delivery_count: 0,
            max_concurrent_calls: 0,
            ..GlobalConfig::default()
        };
        let options = HostOptions::from(&config);
        assert_eq!(options.max_delivery_count, 1);
        assert_eq!(options.max_concurrent_calls, 1);
    }
}
