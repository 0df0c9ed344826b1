//! Mock processors and transports for deterministic testing.

use async_trait::async_trait;
use qp_core::processor::{ProcessingError, StageProcessor};
use qp_core::transport::{
    OutboundMessage, QueueSender, Transport, TransportClient, TransportError,
};
use qp_protocol::{StageId, StageMessage, StagePayload};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A processor that always fails with a predefined reason.
pub struct FailingProcessor {
    pub reason: String,
    pub calls: AtomicUsize,
}

impl FailingProcessor {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StageProcessor for FailingProcessor {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProcessingError::Failed {
            stage: message.stage(),
            reason: self.reason.clone(),
        })
    }
}

/// A processor whose output differs on every call.
#[derive(Default)]
pub struct NonDeterministicProcessor {
    calls: AtomicUsize,
}

#[async_trait]
impl StageProcessor for NonDeterministicProcessor {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StagePayload::new(format!(
            "{} result #{n}",
            message.stage()
        )))
    }
}

/// A processor that fails the first `failures` calls, then succeeds.
pub struct FlakyProcessor {
    remaining_failures: AtomicUsize,
}

impl FlakyProcessor {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProcessingError::Failed {
                stage: message.stage(),
                reason: "transient".to_string(),
            });
        }
        let next = message.stage().next().ok_or(ProcessingError::NoNextStage(message.stage()))?;
        Ok(StagePayload::new(qp_core::processor::simulated_data_for(next)))
    }
}

/// Lifecycle events observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    SenderCreated(String),
    Sent(String, serde_json::Value),
    SenderClosed(String),
    ClientClosed,
}

/// A transport that records every call and can be told to fail sends.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub events: Arc<Mutex<Vec<TransportEvent>>>,
    pub fail_sends: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().expect("events poisoned").clone()
    }

    fn push(&self, event: TransportEvent) {
        self.events.lock().expect("events poisoned").push(event);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self) -> Result<Box<dyn TransportClient>, TransportError> {
        self.push(TransportEvent::Connected);
        Ok(Box::new(RecordingClient {
            transport: self.clone(),
        }))
    }
}

struct RecordingClient {
    transport: RecordingTransport,
}

#[async_trait]
impl TransportClient for RecordingClient {
    async fn create_sender(&mut self, queue: &str) -> Result<Box<dyn QueueSender>, TransportError> {
        self.transport.push(TransportEvent::SenderCreated(queue.to_string()));
        Ok(Box::new(RecordingSender {
            transport: self.transport.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.push(TransportEvent::ClientClosed);
        Ok(())
    }
}

struct RecordingSender {
    transport: RecordingTransport,
    queue: String,
}

#[async_trait]
impl QueueSender for RecordingSender {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn send_message(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.transport.fail_sends {
            return Err(TransportError::Rejected {
                queue: self.queue.clone(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.transport
            .push(TransportEvent::Sent(self.queue.clone(), message.body));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.push(TransportEvent::SenderClosed(self.queue.clone()));
        Ok(())
    }
}

/// Wraps another processor and records which stages it ran for.
pub struct RecordingProcessor<P> {
    inner: P,
    seen: Mutex<Vec<StageId>>,
}

impl<P> RecordingProcessor<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, stage: StageId) -> usize {
        self.seen
            .lock()
            .expect("seen poisoned")
            .iter()
            .filter(|s| **s == stage)
            .count()
    }
}

#[async_trait]
impl<P: StageProcessor> StageProcessor for RecordingProcessor<P> {
    async fn process(&self, message: &StageMessage) -> Result<StagePayload, ProcessingError> {
        let result = self.inner.process(message).await;
        if result.is_ok() {
            self.seen.lock().expect("seen poisoned").push(message.stage());
        }
        result
    }
}
