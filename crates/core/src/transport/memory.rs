//! In-process broker.
//!
//! One FIFO queue per stage plus a dead-letter sub-queue for each. Receivers
//! are woken through a shared [`Notify`]. The broker also counts open
//! connections and senders so callers can check that every forward released
//! what it acquired.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qp_protocol::StageId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use super::{
    parse_connection_string, ConnectionTarget, OutboundMessage, QueueMessage, QueueSender,
    Transport, TransportClient, TransportError,
};

/// Suffix appended to a queue name to address its dead-letter sub-queue.
pub const DEAD_LETTER_SUFFIX: &str = "/$deadletterqueue";

/// Name of the dead-letter sub-queue for `queue`.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// A message moved out of its queue after exhausting deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

struct BrokerState {
    namespace: String,
    queues: Mutex<HashMap<String, VecDeque<QueueMessage>>>,
    dead_letters: Mutex<HashMap<String, Vec<DeadLetter>>>,
    failing_queues: Mutex<HashSet<String>>,
    unreadable_queues: Mutex<HashSet<String>>,
    notify: Notify,
    open_connections: AtomicUsize,
    open_senders: AtomicUsize,
}

/// Broker holding every stage queue in memory.
///
/// Cloning is cheap and all clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, TransportError> {
    mutex.lock().map_err(|_| TransportError::Poisoned)
}

impl InMemoryBroker {
    /// Create a broker with one queue per pipeline stage.
    pub fn new(namespace: impl Into<String>) -> Self {
        let queues = StageId::ALL
            .iter()
            .map(|stage| (stage.queue_name().to_string(), VecDeque::new()))
            .collect();

        Self {
            state: Arc::new(BrokerState {
                namespace: namespace.into(),
                queues: Mutex::new(queues),
                dead_letters: Mutex::new(HashMap::new()),
                failing_queues: Mutex::new(HashSet::new()),
                unreadable_queues: Mutex::new(HashSet::new()),
                notify: Notify::new(),
                open_connections: AtomicUsize::new(0),
                open_senders: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a broker from a `memory://<namespace>` connection string.
    pub fn from_connection_string(connection: &str) -> Result<Self, TransportError> {
        match parse_connection_string(connection)? {
            ConnectionTarget::Memory { namespace } => Ok(Self::new(namespace)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.state.namespace
    }

    /// Append a message to `queue`.
    pub fn enqueue(&self, queue: &str, message: OutboundMessage) -> Result<(), TransportError> {
        {
            let mut queues = lock(&self.state.queues)?;
            let entries = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            entries.push_back(QueueMessage {
                message_id: message.message_id,
                body: message.body,
                delivery_count: 0,
                enqueued_at: Utc::now(),
            });
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    /// Take the next message from `queue` without waiting.
    ///
    /// The returned message's delivery count includes this receive.
    pub fn try_receive(&self, queue: &str) -> Result<Option<QueueMessage>, TransportError> {
        if lock(&self.state.unreadable_queues)?.contains(queue) {
            return Err(TransportError::Unavailable(queue.to_string()));
        }
        let mut queues = lock(&self.state.queues)?;
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        Ok(entries.pop_front().map(|mut message| {
            message.delivery_count += 1;
            message
        }))
    }

    /// Wait for the next message on `queue`.
    pub async fn receive(&self, queue: &str) -> Result<QueueMessage, TransportError> {
        loop {
            // Register interest before checking so an enqueue in between is not missed.
            let notified = self.state.notify.notified();
            if let Some(message) = self.try_receive(queue)? {
                return Ok(message);
            }
            notified.await;
        }
    }

    /// Return a received message to the back of its queue for redelivery.
    pub fn abandon(&self, queue: &str, message: QueueMessage) -> Result<(), TransportError> {
        {
            let mut queues = lock(&self.state.queues)?;
            let entries = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            entries.push_back(message);
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    /// Move a received message to the dead-letter sub-queue of `queue`.
    pub fn dead_letter(
        &self,
        queue: &str,
        message: QueueMessage,
        reason: impl Into<String>,
    ) -> Result<(), TransportError> {
        if !lock(&self.state.queues)?.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        lock(&self.state.dead_letters)?
            .entry(dead_letter_queue_name(queue))
            .or_default()
            .push(DeadLetter {
                message,
                reason: reason.into(),
                dead_lettered_at: Utc::now(),
            });
        Ok(())
    }

    /// Number of messages waiting on `queue`.
    pub fn len(&self, queue: &str) -> Result<usize, TransportError> {
        lock(&self.state.queues)?
            .get(queue)
            .map(VecDeque::len)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }

    /// True when no stage queue holds a message.
    pub fn is_idle(&self) -> Result<bool, TransportError> {
        Ok(lock(&self.state.queues)?.values().all(VecDeque::is_empty))
    }

    /// Snapshot of the dead-letter sub-queue for `queue`.
    pub fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, TransportError> {
        Ok(lock(&self.state.dead_letters)?
            .get(&dead_letter_queue_name(queue))
            .cloned()
            .unwrap_or_default())
    }

    /// Make every send to `queue` fail until [`InMemoryBroker::restore_sends_to`].
    pub fn fail_sends_to(&self, queue: &str) -> Result<(), TransportError> {
        lock(&self.state.failing_queues)?.insert(queue.to_string());
        Ok(())
    }

    pub fn restore_sends_to(&self, queue: &str) -> Result<(), TransportError> {
        lock(&self.state.failing_queues)?.remove(queue);
        Ok(())
    }

    /// Make every receive from `queue` fail until
    /// [`InMemoryBroker::restore_receives_from`].
    pub fn fail_receives_from(&self, queue: &str) -> Result<(), TransportError> {
        lock(&self.state.unreadable_queues)?.insert(queue.to_string());
        Ok(())
    }

    pub fn restore_receives_from(&self, queue: &str) -> Result<(), TransportError> {
        lock(&self.state.unreadable_queues)?.remove(queue);
        Ok(())
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    pub fn open_senders(&self) -> usize {
        self.state.open_senders.load(Ordering::SeqCst)
    }

    fn send(&self, queue: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if lock(&self.state.failing_queues)?.contains(queue) {
            return Err(TransportError::Rejected {
                queue: queue.to_string(),
                reason: "sends disabled".to_string(),
            });
        }
        self.enqueue(queue, message)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn TransportClient>, TransportError> {
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryClient {
            broker: self.clone(),
            closed: false,
        }))
    }
}

/// Connection handle onto an [`InMemoryBroker`].
pub struct InMemoryClient {
    broker: InMemoryBroker,
    closed: bool,
}

#[async_trait]
impl TransportClient for InMemoryClient {
    async fn create_sender(&mut self, queue: &str) -> Result<Box<dyn QueueSender>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed("client".to_string()));
        }
        self.broker.len(queue)?;
        self.broker.state.open_senders.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemorySender {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.broker.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Sender bound to one in-memory queue.
pub struct InMemorySender {
    broker: InMemoryBroker,
    queue: String,
    closed: bool,
}

#[async_trait]
impl QueueSender for InMemorySender {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn send_message(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed(format!("sender for {}", self.queue)));
        }
        self.broker.send(&self.queue, message)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.broker.state.open_senders.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const Q1: &str = "pipeline-step1";

    #[test]
    fn test_broker_has_one_queue_per_stage() {
        let broker = InMemoryBroker::new("test");
        for stage in StageId::ALL {
            assert_eq!(broker.len(stage.queue_name()).unwrap(), 0);
        }
        assert!(broker.len("nope").is_err());
        assert!(broker.is_idle().unwrap());
    }

    #[test]
    fn test_fifo_and_delivery_count() {
        let broker = InMemoryBroker::new("test");
        broker.enqueue(Q1, OutboundMessage::new(json!(1))).unwrap();
        broker.enqueue(Q1, OutboundMessage::new(json!(2))).unwrap();

        let first = broker.try_receive(Q1).unwrap().unwrap();
        assert_eq!(first.body, json!(1));
        assert_eq!(first.delivery_count, 1);

        broker.abandon(Q1, first).unwrap();

        let second = broker.try_receive(Q1).unwrap().unwrap();
        assert_eq!(second.body, json!(2));

        let redelivered = broker.try_receive(Q1).unwrap().unwrap();
        assert_eq!(redelivered.body, json!(1));
        assert_eq!(redelivered.delivery_count, 2);

        assert!(broker.try_receive(Q1).unwrap().is_none());
    }

    #[test]
    fn test_dead_letter() {
        let broker = InMemoryBroker::new("test");
        broker.enqueue(Q1, OutboundMessage::new(json!("bad"))).unwrap();
        let message = broker.try_receive(Q1).unwrap().unwrap();

        broker.dead_letter(Q1, message, "invalid").unwrap();

        let dead = broker.dead_letters(Q1).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "invalid");
        assert_eq!(dead_letter_queue_name(Q1), "pipeline-step1/$deadletterqueue");
    }

    #[tokio::test]
    async fn test_client_and_sender_release() {
        let broker = InMemoryBroker::new("test");
        let mut client = broker.connect().await.unwrap();
        let mut sender = client.create_sender(Q1).await.unwrap();
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_senders(), 1);

        sender.send_message(OutboundMessage::new(json!({}))).await.unwrap();
        sender.close().await.unwrap();
        sender.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_senders(), 0);
        assert_eq!(broker.len(Q1).unwrap(), 1);
        assert!(sender.send_message(OutboundMessage::new(json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_rejects_sends() {
        let broker = InMemoryBroker::new("test");
        broker.fail_sends_to(Q1).unwrap();

        let mut client = broker.connect().await.unwrap();
        let mut sender = client.create_sender(Q1).await.unwrap();
        let result = sender.send_message(OutboundMessage::new(json!({}))).await;
        assert!(matches!(result, Err(TransportError::Rejected { .. })));

        broker.restore_sends_to(Q1).unwrap();
        assert!(sender.send_message(OutboundMessage::new(json!({}))).await.is_ok());
    }

    #[test]
    fn test_fault_injection_blocks_receives() {
        let broker = InMemoryBroker::new("test");
        broker.enqueue(Q1, OutboundMessage::new(json!({}))).unwrap();
        broker.fail_receives_from(Q1).unwrap();

        assert_eq!(
            broker.try_receive(Q1),
            Err(TransportError::Unavailable(Q1.to_string()))
        );
        assert_eq!(broker.len(Q1).unwrap(), 1);

        broker.restore_receives_from(Q1).unwrap();
        assert!(broker.try_receive(Q1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_receive_waits_for_enqueue() {
        let broker = InMemoryBroker::new("test");
        let producer = broker.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(Q1, OutboundMessage::new(json!("late"))).unwrap();
        });

        let message = tokio::time::timeout(Duration::from_secs(2), broker.receive(Q1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, json!("late"));
        handle.await.unwrap();
    }

    #[test]
    fn test_from_connection_string() {
        let broker = InMemoryBroker::from_connection_string("memory://dev").unwrap();
        assert_eq!(broker.namespace(), "dev");
        assert!(InMemoryBroker::from_connection_string("amqp://x").is_err());
    }
}
