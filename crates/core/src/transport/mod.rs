//! Transport collaborator seam.
//!
//! The pipeline never talks to a broker directly. It goes through these
//! traits, which mirror the lifecycle of a queue client: connect, open a
//! sender scoped to one queue, send, then close the sender and the client.
//!
//! Delivery, redelivery and dead-lettering are the transport's business. The
//! [`memory`] module provides a broker that lives in the process, used by the
//! local hosting runtime and by tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryBroker;

/// Connection string scheme for the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Errors raised by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("Unsupported connection string: {0}")]
    UnsupportedConnection(String),

    /// The client or sender was used after being closed.
    #[error("Transport handle already closed: {0}")]
    Closed(String),

    /// The broker refused the message.
    #[error("Broker rejected message for queue '{queue}': {reason}")]
    Rejected { queue: String, reason: String },

    /// The queue cannot be read from right now.
    #[error("Queue '{0}' is unavailable")]
    Unavailable(String),

    #[error("Broker state poisoned")]
    Poisoned,
}

/// A message about to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub body: Value,
}

impl OutboundMessage {
    pub fn new(body: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body,
        }
    }
}

/// A message as handed out by a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub body: Value,

    /// Number of times this message has been received, including this one.
    pub delivery_count: u32,

    pub enqueued_at: DateTime<Utc>,
}

/// Factory for transport clients.
///
/// Every forward opens its own client; clients are never shared between
/// invocations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TransportClient>, TransportError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait TransportClient: Send {
    /// Open a sender bound to `queue`.
    async fn create_sender(&mut self, queue: &str) -> Result<Box<dyn QueueSender>, TransportError>;

    /// Release the connection. Calling it twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A sender bound to one queue.
#[async_trait]
pub trait QueueSender: Send {
    fn queue_name(&self) -> &str;

    async fn send_message(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Release the sender. Calling it twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Where a connection string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// In-process broker, identified by namespace.
    Memory { namespace: String },
}

/// Parse a connection string into a target.
///
/// Only `memory://<namespace>` is understood; an empty namespace is allowed
/// and maps to `default`.
pub fn parse_connection_string(connection: &str) -> Result<ConnectionTarget, TransportError> {
    let trimmed = connection.trim();
    match trimmed.strip_prefix(MEMORY_SCHEME) {
        Some(namespace) => {
            let namespace = namespace.trim_end_matches('/');
            Ok(ConnectionTarget::Memory {
                namespace: if namespace.is_empty() {
                    "default".to_string()
                } else {
                    namespace.to_string()
                },
            })
        }
        None => Err(TransportError::UnsupportedConnection(redact(trimmed))),
    }
}

/// Keep secrets in connection strings out of error messages and logs.
fn redact(connection: &str) -> String {
    match connection.split_once(';') {
        Some((endpoint, _)) => format!("{endpoint};<redacted>"),
        None => connection.to_string(),
    }
}
