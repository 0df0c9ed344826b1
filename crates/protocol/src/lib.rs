//! # qp-protocol
//!
//! Message envelope model and stage validation for queue-pipeline.
//!
//! This crate defines the data that flows between pipeline stages:
//! - The fixed, ordered set of stages and their queues
//! - The completion bitmask recording which stages an envelope has passed
//! - The envelope itself, with its append-only log of stage payloads
//! - The validator that narrows an untyped queue message to a typed one
//!
//! ## Modules
//!
//! - [`stage`]: Closed stage enumeration, bit positions and queue names
//! - [`mask`]: Completion bitmask
//! - [`envelope`]: Envelope model and JSON wire format
//! - [`validation`]: Boundary validation into [`StageMessage`]
//!
//! ## Design Principles
//!
//! - No I/O and no async: everything here is a pure function of its input
//! - Independent compilation: no dependencies on other queue-pipeline crates

pub mod envelope;
pub mod mask;
pub mod stage;
pub mod validation;

// Re-export all public types for convenience
pub use envelope::*;
pub use mask::*;
pub use stage::*;
pub use validation::*;
