//! # qp-core
//!
//! Stage handlers and local hosting runtime for queue-pipeline.
//!
//! This crate provides:
//! - The processor contract and the placeholder work each stage performs
//! - The forwarder that builds next-stage envelopes and sends them
//! - Per-stage handlers composing validate → process → forward
//! - The transport seam and an in-process broker
//! - A local host that drives handlers from the broker's queues
//! - Configuration loading and tracing setup
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and management
//! - [`processor`]: Stage processor trait and simulated work
//! - [`forwarder`]: Next-envelope construction and scoped sends
//! - [`handler`]: Stage handlers and invocation context
//! - [`transport`]: Transport traits and the in-memory broker
//! - [`runtime`]: Local hosting runtime
//! - [`logging`]: Tracing subscriber setup

pub mod config;
pub mod forwarder;
pub mod handler;
pub mod logging;
pub mod processor;
pub mod runtime;
pub mod transport;
