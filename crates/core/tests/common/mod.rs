//! Common test utilities shared by the integration tests.
//!
//! This module provides:
//! - Envelope fixtures for each stage
//! - Custom assertions over envelopes
//! - Mock processors and a recording transport

#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use mocks::*;
