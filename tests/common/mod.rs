//! Shared test utilities for integration, chaos and property tests.
//!
//! This module provides:
//! - `FlakyRemote`: a failure-injecting, call-recording `RemoteEndpoint`
//! - Document builders for messages and contacts
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

pub mod fixtures;
pub mod flaky;

pub use fixtures::*;
pub use flaky::*;
