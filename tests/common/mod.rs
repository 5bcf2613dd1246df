//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording observer for asserting on engine events
//! - Row and engine construction helpers over the in-memory backend

#![allow(dead_code)]

pub mod fixtures;
pub mod recording;

pub use fixtures::*;
pub use recording::*;
