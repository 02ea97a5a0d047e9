//! Shared test utilities for replay and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Envelope builders for both schemas
//! - An in-memory harness wiring databases, sorter and commands together

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
