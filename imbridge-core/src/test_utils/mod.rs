//! Test utilities and helpers
//!
//! An in-memory protocol engine, fixtures for common test data, and helpers
//! for waiting on framework events.

pub mod async_helpers;
pub mod fixtures;
pub mod mock_protocol;

pub use async_helpers::*;
pub use fixtures::*;
pub use mock_protocol::*;
