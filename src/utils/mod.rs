//! Shared helpers.
//!
//! These are used across the codebase and by the service binary.

pub mod bootstrap;
pub mod retry;
