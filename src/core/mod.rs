//! Core abstractions for rampart.
//!
//! Foundational error types and aliases shared by every layer of the
//! mediation stack.

pub mod error;

pub use error::{ErrorContext, WafError, WafResult};
