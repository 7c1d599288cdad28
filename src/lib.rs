//! rampart: a WAF gateway built as a Pingora proxy service.
//!
//! The crate's core is the transaction-level mediation layer in [`waf`]:
//! it sits between the host proxy's hook surface and a rules engine,
//! recovering wire bytes, streaming and editing bodies, dispatching
//! engine notifications off the proxy threads, and synthesizing error
//! responses. The [`engine`] module defines the narrow interfaces on
//! both sides of that boundary; [`service`] adapts Pingora's hooks onto
//! the mediation layer.

pub mod config;
pub mod core;
pub mod engine;
pub mod logging;
pub mod service;
pub mod utils;
pub mod waf;
