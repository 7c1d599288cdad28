//! The rules-engine interface consumed by the mediation layer.
//!
//! The engine itself — its module system, rule language and operators —
//! lives behind the [`RulesEngine`] trait. The mediator only ever drives
//! an engine through this narrow API and receives verdicts back through
//! the [`server::TransactionServer`] callback surface.

pub mod manager;
pub mod passthrough;
pub mod server;

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::core::WafResult;

/// Traffic direction through the gateway.
///
/// Request flows client to origin, response flows origin to client. Kept
/// as an enum so per-direction differences stay explicit at each switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    /// Index into two-element per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Request => 0,
            Direction::Response => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Opaque engine-side handle for a connection object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

/// Opaque engine-side handle for a transaction object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHandle(pub u64);

/// Connection identity seeded from the proxy at the first transaction.
#[derive(Clone, Debug, Default)]
pub struct ConnInfo {
    pub client_ip: String,
    pub client_port: u16,
    pub server_ip: String,
    pub server_port: u16,
}

/// One parsed header field, name and value as recovered from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

bitflags! {
    /// Engine-side transaction state, read back through [`RulesEngine::tx_flags`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EngineFlags: u32 {
        /// The engine wants the proxy thread to rendezvous on inspections
        /// that gate header or response issuance.
        const BLOCKING              = 1 << 0;
        /// The engine will inspect request body data.
        const INSPECT_REQUEST_BODY  = 1 << 1;
        /// The engine will inspect response body data.
        const INSPECT_RESPONSE_BODY = 1 << 2;
        /// Request-side inspection has finished.
        const REQUEST_DONE          = 1 << 3;
        /// Response-side inspection has finished.
        const RESPONSE_DONE         = 1 << 4;
    }
}

impl EngineFlags {
    /// Whether the engine declared it will inspect this direction's body.
    pub fn inspects_body(self, dir: Direction) -> bool {
        match dir {
            Direction::Request => self.contains(EngineFlags::INSPECT_REQUEST_BODY),
            Direction::Response => self.contains(EngineFlags::INSPECT_RESPONSE_BODY),
        }
    }

    /// Whether inspection has finished for this direction.
    pub fn inspection_done(self, dir: Direction) -> bool {
        match dir {
            Direction::Request => self.contains(EngineFlags::REQUEST_DONE),
            Direction::Response => self.contains(EngineFlags::RESPONSE_DONE),
        }
    }
}

/// Keys the mediator reads from the engine's context configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Per-direction buffering switch.
    BufferBody(Direction),
    /// Per-direction staged-byte ceiling; 0 means unbounded.
    BufferLimit(Direction),
    /// Per-direction action once the ceiling is reached.
    BufferLimitAction(Direction),
}

/// What the filter does when staged bytes would exceed the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitAction {
    /// Flush everything currently staged, then stage the new chunk.
    FlushAll,
    /// Flush just enough to bring staged bytes back under the limit.
    FlushPartial,
}

/// Engine context configuration values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Bool(bool),
    Uint(u64),
    Action(LimitAction),
}

/// The consumed rules-engine API.
///
/// Lifecycle notifications for a transaction must arrive in the total
/// order `request_started, request_header_data, request_header_finished,
/// request_body_data*, request_finished, response_started,
/// response_header_data, response_header_finished, response_body_data*,
/// response_finished, postprocess, logging`; the dispatcher enforces it.
pub trait RulesEngine: Send + Sync {
    fn conn_create(&self, info: &ConnInfo) -> WafResult<ConnHandle>;
    fn conn_opened(&self, conn: ConnHandle) -> WafResult<()>;
    fn conn_closed(&self, conn: ConnHandle) -> WafResult<()>;
    fn conn_destroy(&self, conn: ConnHandle);

    /// Creates the engine-side transaction object. The `server` handle is
    /// the callback surface the engine uses to deliver verdicts.
    fn tx_create(
        &self,
        conn: ConnHandle,
        server: Arc<dyn server::TransactionServer>,
    ) -> WafResult<TxHandle>;
    fn tx_destroy(&self, tx: TxHandle);

    fn request_started(&self, tx: TxHandle, line: &[u8]) -> WafResult<()>;
    fn request_header_data(&self, tx: TxHandle, headers: &[HeaderField]) -> WafResult<()>;
    fn request_header_finished(&self, tx: TxHandle) -> WafResult<()>;
    fn request_body_data(&self, tx: TxHandle, data: &[u8]) -> WafResult<()>;
    fn request_finished(&self, tx: TxHandle) -> WafResult<()>;

    fn response_started(&self, tx: TxHandle, line: &[u8]) -> WafResult<()>;
    fn response_header_data(&self, tx: TxHandle, headers: &[HeaderField]) -> WafResult<()>;
    fn response_header_finished(&self, tx: TxHandle) -> WafResult<()>;
    fn response_body_data(&self, tx: TxHandle, data: &[u8]) -> WafResult<()>;
    fn response_finished(&self, tx: TxHandle) -> WafResult<()>;

    fn postprocess(&self, tx: TxHandle) -> WafResult<()>;
    fn logging(&self, tx: TxHandle) -> WafResult<()>;

    /// Engine-side flags for a transaction.
    fn tx_flags(&self, tx: TxHandle) -> EngineFlags;

    /// Reads a value from the engine's context configuration.
    fn context_get(&self, tx: TxHandle, key: ContextKey) -> Option<ConfigValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_indexes_are_distinct() {
        assert_ne!(Direction::Request.index(), Direction::Response.index());
        assert_eq!(Direction::Request.label(), "request");
    }

    #[test]
    fn flags_answer_per_direction_questions() {
        let flags = EngineFlags::INSPECT_REQUEST_BODY | EngineFlags::RESPONSE_DONE;
        assert!(flags.inspects_body(Direction::Request));
        assert!(!flags.inspects_body(Direction::Response));
        assert!(flags.inspection_done(Direction::Response));
        assert!(!flags.inspection_done(Direction::Request));
    }
}
