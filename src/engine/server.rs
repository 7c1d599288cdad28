//! The callback surface the mediator exposes to the rules engine.
//!
//! The engine delivers verdicts by calling back into the transaction it
//! is inspecting: header mutations, a synthetic error response, or body
//! edits. Each callback can be refused once the corresponding commit
//! point has passed; refusals carry no state mutation.

use bytes::Bytes;
use regex::Regex;

use super::Direction;

/// Header mutation kinds an engine may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderOp {
    /// Replace the header, creating it if absent.
    Set,
    /// Remove all values of the header.
    Unset,
    /// Add a new field regardless of existing ones.
    Add,
    /// Append to the existing value, comma-separated.
    Append,
    /// Add the field only if no identical name/value pair exists.
    Merge,
    /// Regex-substitute within each existing value.
    Edit,
}

/// One queued header action. Created by engine callbacks, consumed
/// exactly once when headers are serialized toward the proxy.
#[derive(Clone, Debug)]
pub struct HeaderAction {
    pub dir: Direction,
    pub op: HeaderOp,
    pub name: String,
    pub value: String,
    /// Compiled pattern; present iff `op` is [`HeaderOp::Edit`].
    pub pattern: Option<Regex>,
}

/// Outcome of a server callback, reported back to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Accepted and queued or applied.
    Ok,
    /// Refused: the commit point has passed, or the request is ignored.
    Declined,
    /// Refused: arguments are invalid (bad range, bad regex, bad code).
    Invalid,
}

impl CallbackOutcome {
    pub fn accepted(self) -> bool {
        self == CallbackOutcome::Ok
    }
}

/// Per-direction intent flags for [`TransactionServer::edit_init`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EditIntent {
    pub request: bool,
    pub response: bool,
}

/// The fixed callback set the engine invokes on the mediator.
///
/// Implemented by the transaction context; every method may be called
/// from a dispatcher worker thread while the proxy thread is elsewhere
/// in the same transaction.
pub trait TransactionServer: Send + Sync {
    /// Queue a header mutation for a direction. For [`HeaderOp::Edit`]
    /// the mediator compiles `pattern` if no compiled regex was supplied.
    /// Refused once the direction's headers have been serialized.
    fn header_action(
        &self,
        dir: Direction,
        op: HeaderOp,
        name: &str,
        value: &str,
        pattern: Option<&str>,
    ) -> CallbackOutcome;

    /// Request a synthetic error response with this status. Accepted for
    /// codes in `[200, 600)` while no status is set and the response has
    /// not started; a second request is ignored.
    fn error_status(&self, code: u16) -> CallbackOutcome;

    /// Append a header to the pending synthetic response.
    fn error_header(&self, name: &str, value: &str) -> CallbackOutcome;

    /// Replace the pending synthetic response body with a private copy.
    fn error_body(&self, body: &[u8]) -> CallbackOutcome;

    /// Queue a byte-range edit, in pre-edit coordinates, for a
    /// direction's body stream.
    fn stream_edit(&self, dir: Direction, start: u64, len: u64, replacement: &[u8])
        -> CallbackOutcome;

    /// Declare intent to edit one or both body streams.
    fn edit_init(&self, intent: EditIntent) -> CallbackOutcome;

    /// Ask the mediator to drop the connection. Not supported by the
    /// host surface; falls back to issuing a 400 via `error_status`.
    fn close_connection(&self) -> CallbackOutcome;

    /// Logger-format hook: the engine hands a formatted record for the
    /// mediator's log sink.
    fn write_log(&self, message: &str) -> CallbackOutcome;
}

/// A synthetic error response under construction.
///
/// Built incrementally by engine callbacks and committed once, at the
/// proxy's send-response-headers event.
#[derive(Clone, Debug, Default)]
pub struct ErrorResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl ErrorResponse {
    /// Reason phrase: engine-supplied, else the canonical mapping for
    /// the code, else `"Other"`.
    pub fn reason_phrase(&self) -> &str {
        if let Some(ref reason) = self.reason {
            return reason;
        }
        http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Other")
    }

    /// The synthetic status line replayed to the engine at commit.
    pub fn status_line(&self) -> Bytes {
        Bytes::from(format!("HTTP/1.1 {} {}", self.status, self.reason_phrase()))
    }
}
