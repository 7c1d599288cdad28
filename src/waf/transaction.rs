//! Per-transaction state.
//!
//! One context per request/response exchange: the engine transaction
//! handle, the two stream filters, pending header actions, the pending
//! synthetic error response, and the rendezvous primitives used to park
//! the proxy thread while a notification is in flight. The context is
//! also the [`TransactionServer`] the engine calls verdicts back into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use regex::Regex;

use crate::engine::server::{
    CallbackOutcome, EditIntent, ErrorResponse, HeaderAction, HeaderOp, TransactionServer,
};
use crate::engine::{ConfigValue, ContextKey, Direction, EngineFlags, RulesEngine, TxHandle};

use super::dispatch::{Notification, NotifySet};
use super::session::SessionContext;
use super::stream::StreamFilter;

/// Header progress for one direction: `Unseen -> Seen -> Finished`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderPhase {
    Unseen,
    Seen,
    Finished,
}

/// Synthetic-response progress: `Clean -> StatusRequested -> Committed`.
/// The normal path goes straight from `Clean` to `Committed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorPhase {
    Clean,
    StatusRequested,
    Committed,
}

struct TxInner {
    req_phase: HeaderPhase,
    resp_phase: HeaderPhase,
    /// Request headers have been serialized toward the origin.
    req_sent: bool,
    /// Response headers have been serialized toward the client.
    resp_sent: bool,
    error: ErrorPhase,
    response: ErrorResponse,
    header_actions: Vec<HeaderAction>,
    filters: [StreamFilter; 2],
    /// Lifecycle notifications already scheduled, to keep each one-shot.
    enqueued: NotifySet,
    request_line: Option<Bytes>,
}

#[derive(Default)]
struct NotifyState {
    fired: NotifySet,
    body_delivered: [u64; 2],
}

pub struct TransactionContext {
    pub id: u64,
    session: Arc<SessionContext>,
    engine: Option<Arc<dyn RulesEngine>>,
    engine_tx: OnceLock<TxHandle>,
    /// Set while a dispatcher worker is running a notification for this
    /// transaction; at most one runs at a time.
    busy: AtomicBool,
    inner: Mutex<TxInner>,
    notify_state: Mutex<NotifyState>,
    notify_cond: Condvar,
}

impl TransactionContext {
    /// Creates the context and, when the session has an engine, the
    /// engine-side transaction object. An engine refusal leaves this
    /// transaction in bypass.
    pub fn create(id: u64, session: Arc<SessionContext>) -> Arc<Self> {
        let binding = session.engine_binding();
        let tx = Arc::new(Self {
            id,
            session,
            engine: binding.as_ref().map(|(engine, _)| engine.clone()),
            engine_tx: OnceLock::new(),
            busy: AtomicBool::new(false),
            inner: Mutex::new(TxInner {
                req_phase: HeaderPhase::Unseen,
                resp_phase: HeaderPhase::Unseen,
                req_sent: false,
                resp_sent: false,
                error: ErrorPhase::Clean,
                response: ErrorResponse::default(),
                header_actions: Vec::new(),
                filters: [
                    StreamFilter::new(Direction::Request),
                    StreamFilter::new(Direction::Response),
                ],
                enqueued: NotifySet::empty(),
                request_line: None,
            }),
            notify_state: Mutex::new(NotifyState::default()),
            notify_cond: Condvar::new(),
        });

        if let Some((engine, conn)) = binding {
            let server: Arc<dyn TransactionServer> = tx.clone();
            match engine.tx_create(conn, server) {
                Ok(handle) => {
                    let _ = tx.engine_tx.set(handle);
                }
                Err(e) => {
                    log::info!("Transaction {id}: engine refused ({e}), bypassing");
                }
            }
        }
        tx
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// The engine binding, or `None` when this transaction is bypassed.
    pub fn bound(&self) -> Option<(&Arc<dyn RulesEngine>, TxHandle)> {
        match (&self.engine, self.engine_tx.get()) {
            (Some(engine), Some(handle)) => Some((engine, *handle)),
            _ => None,
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.bound().is_none()
    }

    pub fn engine_flags(&self) -> EngineFlags {
        self.bound()
            .map(|(engine, tx)| engine.tx_flags(tx))
            .unwrap_or_default()
    }

    pub fn context_get(&self, key: ContextKey) -> Option<ConfigValue> {
        self.bound().and_then(|(engine, tx)| engine.context_get(tx, key))
    }

    // --- busy flag -----------------------------------------------------

    pub fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn release_claim(&self) {
        self.busy.store(false, Ordering::Release);
    }

    // --- notification bookkeeping --------------------------------------

    /// Whether a one-shot lifecycle notification still needs scheduling.
    /// Body-data notifications are never one-shot.
    pub fn mark_enqueued(&self, notification: &Notification) -> bool {
        let Some(mask) = notification.once_mask() else {
            return true;
        };
        let mut inner = self.inner.lock().expect("transaction mutex");
        if inner.enqueued.contains(mask) {
            return false;
        }
        inner.enqueued.insert(mask);
        true
    }

    /// Runs one notification against the engine. Called from dispatcher
    /// workers and from the synchronous destroy drain; errors stay on
    /// this side of the boundary and are logged.
    pub fn deliver(&self, notification: &Notification) {
        if let Some((engine, tx)) = self.bound() {
            let result = match notification {
                Notification::RequestStarted(line) => engine.request_started(tx, line),
                Notification::RequestHeaderData(fields) => {
                    engine.request_header_data(tx, fields)
                }
                Notification::RequestHeaderFinished => engine.request_header_finished(tx),
                Notification::RequestBodyData(data) => engine.request_body_data(tx, data),
                Notification::RequestFinished => engine.request_finished(tx),
                Notification::ResponseStarted(line) => engine.response_started(tx, line),
                Notification::ResponseHeaderData(fields) => {
                    engine.response_header_data(tx, fields)
                }
                Notification::ResponseHeaderFinished => engine.response_header_finished(tx),
                Notification::ResponseBodyData(data) => engine.response_body_data(tx, data),
                Notification::ResponseFinished => engine.response_finished(tx),
                Notification::Postprocess => engine.postprocess(tx),
                Notification::Logging => engine.logging(tx),
            };
            if let Err(e) = result {
                log::error!(
                    "Transaction {}: engine notification {} failed: {e}",
                    self.id,
                    notification.label()
                );
            }
        }

        let mut state = self.notify_state.lock().expect("notify mutex");
        if let Some(mask) = notification.once_mask() {
            state.fired.insert(mask);
        }
        match notification {
            Notification::RequestBodyData(data) => {
                state.body_delivered[Direction::Request.index()] += data.len() as u64
            }
            Notification::ResponseBodyData(data) => {
                state.body_delivered[Direction::Response.index()] += data.len() as u64
            }
            _ => {}
        }
        drop(state);
        self.notify_cond.notify_all();
    }

    pub fn fired(&self) -> NotifySet {
        self.notify_state.lock().expect("notify mutex").fired
    }

    /// Rendezvous: parks the caller until the given notifications have
    /// been delivered to the engine, or the timeout lapses.
    pub fn await_fired(&self, mask: NotifySet, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.notify_state.lock().expect("notify mutex");
        while !state.fired.contains(mask) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, _) = self
                .notify_cond
                .wait_timeout(state, left)
                .expect("notify mutex");
            state = next;
        }
        true
    }

    /// Rendezvous: parks the caller until the engine has seen at least
    /// `target` body bytes for the direction.
    pub fn await_body_delivered(&self, dir: Direction, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.notify_state.lock().expect("notify mutex");
        while state.body_delivered[dir.index()] < target {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, _) = self
                .notify_cond
                .wait_timeout(state, left)
                .expect("notify mutex");
            state = next;
        }
        true
    }

    /// The terminal notifications that have not fired yet, in the order
    /// the destroy path must issue them.
    pub fn missing_terminals(&self) -> Vec<Notification> {
        let fired = self.fired();
        let mut missing = Vec::new();
        if !fired.contains(NotifySet::REQUEST_FINISHED) {
            missing.push(Notification::RequestFinished);
        }
        if !fired.contains(NotifySet::RESPONSE_FINISHED) {
            missing.push(Notification::ResponseFinished);
        }
        if !fired.contains(NotifySet::POSTPROCESS) {
            missing.push(Notification::Postprocess);
        }
        if !fired.contains(NotifySet::LOGGING) {
            missing.push(Notification::Logging);
        }
        missing
    }

    // --- header phases and request line --------------------------------

    pub fn header_phase(&self, dir: Direction) -> HeaderPhase {
        let inner = self.inner.lock().expect("transaction mutex");
        match dir {
            Direction::Request => inner.req_phase,
            Direction::Response => inner.resp_phase,
        }
    }

    pub fn set_header_phase(&self, dir: Direction, phase: HeaderPhase) {
        let mut inner = self.inner.lock().expect("transaction mutex");
        match dir {
            Direction::Request => inner.req_phase = phase,
            Direction::Response => inner.resp_phase = phase,
        }
    }

    pub fn set_request_line(&self, line: Bytes) {
        self.inner.lock().expect("transaction mutex").request_line = Some(line);
    }

    pub fn request_line(&self) -> Option<Bytes> {
        self.inner.lock().expect("transaction mutex").request_line.clone()
    }

    // --- synthetic error response --------------------------------------

    /// The synthetic status requested so far; 0 when none.
    pub fn status(&self) -> u16 {
        self.inner.lock().expect("transaction mutex").response.status
    }

    /// Requests a synthetic status from inside the mediator (malformed
    /// input, internal failure). Same rules as the engine callback.
    pub fn force_status(&self, code: u16) {
        let outcome = self.error_status(code);
        if outcome != CallbackOutcome::Ok {
            log::debug!(
                "Transaction {}: could not divert to {code} ({outcome:?})",
                self.id
            );
        }
    }

    /// Commits the pending error response at the proxy's send-headers
    /// event. Past this point the error callbacks are declined. Returns
    /// the response to materialize, or `None` on the clean path.
    pub fn commit_error_response(&self) -> Option<ErrorResponse> {
        let mut inner = self.inner.lock().expect("transaction mutex");
        if inner.error == ErrorPhase::Committed {
            return None;
        }
        inner.error = ErrorPhase::Committed;
        if inner.response.status == 0 {
            return None;
        }
        inner.resp_sent = true;
        inner.filters[Direction::Response.index()].set_discard();
        Some(inner.response.clone())
    }

    /// Marks the direction's headers as serialized and hands back the
    /// actions queued for it; each action is consumed exactly once.
    pub fn take_header_actions(&self, dir: Direction) -> Vec<HeaderAction> {
        let mut inner = self.inner.lock().expect("transaction mutex");
        match dir {
            Direction::Request => inner.req_sent = true,
            Direction::Response => inner.resp_sent = true,
        }
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for action in inner.header_actions.drain(..) {
            if action.dir == dir {
                taken.push(action);
            } else {
                kept.push(action);
            }
        }
        inner.header_actions = kept;
        taken
    }

    // --- stream filters -------------------------------------------------

    pub fn with_filter<R>(&self, dir: Direction, f: impl FnOnce(&mut StreamFilter) -> R) -> R {
        let mut inner = self.inner.lock().expect("transaction mutex");
        f(&mut inner.filters[dir.index()])
    }

    /// Forwarded/delta/notified counters for one direction.
    pub fn filter_stats(&self, dir: Direction) -> (u64, i64, u64) {
        let inner = self.inner.lock().expect("transaction mutex");
        let filter = &inner.filters[dir.index()];
        (filter.bytes_done(), filter.offs(), filter.bytes_notified())
    }
}

impl TransactionServer for TransactionContext {
    fn header_action(
        &self,
        dir: Direction,
        op: HeaderOp,
        name: &str,
        value: &str,
        pattern: Option<&str>,
    ) -> CallbackOutcome {
        let mut inner = self.inner.lock().expect("transaction mutex");
        let too_late = match dir {
            Direction::Request => inner.req_sent,
            Direction::Response => inner.resp_sent,
        };
        if too_late {
            log::debug!(
                "Transaction {}: {} header action after serialization, declined",
                self.id,
                dir.label()
            );
            return CallbackOutcome::Declined;
        }

        let compiled = match (op, pattern) {
            (HeaderOp::Edit, Some(src)) => match Regex::new(src) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::error!("Transaction {}: bad edit pattern {src:?}: {e}", self.id);
                    return CallbackOutcome::Invalid;
                }
            },
            (HeaderOp::Edit, None) => {
                log::error!("Transaction {}: edit header action without pattern", self.id);
                return CallbackOutcome::Invalid;
            }
            _ => None,
        };

        inner.header_actions.push(HeaderAction {
            dir,
            op,
            name: name.to_string(),
            value: value.to_string(),
            pattern: compiled,
        });
        CallbackOutcome::Ok
    }

    fn error_status(&self, code: u16) -> CallbackOutcome {
        if !(200..600).contains(&code) {
            return CallbackOutcome::Invalid;
        }
        let mut inner = self.inner.lock().expect("transaction mutex");
        if inner.error == ErrorPhase::Committed || inner.resp_sent {
            return CallbackOutcome::Declined;
        }
        if inner.response.status != 0 {
            // Already set; the first status wins.
            return CallbackOutcome::Ok;
        }
        inner.response.status = code;
        inner.error = ErrorPhase::StatusRequested;
        CallbackOutcome::Ok
    }

    fn error_header(&self, name: &str, value: &str) -> CallbackOutcome {
        let mut inner = self.inner.lock().expect("transaction mutex");
        if inner.error == ErrorPhase::Committed || inner.resp_sent {
            return CallbackOutcome::Declined;
        }
        inner
            .response
            .headers
            .push((name.to_string(), value.to_string()));
        CallbackOutcome::Ok
    }

    fn error_body(&self, body: &[u8]) -> CallbackOutcome {
        let mut inner = self.inner.lock().expect("transaction mutex");
        if inner.error == ErrorPhase::Committed || inner.resp_sent {
            return CallbackOutcome::Declined;
        }
        inner.response.body = Some(Bytes::copy_from_slice(body));
        CallbackOutcome::Ok
    }

    fn stream_edit(
        &self,
        dir: Direction,
        start: u64,
        len: u64,
        replacement: &[u8],
    ) -> CallbackOutcome {
        let mut inner = self.inner.lock().expect("transaction mutex");
        match inner.filters[dir.index()].queue_edit(
            start,
            len,
            Bytes::copy_from_slice(replacement),
        ) {
            Ok(()) => CallbackOutcome::Ok,
            Err(e) => {
                log::error!("Transaction {}: {e}", self.id);
                CallbackOutcome::Invalid
            }
        }
    }

    fn edit_init(&self, intent: EditIntent) -> CallbackOutcome {
        let mut inner = self.inner.lock().expect("transaction mutex");
        if intent.request {
            inner.filters[Direction::Request.index()].declare_edits();
        }
        if intent.response {
            inner.filters[Direction::Response.index()].declare_edits();
        }
        CallbackOutcome::Ok
    }

    fn close_connection(&self) -> CallbackOutcome {
        // The host surface has no clean connection-drop; divert to 400.
        log::debug!(
            "Transaction {}: close_connection mapped to error_status(400)",
            self.id
        );
        self.error_status(400)
    }

    fn write_log(&self, message: &str) -> CallbackOutcome {
        log::info!("engine[tx {}]: {message}", self.id);
        CallbackOutcome::Ok
    }
}
