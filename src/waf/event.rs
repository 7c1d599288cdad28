//! The event plugin: one dispatch surface over the host proxy's hooks.
//!
//! Each proxy event performs the minimal work to advance transaction
//! state: header events run the reparser and schedule engine
//! notifications, body events drive the stream filters, the send-headers
//! event commits any pending synthetic response, and the close events
//! drain and tear down. Verdicts flow back to the adapter as
//! [`Verdict`] values; the adapter decides how to re-enable the proxy.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::manager::EngineManager;
use crate::engine::server::ErrorResponse;
use crate::engine::{ConfigValue, ConnInfo, ContextKey, Direction, EngineFlags, LimitAction};

use super::dispatch::{Dispatcher, Notification, NotifySet};
use super::error_page;
use super::reparse::{self, HeadKind};
use super::session::SessionContext;
use super::stream::BufferMode;
use super::transaction::{HeaderPhase, TransactionContext};

/// What the adapter should do after an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Continue normal processing.
    Continue,
    /// Divert into the proxy's error path with this status.
    Divert(u16),
}

/// Tunables for the mediation layer.
#[derive(Clone, Debug)]
pub struct MediationSettings {
    /// How long a proxy thread parks in a rendezvous before giving up.
    pub rendezvous_timeout: Duration,
    /// Staging ceiling when the engine's context does not set one.
    pub default_buf_limit: usize,
    /// Let traffic through unchecked before the first engine is ready.
    pub early_traffic: bool,
}

impl Default for MediationSettings {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(5),
            default_buf_limit: 128 * 1024,
            early_traffic: false,
        }
    }
}

/// One transaction-log record, emitted at the logging notification.
#[derive(Debug, Serialize)]
pub struct TxRecord {
    pub txn: u64,
    pub client: String,
    pub request: String,
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub response_delta: i64,
}

pub struct EventPlugin {
    manager: Arc<EngineManager>,
    dispatcher: Arc<Dispatcher>,
    settings: MediationSettings,
    txlog: Option<UnboundedSender<Vec<u8>>>,
    session_seq: AtomicU64,
    txn_seq: AtomicU64,
}

impl EventPlugin {
    pub fn new(
        manager: Arc<EngineManager>,
        dispatcher: Arc<Dispatcher>,
        settings: MediationSettings,
        txlog: Option<UnboundedSender<Vec<u8>>>,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            settings,
            txlog,
            session_seq: AtomicU64::new(1),
            txn_seq: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &MediationSettings {
        &self.settings
    }

    /// Whether an engine generation is available at all.
    pub fn engine_ready(&self) -> bool {
        self.manager.acquire().is_some()
    }

    // --- session events -------------------------------------------------

    pub fn session_start(&self) -> Arc<SessionContext> {
        let id = self.session_seq.fetch_add(1, Ordering::Relaxed);
        SessionContext::new(id)
    }

    pub fn session_close(&self, session: &Arc<SessionContext>) {
        session.close();
    }

    // --- transaction lifecycle ------------------------------------------

    pub fn transaction_start(
        &self,
        session: &Arc<SessionContext>,
        info: &ConnInfo,
    ) -> Arc<TransactionContext> {
        session.begin_transaction(&self.manager, info);
        let id = self.txn_seq.fetch_add(1, Ordering::Relaxed);
        TransactionContext::create(id, session.clone())
    }

    /// Transaction close: drain in-flight notifications, issue the
    /// terminal ones that have not fired, destroy the engine
    /// transaction, emit the log record, detach from the session.
    pub fn transaction_close(&self, tx: &Arc<TransactionContext>) {
        self.dispatcher.drain(tx);
        for notification in tx.missing_terminals() {
            tx.deliver(&notification);
        }
        if let Some((engine, handle)) = tx.bound() {
            engine.tx_destroy(handle);
        }
        self.emit_txlog(tx);
        tx.session().end_transaction();
    }

    // --- header events ---------------------------------------------------

    /// Read-request-headers: recover the head from wire bytes, repair
    /// the start-line, and notify the engine. `url` is the proxy's
    /// independent URL accessor output.
    pub fn request_headers(&self, tx: &Arc<TransactionContext>, raw: &[u8], url: &[u8]) -> Verdict {
        if tx.is_bypass() {
            return Verdict::Continue;
        }

        let parsed = match reparse::parse_head(raw, HeadKind::Request) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Transaction {}: unrecoverable request head: {e}", tx.id);
                tx.force_status(400);
                return Verdict::Divert(400);
            }
        };
        let line = match reparse::normalize_request_line(&parsed.start_line, url) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Transaction {}: {e}", tx.id);
                tx.force_status(400);
                return Verdict::Divert(400);
            }
        };
        tx.set_request_line(line.clone());

        self.dispatcher
            .enqueue(tx.clone(), Notification::RequestStarted(line));
        tx.set_header_phase(Direction::Request, HeaderPhase::Seen);
        self.dispatcher.enqueue(
            tx.clone(),
            Notification::RequestHeaderData(Arc::new(parsed.fields)),
        );
        self.dispatcher
            .enqueue(tx.clone(), Notification::RequestHeaderFinished);
        tx.set_header_phase(Direction::Request, HeaderPhase::Finished);

        // No body announced: request end follows the headers directly.
        if !parsed.announces_body {
            self.dispatcher
                .enqueue(tx.clone(), Notification::RequestFinished);
        }

        if self.blocking(tx)
            && !tx.await_fired(
                NotifySet::REQUEST_HEADER_FINISHED,
                self.settings.rendezvous_timeout,
            )
        {
            log::warn!("Transaction {}: request-header rendezvous timed out", tx.id);
        }

        self.verdict(tx)
    }

    /// Read-response-headers. Interim (1xx) responses generate no
    /// notifications; processing resumes on the next response head.
    pub fn response_headers(&self, tx: &Arc<TransactionContext>, raw: &[u8]) -> Verdict {
        if tx.is_bypass() {
            return Verdict::Continue;
        }

        let parsed = match reparse::parse_head(raw, HeadKind::Response) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Transaction {}: unrecoverable response head: {e}", tx.id);
                tx.force_status(500);
                return Verdict::Divert(500);
            }
        };
        if let Some(code) = status_of(&parsed.start_line) {
            if (100..200).contains(&code) {
                log::debug!("Transaction {}: skipping interim {code} response", tx.id);
                return Verdict::Continue;
            }
        }

        self.dispatcher
            .enqueue(tx.clone(), Notification::ResponseStarted(parsed.start_line));
        tx.set_header_phase(Direction::Response, HeaderPhase::Seen);
        self.dispatcher.enqueue(
            tx.clone(),
            Notification::ResponseHeaderData(Arc::new(parsed.fields)),
        );
        self.dispatcher
            .enqueue(tx.clone(), Notification::ResponseHeaderFinished);
        tx.set_header_phase(Direction::Response, HeaderPhase::Finished);

        if self.blocking(tx)
            && !tx.await_fired(
                NotifySet::RESPONSE_HEADER_FINISHED,
                self.settings.rendezvous_timeout,
            )
        {
            log::warn!("Transaction {}: response-header rendezvous timed out", tx.id);
        }

        self.verdict(tx)
    }

    /// Send-response-headers: the commit point for the synthetic error
    /// response. Returns the response to materialize, if any.
    pub fn commit_response(&self, tx: &Arc<TransactionContext>) -> Option<ErrorResponse> {
        let response = tx.commit_error_response()?;
        log::info!(
            "Transaction {}: committing synthetic {} response",
            tx.id,
            response.status
        );
        error_page::replay(&self.dispatcher, tx, &response);
        Some(response)
    }

    // --- body events -----------------------------------------------------

    /// One body chunk for a direction. Returns the bytes released
    /// downstream (possibly empty while staging).
    pub fn body_chunk(
        &self,
        tx: &Arc<TransactionContext>,
        dir: Direction,
        chunk: Option<Bytes>,
        end_of_stream: bool,
    ) -> Bytes {
        if tx.is_bypass() {
            return chunk.unwrap_or_default();
        }

        if !tx.with_filter(dir, |f| f.is_configured()) {
            self.configure_filter(tx, dir);
        }

        let mut out = BytesMut::new();

        // A synthetic response means the remaining stream is diverted.
        if tx.status() != 0 {
            tx.with_filter(dir, |f| f.set_discard());
        }

        if let Some(chunk) = chunk {
            if !chunk.is_empty() {
                tx.with_filter(dir, |f| f.note_notified(chunk.len()));
                self.dispatcher.enqueue(
                    tx.clone(),
                    match dir {
                        Direction::Request => Notification::RequestBodyData(chunk.clone()),
                        Direction::Response => Notification::ResponseBodyData(chunk.clone()),
                    },
                );

                // A held stream is released once inspection finishes.
                if tx.with_filter(dir, |f| f.mode()) == BufferMode::BufferAll
                    && tx.engine_flags().inspection_done(dir)
                {
                    tx.with_filter(dir, |f| f.release(&mut out));
                }
                tx.with_filter(dir, |f| f.admit(chunk, &mut out));
            }
        }

        if end_of_stream {
            if self.blocking(tx) {
                let target = tx.with_filter(dir, |f| f.bytes_notified());
                if !tx.await_body_delivered(dir, target, self.settings.rendezvous_timeout) {
                    log::warn!(
                        "Transaction {}: {} body rendezvous timed out",
                        tx.id,
                        dir.label()
                    );
                }
            }
            let total = tx.with_filter(dir, |f| f.finish(&mut out));
            log::debug!(
                "Transaction {}: {} body finished, {total} byte(s) downstream",
                tx.id,
                dir.label()
            );
            match dir {
                Direction::Request => {
                    self.dispatcher
                        .enqueue(tx.clone(), Notification::RequestFinished);
                }
                Direction::Response => {
                    self.dispatcher
                        .enqueue(tx.clone(), Notification::ResponseFinished);
                    self.dispatcher
                        .enqueue(tx.clone(), Notification::Postprocess);
                    self.dispatcher.enqueue(tx.clone(), Notification::Logging);
                }
            }
        }

        out.freeze()
    }

    // --- control ----------------------------------------------------------

    /// Manager-directed update: load a new engine generation.
    pub fn control_update(&self, config_path: &Path) {
        if let Err(e) = self.manager.create(config_path) {
            log::error!("Control update rejected: {e}");
        }
    }

    // --- internals --------------------------------------------------------

    fn blocking(&self, tx: &Arc<TransactionContext>) -> bool {
        tx.engine_flags().contains(EngineFlags::BLOCKING)
    }

    fn verdict(&self, tx: &Arc<TransactionContext>) -> Verdict {
        match tx.status() {
            0 => Verdict::Continue,
            status => Verdict::Divert(status),
        }
    }

    /// Buffering-policy selection at first invocation, from the
    /// engine's context configuration and flags.
    fn configure_filter(&self, tx: &Arc<TransactionContext>, dir: Direction) {
        let flags = tx.engine_flags();
        let switch = matches!(
            tx.context_get(ContextKey::BufferBody(dir)),
            Some(ConfigValue::Bool(true))
        );

        let (mode, limit) = if !switch || !flags.inspects_body(dir) {
            (BufferMode::Nobuf, 0)
        } else {
            let limit = match tx.context_get(ContextKey::BufferLimit(dir)) {
                Some(ConfigValue::Uint(n)) => n as usize,
                _ => self.settings.default_buf_limit,
            };
            if limit == 0 {
                (BufferMode::BufferAll, 0)
            } else {
                match tx.context_get(ContextKey::BufferLimitAction(dir)) {
                    Some(ConfigValue::Action(LimitAction::FlushPartial)) => {
                        (BufferMode::FlushPart, limit)
                    }
                    _ => (BufferMode::FlushAll, limit),
                }
            }
        };
        log::debug!(
            "Transaction {}: {} body buffering {mode:?}, limit {limit}",
            tx.id,
            dir.label()
        );
        tx.with_filter(dir, |f| f.configure(mode, limit));
    }

    fn emit_txlog(&self, tx: &Arc<TransactionContext>) {
        let Some(ref sender) = self.txlog else {
            return;
        };
        let (request_bytes, _, _) = tx.filter_stats(Direction::Request);
        let (response_bytes, response_delta, _) = tx.filter_stats(Direction::Response);
        let record = TxRecord {
            txn: tx.id,
            client: tx.session().conn_info().client_ip,
            request: tx
                .request_line()
                .map(|l| String::from_utf8_lossy(&l).into_owned())
                .unwrap_or_default(),
            status: tx.status(),
            request_bytes,
            response_bytes,
            response_delta,
        };
        match serde_json::to_vec(&record) {
            Ok(mut line) => {
                line.push(b'\n');
                if sender.send(line).is_err() {
                    log::debug!("Transaction log channel closed");
                }
            }
            Err(e) => log::error!("Transaction {}: could not serialize log record: {e}", tx.id),
        }
    }
}

/// Status code out of a response start-line.
fn status_of(line: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(line).ok()?;
    text.split_ascii_whitespace().nth(1)?.parse().ok()
}
