//! Mediation-layer scenarios driven end to end with a scripted engine.
//!
//! The scripted engine records every notification it receives and can
//! call back into the transaction from inside a notification, the way a
//! real rules engine delivers verdicts from a dispatcher worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::engine::manager::EngineManager;
use crate::engine::server::{CallbackOutcome, EditIntent, HeaderOp, TransactionServer};
use crate::engine::{
    ConfigValue, ConnHandle, ConnInfo, ContextKey, Direction, EngineFlags, HeaderField,
    RulesEngine, TxHandle,
};
use crate::core::WafResult;

use super::dispatch::{Dispatcher, NotifySet};
use super::event::{EventPlugin, MediationSettings, Verdict};
use super::transaction::TransactionContext;

type ServerHook = Box<dyn Fn(&Arc<dyn TransactionServer>) + Send + Sync>;

#[derive(Default)]
struct Recorded {
    events: Vec<String>,
    request_lines: Vec<String>,
    response_lines: Vec<String>,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
    conn_opened: usize,
    conn_closed: usize,
    active: i32,
    max_active: i32,
}

#[derive(Default)]
struct ScriptedEngine {
    recorded: Mutex<Recorded>,
    servers: Mutex<HashMap<u64, Arc<dyn TransactionServer>>>,
    next_handle: AtomicU64,
    flags: Mutex<EngineFlags>,
    context: Mutex<HashMap<ContextKey, ConfigValue>>,
    on_request_headers: Mutex<Option<ServerHook>>,
    on_response_headers: Mutex<Option<ServerHook>>,
    dispatch_delay: Mutex<Option<Duration>>,
}

impl ScriptedEngine {
    fn blocking() -> Arc<Self> {
        let engine = Self::default();
        *engine.flags.lock().unwrap() = EngineFlags::BLOCKING;
        Arc::new(engine)
    }

    fn set_flags(&self, flags: EngineFlags) {
        *self.flags.lock().unwrap() = flags;
    }

    fn set_context(&self, key: ContextKey, value: ConfigValue) {
        self.context.lock().unwrap().insert(key, value);
    }

    fn on_request_headers(&self, hook: ServerHook) {
        *self.on_request_headers.lock().unwrap() = Some(hook);
    }

    fn on_response_headers(&self, hook: ServerHook) {
        *self.on_response_headers.lock().unwrap() = Some(hook);
    }

    fn events(&self) -> Vec<String> {
        self.recorded.lock().unwrap().events.clone()
    }

    fn note(&self, label: &str) {
        let delay = *self.dispatch_delay.lock().unwrap();
        {
            let mut r = self.recorded.lock().unwrap();
            r.active += 1;
            r.max_active = r.max_active.max(r.active);
            r.events.push(label.to_string());
        }
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.recorded.lock().unwrap().active -= 1;
    }

    fn run_hook(&self, slot: &Mutex<Option<ServerHook>>, tx: TxHandle) {
        let server = self.servers.lock().unwrap().get(&tx.0).cloned();
        if let (Some(server), Some(hook)) = (server, slot.lock().unwrap().as_ref()) {
            hook(&server);
        }
    }
}

impl RulesEngine for ScriptedEngine {
    fn conn_create(&self, _info: &ConnInfo) -> WafResult<ConnHandle> {
        Ok(ConnHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn conn_opened(&self, _conn: ConnHandle) -> WafResult<()> {
        self.note("conn_opened");
        self.recorded.lock().unwrap().conn_opened += 1;
        Ok(())
    }

    fn conn_closed(&self, _conn: ConnHandle) -> WafResult<()> {
        self.note("conn_closed");
        self.recorded.lock().unwrap().conn_closed += 1;
        Ok(())
    }

    fn conn_destroy(&self, _conn: ConnHandle) {}

    fn tx_create(
        &self,
        _conn: ConnHandle,
        server: Arc<dyn TransactionServer>,
    ) -> WafResult<TxHandle> {
        let handle = TxHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.servers.lock().unwrap().insert(handle.0, server);
        Ok(handle)
    }

    fn tx_destroy(&self, tx: TxHandle) {
        self.servers.lock().unwrap().remove(&tx.0);
    }

    fn request_started(&self, _tx: TxHandle, line: &[u8]) -> WafResult<()> {
        self.note("request_started");
        self.recorded
            .lock()
            .unwrap()
            .request_lines
            .push(String::from_utf8_lossy(line).into_owned());
        Ok(())
    }

    fn request_header_data(&self, tx: TxHandle, _headers: &[HeaderField]) -> WafResult<()> {
        self.note("request_header_data");
        self.run_hook(&self.on_request_headers, tx);
        Ok(())
    }

    fn request_header_finished(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("request_header_finished");
        Ok(())
    }

    fn request_body_data(&self, _tx: TxHandle, data: &[u8]) -> WafResult<()> {
        self.note("request_body_data");
        self.recorded.lock().unwrap().request_body.extend_from_slice(data);
        Ok(())
    }

    fn request_finished(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("request_finished");
        Ok(())
    }

    fn response_started(&self, _tx: TxHandle, line: &[u8]) -> WafResult<()> {
        self.note("response_started");
        self.recorded
            .lock()
            .unwrap()
            .response_lines
            .push(String::from_utf8_lossy(line).into_owned());
        Ok(())
    }

    fn response_header_data(&self, tx: TxHandle, _headers: &[HeaderField]) -> WafResult<()> {
        self.note("response_header_data");
        self.run_hook(&self.on_response_headers, tx);
        Ok(())
    }

    fn response_header_finished(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("response_header_finished");
        Ok(())
    }

    fn response_body_data(&self, _tx: TxHandle, data: &[u8]) -> WafResult<()> {
        self.note("response_body_data");
        self.recorded.lock().unwrap().response_body.extend_from_slice(data);
        Ok(())
    }

    fn response_finished(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("response_finished");
        Ok(())
    }

    fn postprocess(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("postprocess");
        Ok(())
    }

    fn logging(&self, _tx: TxHandle) -> WafResult<()> {
        self.note("logging");
        Ok(())
    }

    fn tx_flags(&self, _tx: TxHandle) -> EngineFlags {
        *self.flags.lock().unwrap()
    }

    fn context_get(&self, _tx: TxHandle, key: ContextKey) -> Option<ConfigValue> {
        self.context.lock().unwrap().get(&key).cloned()
    }
}

struct Fixture {
    engine: Arc<ScriptedEngine>,
    _manager: Arc<EngineManager>,
    dispatcher: Arc<Dispatcher>,
    plugin: EventPlugin,
}

fn fixture_with(engine: Arc<ScriptedEngine>, workers: usize) -> Fixture {
    let for_factory = engine.clone();
    let manager = Arc::new(EngineManager::new(
        Box::new(move |_| Ok(for_factory.clone() as Arc<dyn RulesEngine>)),
        4,
    ));
    manager.create(Path::new("rules.conf")).unwrap();
    let dispatcher = Dispatcher::new(workers);
    let plugin = EventPlugin::new(
        manager.clone(),
        dispatcher.clone(),
        MediationSettings::default(),
        None,
    );
    Fixture {
        engine,
        _manager: manager,
        dispatcher,
        plugin,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedEngine::blocking(), 2)
}

fn conn_info() -> ConnInfo {
    ConnInfo {
        client_ip: "10.0.0.1".to_string(),
        client_port: 40000,
        server_ip: "10.0.0.2".to_string(),
        server_port: 8080,
    }
}

const GET_HEAD: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
const OK_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

fn start_transaction(f: &Fixture) -> (Arc<super::SessionContext>, Arc<TransactionContext>) {
    let session = f.plugin.session_start();
    let tx = f.plugin.transaction_start(&session, &conn_info());
    (session, tx)
}

#[test]
fn clean_get_passes_through_in_notification_order() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);

    assert_eq!(f.plugin.request_headers(&tx, GET_HEAD, b"/a"), Verdict::Continue);
    assert_eq!(f.plugin.response_headers(&tx, OK_HEAD), Verdict::Continue);
    assert!(f.plugin.commit_response(&tx).is_none());
    let out = f.plugin.body_chunk(&tx, Direction::Response, None, true);
    assert!(out.is_empty());

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    assert_eq!(
        f.engine.events(),
        vec![
            "conn_opened",
            "request_started",
            "request_header_data",
            "request_header_finished",
            "request_finished",
            "response_started",
            "response_header_data",
            "response_header_finished",
            "response_finished",
            "postprocess",
            "logging",
            "conn_closed",
        ]
    );
}

#[test]
fn synthetic_403_replaces_the_response_and_still_terminates() {
    let f = fixture();
    f.engine.on_request_headers(Box::new(|server| {
        assert!(server.error_status(403).accepted());
        assert!(server.error_header("X-Blocked", "yes").accepted());
    }));
    let (session, tx) = start_transaction(&f);

    // The engine blocks the request during header inspection; the origin
    // is never contacted.
    assert_eq!(
        f.plugin.request_headers(&tx, GET_HEAD, b"/a"),
        Verdict::Divert(403)
    );

    let response = f.plugin.commit_response(&tx).expect("synthetic response");
    assert_eq!(response.status, 403);
    assert_eq!(&response.status_line()[..], b"HTTP/1.1 403 Forbidden");
    assert_eq!(response.headers, vec![("X-Blocked".to_string(), "yes".to_string())]);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    assert_eq!(
        f.engine.events(),
        vec![
            "conn_opened",
            "request_started",
            "request_header_data",
            "request_header_finished",
            "request_finished",
            "response_started",
            "response_header_data",
            "response_header_finished",
            "response_finished",
            "postprocess",
            "logging",
            "conn_closed",
        ]
    );
    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(recorded.response_lines, vec!["HTTP/1.1 403 Forbidden"]);
}

#[test]
fn scheme_artifact_in_the_start_line_is_repaired_for_the_engine() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);

    let head = b"GET http:///x HTTP/1.0\r\nHost: x\r\n\r\n";
    assert_eq!(
        f.plugin.request_headers(&tx, head, b"http:///x"),
        Verdict::Continue
    );
    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(recorded.request_lines, vec!["GET /x HTTP/1.0"]);
}

#[test]
fn fixup_accounting_mismatch_fails_with_400() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);

    let head = b"GET http:///xyz HTTP/1.0\r\nHost: x\r\n\r\n";
    assert_eq!(
        f.plugin.request_headers(&tx, head, b"http:///x"),
        Verdict::Divert(400)
    );
    assert_eq!(tx.status(), 400);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn zero_length_request_body_finishes_right_after_headers() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);

    f.plugin.request_headers(&tx, GET_HEAD, b"/a");
    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    let events = f.engine.events();
    let finished = events.iter().position(|e| e == "request_finished").unwrap();
    assert_eq!(events[finished - 1], "request_header_finished");
}

#[test]
fn response_body_edit_rewrites_the_stream() {
    let engine = ScriptedEngine::blocking();
    engine.set_flags(EngineFlags::BLOCKING | EngineFlags::INSPECT_RESPONSE_BODY);
    engine.set_context(
        ContextKey::BufferBody(Direction::Response),
        ConfigValue::Bool(true),
    );
    engine.set_context(
        ContextKey::BufferLimit(Direction::Response),
        ConfigValue::Uint(0),
    );
    engine.on_response_headers(Box::new(|server| {
        assert!(server.edit_init(EditIntent { request: false, response: true }).accepted());
        assert!(server
            .stream_edit(Direction::Response, 13, 18, b"https://new.example")
            .accepted());
    }));
    let f = fixture_with(engine, 2);
    let (session, tx) = start_transaction(&f);

    f.plugin.request_headers(&tx, GET_HEAD, b"/a");
    let head = b"HTTP/1.1 200 OK\r\nContent-Length: 31\r\n\r\n";
    assert_eq!(f.plugin.response_headers(&tx, head), Verdict::Continue);
    assert!(f.plugin.commit_response(&tx).is_none());

    let body = Bytes::from_static(b"Please visit http://old.example");
    let out = f.plugin.body_chunk(&tx, Direction::Response, Some(body), true);
    assert_eq!(&out[..], b"Please visit https://new.example");

    let (done, delta, notified) = tx.filter_stats(Direction::Response);
    assert_eq!(done, 31);
    assert_eq!(delta, 1);
    assert_eq!(notified, 31);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    // The engine saw the pre-edit bytes.
    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(&recorded.response_body[..], b"Please visit http://old.example");
}

#[test]
fn flushpart_holds_staged_bytes_at_the_limit() {
    let engine = ScriptedEngine::blocking();
    engine.set_flags(EngineFlags::BLOCKING | EngineFlags::INSPECT_RESPONSE_BODY);
    engine.set_context(
        ContextKey::BufferBody(Direction::Response),
        ConfigValue::Bool(true),
    );
    engine.set_context(
        ContextKey::BufferLimit(Direction::Response),
        ConfigValue::Uint(1024),
    );
    engine.set_context(
        ContextKey::BufferLimitAction(Direction::Response),
        ConfigValue::Action(crate::engine::LimitAction::FlushPartial),
    );
    let f = fixture_with(engine, 2);
    let (session, tx) = start_transaction(&f);

    f.plugin.request_headers(&tx, GET_HEAD, b"/a");
    f.plugin.response_headers(&tx, OK_HEAD);
    f.plugin.commit_response(&tx);

    let chunk = Bytes::from(vec![b'x'; 800]);
    let first = f.plugin.body_chunk(&tx, Direction::Response, Some(chunk.clone()), false);
    assert!(first.is_empty());
    let second = f.plugin.body_chunk(&tx, Direction::Response, Some(chunk.clone()), false);
    assert_eq!(second.len(), 576);
    let third = f.plugin.body_chunk(&tx, Direction::Response, Some(chunk), false);
    assert_eq!(third.len(), 800);
    let last = f.plugin.body_chunk(&tx, Direction::Response, None, true);
    assert_eq!(last.len(), 1024);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn interim_100_response_generates_no_notifications() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);

    f.plugin.request_headers(&tx, GET_HEAD, b"/a");
    assert!(tx.await_fired(NotifySet::REQUEST_FINISHED, Duration::from_secs(5)));
    let before = f.engine.events().len();
    assert_eq!(
        f.plugin.response_headers(&tx, b"HTTP/1.1 100 Continue\r\n\r\n"),
        Verdict::Continue
    );
    assert_eq!(f.engine.events().len(), before);

    // Processing resumes on the next response head.
    assert_eq!(f.plugin.response_headers(&tx, OK_HEAD), Verdict::Continue);
    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
    assert_eq!(
        f.engine.recorded.lock().unwrap().response_lines,
        vec!["HTTP/1.1 200 OK"]
    );
}

#[test]
fn sessions_notify_conn_events_exactly_once_across_transactions() {
    let f = fixture();
    let session = f.plugin.session_start();

    let tx1 = f.plugin.transaction_start(&session, &conn_info());
    f.plugin.request_headers(&tx1, GET_HEAD, b"/a");
    f.plugin.transaction_close(&tx1);

    let tx2 = f.plugin.transaction_start(&session, &conn_info());
    f.plugin.request_headers(&tx2, GET_HEAD, b"/a");

    // Proxy closes the session while a transaction is live: teardown is
    // deferred until the last transaction detaches.
    f.plugin.session_close(&session);
    {
        let recorded = f.engine.recorded.lock().unwrap();
        assert_eq!(recorded.conn_opened, 1);
        assert_eq!(recorded.conn_closed, 0);
    }

    f.plugin.transaction_close(&tx2);
    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(recorded.conn_opened, 1);
    assert_eq!(recorded.conn_closed, 1);
    assert_eq!(*recorded.events.last().unwrap(), "conn_closed");
}

#[test]
fn sessions_without_transactions_never_touch_the_engine() {
    let f = fixture();
    let session = f.plugin.session_start();
    f.plugin.session_close(&session);
    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(recorded.conn_opened, 0);
    assert_eq!(recorded.conn_closed, 0);
}

#[test]
fn declined_acquisition_bypasses_the_session() {
    let manager = Arc::new(EngineManager::new(
        Box::new(|_| Err(crate::core::WafError::EngineDeclined("down".to_string()))),
        4,
    ));
    let dispatcher = Dispatcher::new(1);
    let plugin = EventPlugin::new(
        manager,
        dispatcher,
        MediationSettings::default(),
        None,
    );

    let session = plugin.session_start();
    let tx = plugin.transaction_start(&session, &conn_info());
    assert!(tx.is_bypass());
    assert_eq!(plugin.request_headers(&tx, GET_HEAD, b"/a"), Verdict::Continue);

    // Bypass traffic streams through untouched.
    let body = Bytes::from_static(b"payload");
    let out = plugin.body_chunk(&tx, Direction::Request, Some(body.clone()), true);
    assert_eq!(out, body);

    plugin.transaction_close(&tx);
    plugin.session_close(&session);
}

#[test]
fn at_most_one_notification_dispatches_per_transaction() {
    let engine = ScriptedEngine::blocking();
    engine.set_flags(EngineFlags::empty());
    *engine.dispatch_delay.lock().unwrap() = Some(Duration::from_millis(15));
    let f = fixture_with(engine, 4);
    let (session, tx) = start_transaction(&f);

    f.plugin.request_headers(&tx, b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n", b"/");
    for _ in 0..4 {
        f.plugin
            .body_chunk(&tx, Direction::Request, Some(Bytes::from_static(b"abc")), false);
    }
    f.plugin.body_chunk(&tx, Direction::Request, None, true);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);

    let recorded = f.engine.recorded.lock().unwrap();
    assert_eq!(recorded.max_active, 1);
    assert_eq!(&recorded.request_body[..], b"abcabcabcabc");
}

#[test]
fn header_actions_are_consumed_once_and_refused_after_serialization() {
    let f = fixture();
    f.engine.on_request_headers(Box::new(|server| {
        assert!(server
            .header_action(Direction::Request, HeaderOp::Edit, "User-Agent", "new", Some("^old"))
            .accepted());
    }));
    let (session, tx) = start_transaction(&f);
    f.plugin.request_headers(&tx, GET_HEAD, b"/a");

    let actions = tx.take_header_actions(Direction::Request);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].op, HeaderOp::Edit);
    let pattern = actions[0].pattern.as_ref().unwrap();
    assert_eq!(pattern.replace_all("oldUA", actions[0].value.as_str()), "newUA");

    // Consumed exactly once.
    assert!(tx.take_header_actions(Direction::Request).is_empty());

    // The commit point has passed for the request direction.
    assert_eq!(
        tx.header_action(Direction::Request, HeaderOp::Set, "X", "y", None),
        CallbackOutcome::Declined
    );
    // The response direction is still open.
    assert_eq!(
        tx.header_action(Direction::Response, HeaderOp::Set, "X", "y", None),
        CallbackOutcome::Ok
    );

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn error_callbacks_decline_after_commit() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);
    f.plugin.request_headers(&tx, GET_HEAD, b"/a");

    // Clean path: commit moves straight to Committed.
    assert!(f.plugin.commit_response(&tx).is_none());
    assert_eq!(tx.error_status(403), CallbackOutcome::Declined);
    assert_eq!(tx.error_header("X", "y"), CallbackOutcome::Declined);
    assert_eq!(tx.error_body(b"nope"), CallbackOutcome::Declined);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn first_error_status_wins_and_bad_codes_are_invalid() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);
    f.plugin.request_headers(&tx, GET_HEAD, b"/a");

    assert_eq!(tx.error_status(100), CallbackOutcome::Invalid);
    assert_eq!(tx.error_status(600), CallbackOutcome::Invalid);
    assert_eq!(tx.error_status(403), CallbackOutcome::Ok);
    assert_eq!(tx.error_status(500), CallbackOutcome::Ok);
    assert_eq!(tx.status(), 403);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn close_connection_falls_back_to_a_400() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);
    f.plugin.request_headers(&tx, GET_HEAD, b"/a");

    assert!(tx.close_connection().accepted());
    assert_eq!(tx.status(), 400);

    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn stream_edit_on_forwarded_bytes_is_invalid() {
    let f = fixture();
    let (session, tx) = start_transaction(&f);
    f.plugin.request_headers(&tx, b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\n", b"/");

    // Nobuf streams the chunk straight through.
    let out = f.plugin.body_chunk(
        &tx,
        Direction::Request,
        Some(Bytes::from_static(b"abcdef")),
        false,
    );
    assert_eq!(&out[..], b"abcdef");
    assert_eq!(
        tx.stream_edit(Direction::Request, 0, 2, b"zz"),
        CallbackOutcome::Invalid
    );

    f.plugin.body_chunk(&tx, Direction::Request, None, true);
    f.plugin.transaction_close(&tx);
    f.plugin.session_close(&session);
}

#[test]
fn control_update_loads_a_new_engine_generation() {
    let f = fixture();
    assert_eq!(f._manager.live_generations(), 1);
    f.plugin.control_update(Path::new("rules-v2.conf"));
    assert_eq!(f._manager.acquire().unwrap().generation, 2);
}

#[test]
fn dispatcher_keeps_unrelated_transactions_flowing() {
    let f = fixture_with(ScriptedEngine::blocking(), 2);
    let session = f.plugin.session_start();
    let tx1 = f.plugin.transaction_start(&session, &conn_info());
    let tx2 = f.plugin.transaction_start(&session, &conn_info());

    f.plugin.request_headers(&tx1, GET_HEAD, b"/a");
    f.plugin.request_headers(&tx2, GET_HEAD, b"/a");
    assert!(tx1.await_fired(NotifySet::REQUEST_FINISHED, Duration::from_secs(5)));
    assert!(tx2.await_fired(NotifySet::REQUEST_FINISHED, Duration::from_secs(5)));
    assert_eq!(f.dispatcher.queued(), 0);

    f.plugin.transaction_close(&tx1);
    f.plugin.transaction_close(&tx2);
    f.plugin.session_close(&session);
}
