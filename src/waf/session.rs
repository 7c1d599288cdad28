//! Per-connection session state.
//!
//! A session spans one proxy connection and may carry several
//! transactions. The engine is acquired at the first transaction and
//! the engine-side connection object is opened once; teardown runs in
//! whichever of last-transaction-close or session-close observes
//! `txn_count == 0`, and `conn_closed` fires exactly once.

use std::sync::{Arc, Mutex};

use crate::engine::manager::{EngineManager, EngineSlot};
use crate::engine::{ConnHandle, ConnInfo, RulesEngine};

pub struct SessionContext {
    pub id: u64,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    txn_count: u32,
    closing: bool,
    torn_down: bool,
    /// Acquisition has been attempted; a `None` engine past this point
    /// means the session runs in bypass.
    engine_decided: bool,
    engine: Option<Arc<EngineSlot>>,
    conn: Option<ConnHandle>,
    conn_info: ConnInfo,
}

impl SessionContext {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Attaches a transaction. On the session's first transaction this
    /// acquires an engine, creates the engine connection object, seeds
    /// the connection identity, and notifies `conn_opened`.
    pub fn begin_transaction(&self, manager: &EngineManager, info: &ConnInfo) {
        let mut state = self.state.lock().expect("session mutex");
        state.txn_count += 1;

        if state.engine_decided {
            return;
        }
        state.engine_decided = true;
        state.conn_info = info.clone();

        let Some(slot) = manager.acquire() else {
            log::info!("Session {}: engine declined, proceeding in bypass", self.id);
            return;
        };
        match slot.engine.conn_create(info) {
            Ok(conn) => {
                if let Err(e) = slot.engine.conn_opened(conn) {
                    log::error!("Session {}: conn_opened failed: {e}", self.id);
                }
                state.conn = Some(conn);
                state.engine = Some(slot);
            }
            Err(e) => {
                log::info!("Session {}: engine refused connection ({e}), bypassing", self.id);
            }
        }
    }

    /// The engine binding for new transactions; `None` in bypass mode.
    pub fn engine_binding(&self) -> Option<(Arc<dyn RulesEngine>, ConnHandle)> {
        let state = self.state.lock().expect("session mutex");
        match (&state.engine, state.conn) {
            (Some(slot), Some(conn)) => Some((slot.engine.clone(), conn)),
            _ => None,
        }
    }

    pub fn conn_info(&self) -> ConnInfo {
        self.state.lock().expect("session mutex").conn_info.clone()
    }

    pub fn txn_count(&self) -> u32 {
        self.state.lock().expect("session mutex").txn_count
    }

    /// Detaches a finished transaction. Returns true when this call
    /// performed the final teardown.
    pub fn end_transaction(&self) -> bool {
        let mut state = self.state.lock().expect("session mutex");
        debug_assert!(state.txn_count > 0, "transaction count underflow");
        state.txn_count = state.txn_count.saturating_sub(1);
        if state.closing && state.txn_count == 0 {
            return Self::teardown(&mut state, self.id);
        }
        false
    }

    /// Marks the proxy-side session close. Teardown is deferred until
    /// the last transaction detaches.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().expect("session mutex");
        state.closing = true;
        if state.txn_count == 0 {
            return Self::teardown(&mut state, self.id);
        }
        log::debug!(
            "Session {}: close deferred, {} transaction(s) live",
            self.id,
            state.txn_count
        );
        false
    }

    fn teardown(state: &mut SessionState, id: u64) -> bool {
        if state.torn_down {
            return false;
        }
        state.torn_down = true;
        if let (Some(slot), Some(conn)) = (&state.engine, state.conn.take()) {
            if let Err(e) = slot.engine.conn_closed(conn) {
                log::error!("Session {id}: conn_closed failed: {e}");
            }
            slot.engine.conn_destroy(conn);
        }
        // Dropping the slot is the engine release.
        state.engine = None;
        log::debug!("Session {id} torn down");
        true
    }
}
