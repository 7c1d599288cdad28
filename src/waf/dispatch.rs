//! Asynchronous engine-notification dispatch.
//!
//! Proxy I/O threads enqueue notifications; a small fixed pool of
//! worker threads runs them against the rules engine. A worker only
//! dequeues an item whose transaction is not already being dispatched,
//! which keeps per-transaction delivery in arrival order while letting
//! unrelated transactions proceed in parallel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use crate::engine::HeaderField;

use super::transaction::TransactionContext;

bitflags! {
    /// One-shot lifecycle notifications, as a set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NotifySet: u16 {
        const REQUEST_STARTED          = 1 << 0;
        const REQUEST_HEADER_DATA      = 1 << 1;
        const REQUEST_HEADER_FINISHED  = 1 << 2;
        const REQUEST_FINISHED         = 1 << 3;
        const RESPONSE_STARTED         = 1 << 4;
        const RESPONSE_HEADER_DATA     = 1 << 5;
        const RESPONSE_HEADER_FINISHED = 1 << 6;
        const RESPONSE_FINISHED        = 1 << 7;
        const POSTPROCESS              = 1 << 8;
        const LOGGING                  = 1 << 9;
    }
}

/// One engine notification, with its payload snapshot.
#[derive(Clone, Debug)]
pub enum Notification {
    RequestStarted(Bytes),
    RequestHeaderData(Arc<Vec<HeaderField>>),
    RequestHeaderFinished,
    RequestBodyData(Bytes),
    RequestFinished,
    ResponseStarted(Bytes),
    ResponseHeaderData(Arc<Vec<HeaderField>>),
    ResponseHeaderFinished,
    ResponseBodyData(Bytes),
    ResponseFinished,
    Postprocess,
    Logging,
}

impl Notification {
    /// The one-shot set bit for this notification; body data repeats
    /// and has none.
    pub fn once_mask(&self) -> Option<NotifySet> {
        match self {
            Notification::RequestStarted(_) => Some(NotifySet::REQUEST_STARTED),
            Notification::RequestHeaderData(_) => Some(NotifySet::REQUEST_HEADER_DATA),
            Notification::RequestHeaderFinished => Some(NotifySet::REQUEST_HEADER_FINISHED),
            Notification::RequestBodyData(_) => None,
            Notification::RequestFinished => Some(NotifySet::REQUEST_FINISHED),
            Notification::ResponseStarted(_) => Some(NotifySet::RESPONSE_STARTED),
            Notification::ResponseHeaderData(_) => Some(NotifySet::RESPONSE_HEADER_DATA),
            Notification::ResponseHeaderFinished => Some(NotifySet::RESPONSE_HEADER_FINISHED),
            Notification::ResponseBodyData(_) => None,
            Notification::ResponseFinished => Some(NotifySet::RESPONSE_FINISHED),
            Notification::Postprocess => Some(NotifySet::POSTPROCESS),
            Notification::Logging => Some(NotifySet::LOGGING),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notification::RequestStarted(_) => "request_started",
            Notification::RequestHeaderData(_) => "request_header_data",
            Notification::RequestHeaderFinished => "request_header_finished",
            Notification::RequestBodyData(_) => "request_body_data",
            Notification::RequestFinished => "request_finished",
            Notification::ResponseStarted(_) => "response_started",
            Notification::ResponseHeaderData(_) => "response_header_data",
            Notification::ResponseHeaderFinished => "response_header_finished",
            Notification::ResponseBodyData(_) => "response_body_data",
            Notification::ResponseFinished => "response_finished",
            Notification::Postprocess => "postprocess",
            Notification::Logging => "logging",
        }
    }
}

struct Notice {
    tx: Arc<TransactionContext>,
    event: Notification,
}

struct Shared {
    queue: Mutex<VecDeque<Notice>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for n in 0..worker_count.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("waf-notify-{n}"))
                .spawn(move || Self::worker_loop(shared))
                .expect("spawn dispatcher worker");
            workers.push(handle);
        }

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues one notification. One-shot lifecycle notifications that
    /// were already scheduled are dropped here.
    pub fn enqueue(&self, tx: Arc<TransactionContext>, event: Notification) {
        if !tx.mark_enqueued(&event) {
            log::debug!(
                "Transaction {}: {} already scheduled, dropping duplicate",
                tx.id,
                event.label()
            );
            return;
        }
        let mut queue = self.shared.queue.lock().expect("dispatch queue");
        queue.push_back(Notice { tx, event });
        drop(queue);
        self.shared.cond.notify_all();
    }

    /// Pulls every queued item for the transaction, waits out any
    /// in-flight dispatch, and delivers the remainder synchronously.
    /// Used by the destroy path before terminal notifications.
    pub fn drain(&self, tx: &Arc<TransactionContext>) {
        let mut queue = self.shared.queue.lock().expect("dispatch queue");
        let mut pending = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for notice in queue.drain(..) {
            if Arc::ptr_eq(&notice.tx, tx) {
                pending.push(notice.event);
            } else {
                kept.push_back(notice);
            }
        }
        *queue = kept;

        while tx.is_busy() {
            let (next, _) = self
                .shared
                .cond
                .wait_timeout(queue, Duration::from_millis(20))
                .expect("dispatch queue");
            queue = next;
        }
        drop(queue);

        for event in pending {
            tx.deliver(&event);
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().expect("dispatch queue").len()
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        let mut workers = self.workers.lock().expect("worker list");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn worker_loop(shared: Arc<Shared>) {
        let mut queue = shared.queue.lock().expect("dispatch queue");
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            // First item whose transaction is not already dispatching;
            // the claim marks it busy.
            if let Some(at) = queue.iter().position(|n| n.tx.try_claim()) {
                let notice = queue.remove(at).expect("position just found");
                drop(queue);

                notice.tx.deliver(&notice.event);
                notice.tx.release_claim();
                shared.cond.notify_all();

                queue = shared.queue.lock().expect("dispatch queue");
            } else {
                let (next, _) = shared
                    .cond
                    .wait_timeout(queue, Duration::from_millis(100))
                    .expect("dispatch queue");
                queue = next;
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
