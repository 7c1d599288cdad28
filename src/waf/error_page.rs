//! Synthetic error-response replay.
//!
//! Once a pending error response commits at the send-response-headers
//! event, the engine must see the response it asked for exactly as the
//! client will: status line, headers, then body. Notifications that
//! already fired for an origin response are not repeated; the dispatcher
//! keeps lifecycle notifications one-shot.

use std::sync::Arc;

use crate::engine::server::ErrorResponse;
use crate::engine::HeaderField;

use super::dispatch::{Dispatcher, Notification};
use super::transaction::TransactionContext;

/// The pending error headers as engine-facing fields.
pub fn header_fields(response: &ErrorResponse) -> Vec<HeaderField> {
    response
        .headers
        .iter()
        .map(|(name, value)| HeaderField::new(name.clone().into_bytes(), value.clone().into_bytes()))
        .collect()
}

/// Schedules the synthetic-response notifications.
pub fn replay(
    dispatcher: &Dispatcher,
    tx: &Arc<TransactionContext>,
    response: &ErrorResponse,
) {
    dispatcher.enqueue(tx.clone(), Notification::ResponseStarted(response.status_line()));
    dispatcher.enqueue(
        tx.clone(),
        Notification::ResponseHeaderData(Arc::new(header_fields(response))),
    );
    dispatcher.enqueue(tx.clone(), Notification::ResponseHeaderFinished);
    if let Some(ref body) = response.body {
        if !body.is_empty() {
            dispatcher.enqueue(tx.clone(), Notification::ResponseBodyData(body.clone()));
        }
    }
}
