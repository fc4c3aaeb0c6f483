//! Inter-module message bus.
//!
//! One bounded queue per module that opts in (`use_queue`), addressed by
//! module name through the registry. Ordering is FIFO per queue; nothing is
//! promised across queues.
//!
//! ```text
//!   S ──Envelope{SyncCall,"ping",uuid=U}──► R.queue
//!   R ──Envelope{ProcessDone,AsyncCall,RECEIVE_RETURN_CALL_FUNC}──► S.queue
//!                         vars = { "v": ["RESULT", payload] }, from_queue = R.id
//! ```
//!
//! Correlating a reply with its request is the requester's job (by UUID or
//! by payload); the reply carries a fresh UUID.

pub mod envelope;
pub mod queue;

use log::warn;
use serde_json::{Value, json};

pub use envelope::{CallKind, CallName, Envelope, EventKind, new_event_uuid};
pub use queue::{ModuleQueue, QueueConfig, QueueHandle, QueueId, Rejected, TICK_RATE_HZ, Ticks};

use crate::error::BusError;
use crate::registry::Registry;

// ── Reserved call names ───────────────────────────────────────

/// Response carrier: `{ "v": ["RESULT", payload] }`.
pub const RECEIVE_RETURN_CALL_FUNC: &str = "RECEIVE_RETURN_CALL_FUNC";
/// Boot progress for the display: `{ "op": string, "percent": 0..100 }`.
pub const LCD_BOOT_STEP: &str = "lcd_boot_step";
/// Lines for the display log: `{ "v": [string, ...] }`.
pub const LCD_LOG_APPEND: &str = "lcd_log_append";

pub const RESULT_TAG: &str = "RESULT";

/// Upper bound on how long a reply may wait for room in the requester's
/// queue. The responder's own send timeout applies when it is shorter.
pub const REPLY_TIMEOUT: Ticks = Ticks::from_ms(100);

pub fn is_reserved(call_name: &str) -> bool {
    matches!(call_name, RECEIVE_RETURN_CALL_FUNC | LCD_BOOT_STEP | LCD_LOG_APPEND)
}

pub fn boot_step_vars(op: &str, percent: u8) -> Value {
    json!({ "op": op, "percent": percent.min(100) })
}

pub fn log_append_vars<S: AsRef<str>>(lines: &[S]) -> Value {
    json!({ "v": lines.iter().map(AsRef::as_ref).collect::<Vec<_>>() })
}

/// Payload of a `RECEIVE_RETURN_CALL_FUNC` envelope tagged `RESULT`.
pub fn result_payload(envelope: &Envelope) -> Option<&Value> {
    if envelope.call_name.as_str() != RECEIVE_RETURN_CALL_FUNC {
        return None;
    }
    match envelope.tagged(0) {
        Some(Value::String(tag)) if tag == RESULT_TAG => envelope.tagged(1),
        _ => None,
    }
}

/// Build the reply envelope from `responder` back to `incoming.from`.
pub fn return_call_envelope(responder: &str, incoming: &Envelope, payload: Value) -> Envelope {
    Envelope::new(
        responder,
        &incoming.from,
        EventKind::ProcessDone,
        CallKind::AsyncCall,
        RECEIVE_RETURN_CALL_FUNC,
        json!({ "v": [RESULT_TAG, payload] }),
    )
}

impl ModuleQueue {
    /// Reply to `incoming` with `payload`, looking up the requester's queue
    /// in the registry. Waits at most [`REPLY_TIMEOUT`] for room.
    pub fn respond(&self, incoming: &Envelope, payload: Value, registry: &Registry) -> Result<(), BusError> {
        let Some(target) = registry.find_queue(&incoming.from) else {
            warn!("Bus: no queue for requester '{}'", incoming.from);
            return Err(BusError::QueueNotCreated);
        };
        let mut reply = return_call_envelope(self.owner(), incoming, payload);
        reply.from_queue = Some(self.id());
        let timeout = self.config().send_timeout.min(REPLY_TIMEOUT);
        target.send_timeout(reply, timeout).map_err(|r| {
            warn!("Bus: reply to '{}' rejected: {}", incoming.from, r.error);
            r.error
        })
    }

    /// `RECEIVE_RETURN_CALL_FUNC`: echo the request payload (`vars.v`, or
    /// the whole bag when it has no `v`) back to the requester as `RESULT`.
    pub fn reply_return_call(&self, incoming: &Envelope, registry: &Registry) -> Result<(), BusError> {
        let payload = incoming
            .vars
            .get("v")
            .cloned()
            .unwrap_or_else(|| incoming.vars.clone());
        self.respond(incoming, payload, registry)
    }
}
