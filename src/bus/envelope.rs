//! Message envelope carried on module queues.

use core::fmt;

use serde_json::Value;
use uuid::Uuid;

use super::queue::QueueId;
use crate::module::{ModuleName, module_name};

/// Reserved and user call names share the module-name length limit.
pub type CallName = heapless::String<32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    None,
    DataReady,
    ProcessDone,
    Ack,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::DataReady => "DATA_READY",
            Self::ProcessDone => "PROCESS_DONE",
            Self::Ack => "ACK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    None,
    SyncCall,
    AsyncCall,
    VarGet,
    VarSet,
    ReturnCall,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SyncCall => "SYNC_CALL",
            Self::AsyncCall => "ASYNC_CALL",
            Self::VarGet => "VAR_GET",
            Self::VarSet => "VAR_SET",
            Self::ReturnCall => "RETURN_CALL",
        }
    }

    /// Calls that expect a `RECEIVE_RETURN_CALL_FUNC` reply.
    pub fn is_request(self) -> bool {
        matches!(self, Self::SyncCall | Self::AsyncCall)
    }
}

/// A message on a module queue.
///
/// Envelopes move by value: `send` consumes one, `receive` hands one back,
/// so exactly one side owns the envelope and its variable bag at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event_uuid: Uuid,
    pub to: ModuleName,
    pub from: ModuleName,
    pub event: EventKind,
    pub call: CallKind,
    pub call_name: CallName,
    pub vars: Value,
    /// Queue of the sending module, set on replies.
    pub from_queue: Option<QueueId>,
}

/// Fresh random correlation token (canonical 8-4-4-4-12 when formatted).
pub fn new_event_uuid() -> Uuid {
    Uuid::new_v4()
}

impl Envelope {
    pub fn new(
        from: &str,
        to: &str,
        event: EventKind,
        call: CallKind,
        call_name: &str,
        vars: Value,
    ) -> Self {
        Self {
            event_uuid: new_event_uuid(),
            to: module_name(to),
            from: module_name(from),
            event,
            call,
            call_name: module_name(call_name),
            vars,
            from_queue: None,
        }
    }

    /// A request expecting a reply (`SyncCall` / `AsyncCall`).
    pub fn request(from: &str, to: &str, call: CallKind, call_name: &str, vars: Value) -> Self {
        Self::new(from, to, EventKind::None, call, call_name, vars)
    }

    /// A fire-and-forget notification (`DataReady` + `AsyncCall`).
    pub fn notify(from: &str, to: &str, call_name: &str, vars: Value) -> Self {
        Self::new(from, to, EventKind::DataReady, CallKind::AsyncCall, call_name, vars)
    }

    /// Canonical hyphenated form of the correlation token.
    pub fn uuid_string(&self) -> String {
        self.event_uuid.hyphenated().to_string()
    }

    /// `{ "v": [tag, payload, ...] }` element `idx`, if present.
    pub fn tagged(&self, idx: usize) -> Option<&Value> {
        self.vars.get("v").and_then(|v| v.get(idx))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {}/{} '{}'",
            self.event_uuid.hyphenated(),
            self.from,
            self.to,
            self.event.as_str(),
            self.call.as_str(),
            self.call_name
        )
    }
}
