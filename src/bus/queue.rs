//! Bounded per-module queues.
//!
//! Each queue is a `crossbeam-channel` bounded channel of boxed envelopes.
//! The owning module keeps the [`ModuleQueue`] (the only receiver); every
//! other party reaches it through a cloned [`QueueHandle`] looked up in the
//! registry. Dropping the `ModuleQueue` tears the queue down; later sends
//! fail with `QueueNotCreated`.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use super::envelope::Envelope;
use crate::error::BusError;
use crate::module::{ModuleName, module_name};

/// Scheduler tick rate (FreeRTOS `configTICK_RATE_HZ` on ESP-IDF).
pub const TICK_RATE_HZ: u32 = 100;

/// Timeout in scheduler ticks. [`Ticks::MAX`] blocks indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticks(pub u32);

impl Ticks {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u32::MAX);

    /// `pdMS_TO_TICKS`: truncating conversion.
    pub const fn from_ms(ms: u32) -> Self {
        let t = (ms as u64 * TICK_RATE_HZ as u64) / 1_000;
        if t >= u32::MAX as u64 { Self::MAX } else { Self(t as u32) }
    }

    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }

    pub fn as_ms(self) -> u64 {
        u64::from(self.0) * 1_000 / u64::from(TICK_RATE_HZ)
    }

    /// `None` means wait forever.
    pub fn duration(self) -> Option<Duration> {
        (!self.is_forever()).then(|| Duration::from_millis(self.as_ms()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub length: usize,
    pub send_timeout: Ticks,
    pub recv_timeout: Ticks,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            length: 8,
            send_timeout: Ticks::MAX,
            recv_timeout: Ticks::from_ms(100),
        }
    }
}

/// Opaque queue identifier, unique within a boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

impl QueueId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A send that did not go through. The sender gets the envelope back.
pub struct Rejected {
    pub error: BusError,
    pub envelope: Box<Envelope>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rejected({:?}, {})", self.error, self.envelope)
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.envelope)
    }
}

impl From<Rejected> for BusError {
    fn from(r: Rejected) -> Self {
        r.error
    }
}

// ───────────────────────────────────────────────────────────────
// Sending side
// ───────────────────────────────────────────────────────────────

/// Cloneable sending end of a module queue.
#[derive(Clone)]
pub struct QueueHandle {
    id: QueueId,
    owner: ModuleName,
    tx: Sender<Box<Envelope>>,
    send_timeout: Ticks,
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("len", &self.tx.len())
            .finish()
    }
}

impl QueueHandle {
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    /// Send with the queue's configured send timeout.
    pub fn send(&self, envelope: Envelope) -> Result<(), Rejected> {
        self.send_timeout(envelope, self.send_timeout)
    }

    pub fn try_send(&self, envelope: Envelope) -> Result<(), Rejected> {
        self.send_timeout(envelope, Ticks::ZERO)
    }

    pub fn send_timeout(&self, envelope: Envelope, timeout: Ticks) -> Result<(), Rejected> {
        let boxed = Box::new(envelope);
        let result = match timeout.duration() {
            None => self.tx.send(boxed).map_err(|e| (BusError::QueueNotCreated, e.0)),
            Some(d) if d.is_zero() => self.tx.try_send(boxed).map_err(|e| match e {
                TrySendError::Full(env) => (BusError::QueueFull, env),
                TrySendError::Disconnected(env) => (BusError::QueueNotCreated, env),
            }),
            Some(d) => self.tx.send_timeout(boxed, d).map_err(|e| match e {
                SendTimeoutError::Timeout(env) => (BusError::QueueFull, env),
                SendTimeoutError::Disconnected(env) => (BusError::QueueNotCreated, env),
            }),
        };
        result.map_err(|(error, envelope)| Rejected { error, envelope })
    }
}

// ───────────────────────────────────────────────────────────────
// Receiving side
// ───────────────────────────────────────────────────────────────

/// The owning module's end of its queue.
pub struct ModuleQueue {
    handle: QueueHandle,
    rx: Receiver<Box<Envelope>>,
    config: QueueConfig,
}

impl fmt::Debug for ModuleQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleQueue")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish()
    }
}

impl ModuleQueue {
    pub fn new(owner: &str, config: QueueConfig) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.length.max(1));
        Self {
            handle: QueueHandle {
                id: QueueId::next(),
                owner: module_name(owner),
                tx,
                send_timeout: config.send_timeout,
            },
            rx,
            config,
        }
    }

    pub fn handle(&self) -> &QueueHandle {
        &self.handle
    }

    pub fn id(&self) -> QueueId {
        self.handle.id
    }

    pub fn owner(&self) -> &str {
        self.handle.owner()
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block up to the configured receive timeout.
    pub fn receive(&self) -> Option<Envelope> {
        self.receive_timeout(self.config.recv_timeout)
    }

    pub fn try_receive(&self) -> Option<Envelope> {
        self.rx.try_recv().ok().map(|b| *b)
    }

    pub fn receive_timeout(&self, timeout: Ticks) -> Option<Envelope> {
        match timeout.duration() {
            None => self.rx.recv().ok().map(|b| *b),
            Some(d) => match self.rx.recv_timeout(d) {
                Ok(b) => Some(*b),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    /// Like [`receive`](Self::receive) but reports why nothing arrived.
    pub fn receive_or_err(&self) -> Result<Envelope, BusError> {
        self.receive().ok_or(BusError::QueueEmpty)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn env(n: u32) -> Envelope {
        Envelope::notify("S", "R", "seq", json!({"n": n}))
    }

    #[test]
    fn ticks_follow_pd_ms_to_ticks() {
        assert_eq!(Ticks::from_ms(100), Ticks(10));
        assert_eq!(Ticks::from_ms(5), Ticks(0));
        assert_eq!(Ticks(10).as_ms(), 100);
        assert!(Ticks::MAX.duration().is_none());
    }

    #[test]
    fn fifo_and_full() {
        let q = ModuleQueue::new("R", QueueConfig { length: 2, ..QueueConfig::default() });
        let h = q.handle().clone();
        h.try_send(env(1)).unwrap();
        h.try_send(env(2)).unwrap();

        let rejected = h.try_send(env(3)).unwrap_err();
        assert_eq!(rejected.error, BusError::QueueFull);
        assert_eq!(rejected.envelope.vars["n"], 3);

        assert_eq!(q.try_receive().unwrap().vars["n"], 1);
        assert_eq!(q.try_receive().unwrap().vars["n"], 2);
        assert!(q.try_receive().is_none());
    }

    #[test]
    fn send_timeout_elapses_as_full() {
        let q = ModuleQueue::new("R", QueueConfig { length: 1, ..QueueConfig::default() });
        q.handle().try_send(env(1)).unwrap();
        let start = std::time::Instant::now();
        let r = q.handle().send_timeout(env(2), Ticks::from_ms(30));
        assert_eq!(r.unwrap_err().error, BusError::QueueFull);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn receive_times_out_with_none() {
        let q = ModuleQueue::new("R", QueueConfig { recv_timeout: Ticks::from_ms(20), ..QueueConfig::default() });
        assert!(q.receive().is_none());
        assert_eq!(q.receive_or_err(), Err(BusError::QueueEmpty));
    }

    #[test]
    fn dropped_queue_reports_not_created() {
        let q = ModuleQueue::new("R", QueueConfig::default());
        let h = q.handle().clone();
        drop(q);
        let r = h.send(Envelope::notify("S", "R", "x", Value::Null));
        assert_eq!(r.unwrap_err().error, BusError::QueueNotCreated);
    }

    #[test]
    fn ids_are_distinct() {
        let a = ModuleQueue::new("A", QueueConfig::default());
        let b = ModuleQueue::new("B", QueueConfig::default());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.handle().capacity(), 8);
    }
}
