//! Message bus across threads: request/reply correlation, FIFO delivery
//! and full/empty queue behaviour.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use esp_modular::Registry;
use esp_modular::bus::{
    CallKind, Envelope, EventKind, ModuleQueue, QueueConfig, RECEIVE_RETURN_CALL_FUNC, Ticks,
    result_payload,
};
use esp_modular::error::BusError;
use serde_json::json;

fn queue(owner: &str, length: usize) -> ModuleQueue {
    ModuleQueue::new(
        owner,
        QueueConfig { length, send_timeout: Ticks::from_ms(50), recv_timeout: Ticks::from_ms(500) },
    )
}

#[test]
fn sync_call_gets_correlated_reply_from_responder_thread() {
    let registry = Arc::new(Registry::new());
    let s = queue("S", 4);
    let r = queue("R", 4);
    registry.register_queue("S", s.handle().clone());
    registry.register_queue("R", r.handle().clone());

    let responder = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            let incoming = r.receive_or_err().unwrap();
            assert_eq!(incoming.call, CallKind::SyncCall);
            assert_eq!(incoming.call_name.as_str(), "ping");
            r.reply_return_call(&incoming, &registry).unwrap();
            (incoming.event_uuid, r.id())
        })
    };

    let request = Envelope::request("S", "R", CallKind::SyncCall, "ping", json!({ "v": [7, "x"] }));
    let sent_uuid = request.event_uuid;
    registry.find_queue("R").unwrap().send(request).unwrap();

    let (seen_uuid, r_id) = responder.join().unwrap();
    assert_eq!(seen_uuid, sent_uuid);

    let reply = s.receive_or_err().unwrap();
    assert_eq!(reply.from.as_str(), "R");
    assert_eq!(reply.to.as_str(), "S");
    assert_eq!(reply.event, EventKind::ProcessDone);
    assert_eq!(reply.call, CallKind::AsyncCall);
    assert_eq!(reply.call_name.as_str(), RECEIVE_RETURN_CALL_FUNC);
    assert_eq!(reply.from_queue, Some(r_id));
    assert_eq!(result_payload(&reply), Some(&json!([7, "x"])));
    assert_ne!(reply.event_uuid, sent_uuid);
}

#[test]
fn reply_without_requester_queue_fails() {
    let registry = Registry::new();
    let r = queue("R", 2);
    let orphan = Envelope::request("GHOST", "R", CallKind::SyncCall, "ping", json!({}));
    assert_eq!(r.reply_return_call(&orphan, &registry), Err(BusError::QueueNotCreated));
}

#[test]
fn each_sender_is_received_in_its_send_order() {
    let q = queue("SINK", 64);
    let senders: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| {
            let handle = q.handle().clone();
            thread::spawn(move || {
                for seq in 0..20 {
                    handle
                        .send(Envelope::notify(name, "SINK", "tick", json!({ "seq": seq })))
                        .unwrap();
                }
            })
        })
        .collect();
    for s in senders {
        s.join().unwrap();
    }

    let mut last = std::collections::HashMap::new();
    let mut total = 0;
    while let Some(env) = q.try_receive() {
        let seq = env.vars["seq"].as_i64().unwrap();
        let prev = last.insert(env.from.to_string(), seq);
        assert!(prev.map_or(seq == 0, |p| seq == p + 1), "{} out of order", env.from);
        total += 1;
    }
    assert_eq!(total, 60);
}

#[test]
fn full_queue_rejects_and_returns_envelope() {
    let q = queue("SMALL", 2);
    let h = q.handle().clone();
    h.try_send(Envelope::notify("A", "SMALL", "one", json!({}))).unwrap();
    h.try_send(Envelope::notify("A", "SMALL", "two", json!({}))).unwrap();

    let rejected = h
        .try_send(Envelope::notify("A", "SMALL", "three", json!({})))
        .unwrap_err();
    assert_eq!(rejected.error, BusError::QueueFull);
    assert_eq!(rejected.envelope.call_name.as_str(), "three");

    let started = Instant::now();
    let timed = h.send(Envelope::notify("A", "SMALL", "four", json!({}))).unwrap_err();
    assert_eq!(timed.error, BusError::QueueFull);
    assert!(started.elapsed() >= Duration::from_millis(40));

    assert_eq!(q.try_receive().unwrap().call_name.as_str(), "one");
    h.try_send(*rejected.envelope).unwrap();
}

#[test]
fn blocked_sender_completes_once_receiver_drains() {
    let q = queue("SLOW", 1);
    let h = q.handle().clone();
    h.try_send(Envelope::notify("A", "SLOW", "first", json!({}))).unwrap();

    let sender = thread::spawn(move || {
        h.send_timeout(Envelope::notify("A", "SLOW", "second", json!({})), Ticks::MAX)
    });
    thread::sleep(Duration::from_millis(30));
    assert_eq!(q.receive().unwrap().call_name.as_str(), "first");
    sender.join().unwrap().unwrap();
    assert_eq!(q.receive().unwrap().call_name.as_str(), "second");
}

#[test]
fn empty_queue_reports_empty_and_dropped_queue_reports_missing() {
    let q = ModuleQueue::new(
        "IDLE",
        QueueConfig { length: 2, send_timeout: Ticks::ZERO, recv_timeout: Ticks::from_ms(20) },
    );
    assert_eq!(q.receive_or_err(), Err(BusError::QueueEmpty));

    let h = q.handle().clone();
    drop(q);
    let err = h.send(Envelope::notify("A", "IDLE", "late", json!({}))).unwrap_err();
    assert_eq!(err.error, BusError::QueueNotCreated);
}
