use std::sync::Arc;
use std::time::Duration;

use sessionweave::bus::{
    BusPayload, ChannelSink, JsonLinesSink, MemorySink, SessionBus,
};
use sessionweave::event::{EventDraft, SessionEvent};

fn session_event(session_id: &str, seq: u64) -> BusPayload {
    BusPayload::SessionEvent {
        session_id: session_id.to_string(),
        event: SessionEvent::from_draft(
            EventDraft::modified("function", vec![format!("f{seq}")]),
            seq,
            "agent-A",
        ),
    }
}

#[tokio::test]
async fn stop_listener_flushes_pending_messages() {
    let sink = MemorySink::new();
    let snapshot = sink.clone();
    let bus = SessionBus::with_sink(sink);
    bus.listen();

    bus.publish("session:s1", session_event("s1", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.stop_listener().await;

    let entries = snapshot.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].channel, "session:s1");
}

#[tokio::test]
async fn multiple_listen_calls_are_idempotent() {
    let sink = MemorySink::new();
    let snapshot = sink.clone();
    let bus = SessionBus::with_sink(sink);
    bus.listen();
    bus.listen();
    bus.listen();

    bus.publish("session:s1", session_event("s1", 1)).unwrap();
    bus.publish("session:s1", session_event("s1", 2)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop_listener().await;

    assert_eq!(snapshot.snapshot().len(), 2);
}

#[tokio::test]
async fn per_channel_subscription_filters_and_preserves_order() {
    let bus = SessionBus::bare();
    let mut s1 = bus.subscribe("session:s1");

    for seq in 1..=5 {
        bus.publish("session:s1", session_event("s1", seq)).unwrap();
        bus.publish("session:s2", session_event("s2", seq)).unwrap();
    }

    let mut seqs = Vec::new();
    while let Some(message) = s1.next_timeout(Duration::from_millis(50)).await {
        assert_eq!(message.channel, "session:s1");
        if let BusPayload::SessionEvent { event, .. } = message.payload {
            seqs.push(event.seq);
        }
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn handler_subscription_stops_on_unsubscribe() {
    let bus = SessionBus::bare();
    let (tx, rx) = flume::unbounded();
    let subscription = bus.subscribe_with("session:s1", move |message| {
        let _ = tx.send(message);
    });

    bus.publish("session:s1", session_event("s1", 1)).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv_async())
        .await
        .expect("delivery")
        .unwrap();
    assert_eq!(first.dedupe_key(), Some(("s1".to_string(), 1)));

    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.publish("session:s1", session_event("s1", 2)).unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv_async())
            .await
            .is_err(),
        "no delivery after unsubscribe"
    );
}

#[tokio::test]
async fn channel_sink_forwards_messages() {
    let (tx, rx) = flume::unbounded();
    let bus = SessionBus::with_sink(ChannelSink::new(tx));
    bus.listen();

    bus.publish("agent:events", BusPayload::AgentDead {
        agent_id: "agent-X".into(),
    })
    .unwrap();

    let received = rx.recv_async().await.unwrap();
    assert_eq!(received.channel, "agent:events");
    assert!(matches!(received.payload, BusPayload::AgentDead { .. }));
}

#[tokio::test]
async fn multi_sink_broadcast() {
    let memory = MemorySink::new();
    let (tx, rx) = flume::unbounded();
    let bus = SessionBus::with_sinks(vec![
        Box::new(memory.clone()),
        Box::new(ChannelSink::new(tx)),
    ]);
    bus.listen();

    bus.publish("session:s1", session_event("s1", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(memory.snapshot().len(), 1);
    assert!(rx.recv_async().await.is_ok());
}

#[tokio::test]
async fn jsonlines_sink_writes_wire_shape() {
    use parking_lot::Mutex as ParkingMutex;
    use std::io::Cursor;

    struct SharedWriter(Arc<ParkingMutex<Cursor<Vec<u8>>>>);
    impl std::io::Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.0.lock().flush()
        }
    }

    let buffer = Arc::new(ParkingMutex::new(Cursor::new(Vec::new())));
    let mut sink = JsonLinesSink::new(Box::new(SharedWriter(Arc::clone(&buffer))));

    use sessionweave::bus::{BusMessage, MessageSink};
    let message = BusMessage::new("session:s1", session_event("s1", 7));
    sink.handle(&message).unwrap();

    let output = String::from_utf8(buffer.lock().get_ref().clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(output.lines().next().unwrap()).unwrap();
    assert_eq!(parsed["sessionId"], "s1");
    assert_eq!(parsed["seq"], 7);
    assert_eq!(parsed["type"], "modified");
    assert!(parsed["emittedAt"].is_string());
}

#[tokio::test]
async fn metrics_track_capacity_and_drops() {
    let bus = SessionBus::bare();
    let metrics = bus.metrics();
    assert_eq!(metrics.capacity, 1024);
    assert_eq!(metrics.dropped, 0);
}

#[tokio::test]
async fn subscribers_observe_close() {
    let bus = SessionBus::bare();
    let mut stream = bus.subscribe("session:s1");
    bus.close();
    assert!(stream.next_timeout(Duration::from_millis(50)).await.is_none());
    assert!(bus.is_closed());
    assert!(bus.publish("session:s1", session_event("s1", 1)).is_err());
}

#[tokio::test]
async fn dynamically_added_sink_receives_messages() {
    let bus = SessionBus::bare();
    bus.listen();

    let memory = MemorySink::new();
    bus.add_sink(memory.clone());
    bus.publish("session:s1", session_event("s1", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(memory.snapshot().len(), 1);
}
