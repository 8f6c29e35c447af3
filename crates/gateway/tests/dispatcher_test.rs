//! Dispatcher integration tests over the in-process bus and cache.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bus_client::{Bus, MemoryBus};
use bytes::Bytes;
use common::{chunk_payload, identity, raw_records, request, RecordingSink};
use gateway::{DispatchOutcome, Dispatcher, DispatcherConfig, GatewayError};
use session_cache::{CacheConfig, MemorySessionCache, MessageRole, RedisSessionCache, SessionStore};

fn fixtures() -> (Arc<MemoryBus>, Arc<MemorySessionCache>, Arc<Dispatcher>) {
    fixtures_with(DispatcherConfig::default())
}

fn fixtures_with(
    config: DispatcherConfig,
) -> (Arc<MemoryBus>, Arc<MemorySessionCache>, Arc<Dispatcher>) {
    let bus = Arc::new(MemoryBus::new());
    let cache = Arc::new(MemorySessionCache::new(CacheConfig::default()));
    let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cache.clone(), config));
    (bus, cache, dispatcher)
}

#[tokio::test]
async fn relays_chunks_in_order_and_records_memory() {
    let (bus, cache, dispatcher) = fixtures();

    // Worker: stream "he", "llo", then a terminal "!".
    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let worker_bus = bus.clone();
    tokio::spawn(async move {
        let req = requests.next().await.unwrap();
        let reply = req.header("Reply").unwrap().to_string();
        assert!(req.header("Ack").is_some());

        worker_bus.publish(&reply, chunk_payload("he", false)).await.unwrap();
        worker_bus.publish(&reply, chunk_payload("llo", false)).await.unwrap();
        worker_bus.publish(&reply, chunk_payload("!", true)).await.unwrap();
    });

    let sink = RecordingSink::new();
    let outcome = dispatcher
        .dispatch(&identity("alice"), request("r1", "hi"), None, &sink)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 3);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.sequence, i as u64);
        assert_eq!(chunk.terminal, i == 2);
        assert!(chunk.frame.id.is_some());
    }
    let text: String = chunks.iter().map(|c| c.frame.delta_text()).collect();
    assert_eq!(text, "hello!");

    // Hot buffer: exactly one user and one assistant entry, in order.
    let messages = cache.recent_messages("r1", 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].text, "hi");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].text, "hello!");

    // Raw-memory stream: exactly one completed record.
    let records = raw_records(&bus);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request_text, "hi");
    assert_eq!(records[0].response_text, "hello!");
    assert_eq!(records[0].owner, "alice");

    assert_eq!(dispatcher.registry().active_count(), 0);
}

#[tokio::test]
async fn concurrent_dispatch_for_the_same_conversation_conflicts() {
    // Short drain: the cancelled ticket below has no worker to finish it.
    let (_bus, _cache, dispatcher) = fixtures_with(DispatcherConfig {
        drain_timeout: Duration::from_millis(100),
        ..DispatcherConfig::default()
    });

    let first = dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();

    let err = dispatcher
        .begin(&identity("alice"), request("r1", "again"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Conflict));

    // Other conversations and owners are unaffected.
    dispatcher
        .begin(&identity("alice"), request("r2", "hi"), None)
        .await
        .unwrap();
    dispatcher
        .begin(&identity("bob"), request("r1", "hi"), None)
        .await
        .unwrap();

    // Draining the first ticket frees the key.
    let sink = RecordingSink::new();
    let ticket = dispatcher.registry().get("alice", "r1").unwrap();
    ticket.cancel();
    let outcome = dispatcher.relay(first, &sink).await;
    assert_eq!(outcome, DispatchOutcome::Cancelled);

    dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_failure_rolls_back_admission() {
    let (bus, _cache, dispatcher) = fixtures();

    bus.fail_publishes(true);
    let err = dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
    assert_eq!(dispatcher.registry().active_count(), 0);

    // A retry for the same conversation succeeds once the bus is back.
    bus.fail_publishes(false);
    dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_stops_forwarding_and_drains_to_the_terminal_chunk() {
    let (bus, cache, dispatcher) = fixtures();

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let active = dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();
    let req = requests.next().await.unwrap();
    let reply = req.header("Reply").unwrap().to_string();

    let sink = Arc::new(RecordingSink::new());
    let relay = {
        let dispatcher = dispatcher.clone();
        let sink = sink.clone();
        tokio::spawn(async move { dispatcher.relay(active, sink.as_ref()).await })
    };

    bus.publish(&reply, chunk_payload("he", false)).await.unwrap();
    while sink.chunks().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Client goes away; the worker keeps streaming.
    let ticket = dispatcher.registry().get("alice", "r1").unwrap();
    ticket.cancel();
    bus.publish(&reply, chunk_payload("llo", false)).await.unwrap();
    bus.publish(&reply, chunk_payload("!", true)).await.unwrap();

    let outcome = relay.await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Cancelled);

    // Nothing after the cancel reached the sink.
    assert_eq!(sink.chunks().len(), 1);

    // The drained terminal kept the hot buffer consistent, but no memory
    // record was published.
    let messages = cache.recent_messages("r1", 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].text, "hello!");
    assert!(raw_records(&bus).is_empty());

    assert_eq!(dispatcher.registry().active_count(), 0);
}

#[tokio::test]
async fn closed_sink_triggers_the_drain_path() {
    let (bus, _cache, dispatcher) = fixtures();

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let active = dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();
    let req = requests.next().await.unwrap();
    let reply = req.header("Reply").unwrap().to_string();

    let sink = Arc::new(RecordingSink::new());
    sink.close();

    let relay = {
        let dispatcher = dispatcher.clone();
        let sink = sink.clone();
        tokio::spawn(async move { dispatcher.relay(active, sink.as_ref()).await })
    };

    bus.publish(&reply, chunk_payload("he", false)).await.unwrap();
    bus.publish(&reply, chunk_payload("llo!", true)).await.unwrap();

    let outcome = relay.await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Cancelled);
    assert!(sink.chunks().is_empty());
    assert!(raw_records(&bus).is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_delivers_a_terminal_error_chunk() {
    let (bus, _cache, dispatcher) = fixtures();

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let active = dispatcher
        .begin(&identity("alice"), request("r1", "hi"), None)
        .await
        .unwrap();
    let req = requests.next().await.unwrap();
    let reply = req.header("Reply").unwrap().to_string();

    // One chunk, then the worker stalls forever.
    bus.publish(&reply, chunk_payload("he", false)).await.unwrap();

    let sink = Arc::new(RecordingSink::new());
    let relay = {
        let dispatcher = dispatcher.clone();
        let sink = sink.clone();
        tokio::spawn(async move { dispatcher.relay(active, sink.as_ref()).await })
    };

    let outcome = relay.await.unwrap();
    assert_eq!(outcome, DispatchOutcome::TimedOut);

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 2);
    assert!(chunks[1].terminal);
    assert_eq!(chunks[1].frame.error.as_deref(), Some("timeout"));
    assert!(raw_records(&bus).is_empty());
    assert_eq!(dispatcher.registry().active_count(), 0);
}

#[tokio::test]
async fn worker_error_envelope_terminates_without_a_memory_record() {
    let (bus, cache, dispatcher) = fixtures();

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let worker_bus = bus.clone();
    tokio::spawn(async move {
        let req = requests.next().await.unwrap();
        let reply = req.header("Reply").unwrap().to_string();
        worker_bus
            .publish(&reply, Bytes::from_static(br#"{"error":"model exploded"}"#))
            .await
            .unwrap();
    });

    let sink = RecordingSink::new();
    let outcome = dispatcher
        .dispatch(&identity("alice"), request("r1", "hi"), None, &sink)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::WorkerError);

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].terminal);
    assert_eq!(chunks[0].frame.error.as_deref(), Some("model exploded"));

    // Only the user entry made it to the hot buffer; no memory record.
    let messages = cache.recent_messages("r1", 10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
    assert!(raw_records(&bus).is_empty());
}

#[tokio::test]
async fn error_header_marks_a_chunk_terminal() {
    let (bus, _cache, dispatcher) = fixtures();

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let worker_bus = bus.clone();
    tokio::spawn(async move {
        let req = requests.next().await.unwrap();
        let reply = req.header("Reply").unwrap().to_string();
        let headers = vec![("Error".to_string(), "true".to_string())];
        worker_bus
            .publish_with_headers(&reply, &headers, Bytes::from_static(b"{}"))
            .await
            .unwrap();
    });

    let sink = RecordingSink::new();
    let outcome = dispatcher
        .dispatch(&identity("alice"), request("r1", "hi"), None, &sink)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::WorkerError);

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].terminal);
    assert_eq!(chunks[0].frame.error.as_deref(), Some("worker error"));
}

#[tokio::test]
async fn empty_or_mismatched_requests_are_rejected() {
    let (_bus, _cache, dispatcher) = fixtures();

    let err = dispatcher
        .begin(&identity("alice"), request("r1", "   "), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));

    let err = dispatcher
        .begin(&identity("alice"), request("", "hi"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));

    let mut spoofed = request("r1", "hi");
    spoofed.owner = Some("bob".to_string());
    let err = dispatcher
        .begin(&identity("alice"), spoofed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));

    assert_eq!(dispatcher.registry().active_count(), 0);
}

#[tokio::test]
async fn degraded_cache_does_not_abort_the_dispatch() {
    let bus = Arc::new(MemoryBus::new());
    // Nothing listens on this port; every cache operation fails.
    let cache = Arc::new(
        RedisSessionCache::new("redis://127.0.0.1:1", CacheConfig::default()).unwrap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        bus.clone(),
        cache,
        DispatcherConfig::default(),
    ));

    let mut requests = bus.subscribe("chat.request").await.unwrap();
    let worker_bus = bus.clone();
    tokio::spawn(async move {
        let req = requests.next().await.unwrap();
        let reply = req.header("Reply").unwrap().to_string();
        worker_bus.publish(&reply, chunk_payload("ok", true)).await.unwrap();
    });

    let sink = RecordingSink::new();
    let outcome = dispatcher
        .dispatch(&identity("alice"), request("r1", "hi"), None, &sink)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(sink.chunks().len(), 1);
    assert_eq!(raw_records(&bus).len(), 1);
}
