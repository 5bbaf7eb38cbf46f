//! Memory transport integration tests
//!
//! End-to-end tests through the public `Client` API against the
//! in-process broker: stream and consumer lifecycle, publish guarantees,
//! capability checks, connection lifecycle and consume loops.

use a3s_jetstream::transport::codes;
use a3s_jetstream::transport::memory::MemoryBroker;
use a3s_jetstream::{
    Client, ClientConfig, ConnectionState, ConsumeOptions, ConsumerConfig, ConsumerUpdate,
    DeadLetterHandler, DeliverPolicy, HandlerError, JetStreamError, JsMessage,
    MemoryDeadLetterHandler, Payload, PublishOptions, StreamInfoOptions, StreamSpec, StreamUpdate,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn client(broker: &MemoryBroker) -> Client {
    Client::memory(broker, ClientConfig::default()).unwrap()
}

fn orders() -> StreamSpec {
    StreamSpec::new("ORDERS").subjects(["orders.*"])
}

fn fast() -> ConsumeOptions {
    ConsumeOptions::default()
        .expires(Duration::from_millis(100))
        .retry_delay(Duration::from_millis(10))
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ─── Streams ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_or_update_matches_single_update() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let spec = orders()
        .max_age(Duration::from_secs(600))
        .max_bytes(1 << 20)
        .replicas(1);

    client.streams().create_or_update(&spec).await.unwrap();
    let twice = client.streams().create_or_update(&spec).await.unwrap();

    let updated = client
        .streams()
        .update("ORDERS", &StreamUpdate::from(&spec.config))
        .await
        .unwrap();
    assert_eq!(twice.config, updated.config);
}

#[tokio::test]
async fn test_autoupdate_disabled_conflict_does_not_mutate() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    let err = client
        .streams()
        .create_or_update(&orders().subjects(["orders.*", "refunds.*"]).autoupdate(false))
        .await
        .unwrap_err();
    match err {
        JetStreamError::Conflict { raw_code, .. } => {
            assert_eq!(raw_code, codes::STREAM_NAME_IN_USE)
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    let info = client
        .streams()
        .info("ORDERS", &StreamInfoOptions::default())
        .await
        .unwrap();
    assert_eq!(info.config.subjects, vec!["orders.*".to_string()]);
}

#[tokio::test]
async fn test_delete_missing_returns_false() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    assert!(!client.streams().delete("NOPE").await.unwrap());

    client.streams().create_or_update(&orders()).await.unwrap();
    assert!(!client.consumers().delete("ORDERS", "nope").await.unwrap());
    assert!(!client.consumers().delete("NOPE", "nope").await.unwrap());
}

#[tokio::test]
async fn test_storage_change_is_rejected() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    let err = client
        .streams()
        .create_or_update(&orders().storage(a3s_jetstream::StorageType::Memory))
        .await
        .unwrap_err();
    assert_eq!(err.raw_code(), Some(codes::STREAM_STORAGE_CHANGE));
    assert!(matches!(err, JetStreamError::Unknown { status: Some(500), .. }));
}

// ─── Publish ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_empty_publish_sequences_increase() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    let mut sequences = Vec::new();
    for subject in ["orders.created", "orders.paid", "orders.created"] {
        let ack = client
            .publish(subject, None, &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(ack.stream, "ORDERS");
        sequences.push(ack.sequence);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_publish_timeout_and_dedup_reconcile() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    broker.set_publish_delay(Some(Duration::from_millis(300)));
    let options = PublishOptions::new()
        .msg_id("order-42")
        .timeout(Duration::from_millis(30));
    let err = client
        .publish("orders.created", Some("42".into()), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, JetStreamError::Timeout { .. }));

    // the caller retries with the same id; whatever happened before, one copy is stored
    broker.set_publish_delay(None);
    let retry = PublishOptions::new().msg_id("order-42");
    client
        .publish("orders.created", Some("42".into()), &retry)
        .await
        .unwrap();
    let again = client
        .publish("orders.created", Some("42".into()), &retry)
        .await
        .unwrap();
    assert!(again.duplicate);

    let info = client
        .streams()
        .info("ORDERS", &StreamInfoOptions::default())
        .await
        .unwrap();
    assert_eq!(info.state.messages, 1);
}

#[tokio::test]
async fn test_default_timeout_comes_from_config() {
    let broker = MemoryBroker::new();
    let config = ClientConfig {
        publish_timeout_secs: 1,
        ..Default::default()
    };
    let client = Client::memory(&broker, config).unwrap();
    client.streams().create_or_update(&orders()).await.unwrap();

    broker.set_publish_delay(Some(Duration::from_secs(3)));
    let started = tokio::time::Instant::now();
    let err = client
        .publish("orders.created", None, &PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, JetStreamError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_expected_stream_mismatch() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    let err = client
        .publish(
            "orders.created",
            None,
            &PublishOptions::new().expected_stream("PAYMENTS"),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.raw_code(), Some(codes::STREAM_NOT_MATCH));
}

#[tokio::test]
async fn test_default_headers_reach_consumer() {
    let broker = MemoryBroker::new();
    let mut config = ClientConfig::default();
    config.default_headers.insert("App", "billing");
    let client = Client::memory(&broker, config).unwrap();
    client.streams().create_or_update(&orders()).await.unwrap();
    client
        .consumers()
        .create("ORDERS", &ConsumerConfig::durable("c1"))
        .await
        .unwrap();

    client
        .publish(
            "orders.created",
            Some(Payload::json(&serde_json::json!({"id": 1})).unwrap()),
            &PublishOptions::new().header("Trace", "t-1"),
        )
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = client
        .consume("ORDERS", Some("c1"), fast(), move |m: JsMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((
                    m.headers().get("App").map(str::to_string),
                    m.headers().get("Trace").map(str::to_string),
                    m.payload().clone(),
                ));
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
    eventually(|| !seen.lock().unwrap().is_empty()).await;
    handle.stop().await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0.as_deref(), Some("billing"));
    assert_eq!(seen[0].1.as_deref(), Some("t-1"));
    assert_eq!(&seen[0].2[..], br#"{"id":1}"#);
}

// ─── Capability & connection ─────────────────────────────────────

#[tokio::test]
async fn test_disabled_jetstream_never_touches_network() {
    let broker = MemoryBroker::new();
    let config = ClientConfig {
        enable_jetstream: false,
        ..Default::default()
    };
    let client = Client::memory(&broker, config).unwrap();

    let results = vec![
        client.streams().create_or_update(&orders()).await.map(|_| ()),
        client.streams().delete("ORDERS").await.map(|_| ()),
        client
            .consumers()
            .info("ORDERS", "c1")
            .await
            .map(|_| ()),
        client
            .publish("orders.created", None, &PublishOptions::default())
            .await
            .map(|_| ()),
        client
            .consume("ORDERS", Some("c1"), fast(), |_m: JsMessage| async {
                Ok::<(), HandlerError>(())
            })
            .await
            .map(|_| ()),
    ];

    for result in results {
        assert!(matches!(result, Err(JetStreamError::CapabilityDisabled)));
    }
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.request_count(), 0);
}

#[tokio::test]
async fn test_broker_without_jetstream_is_unavailable() {
    let broker = MemoryBroker::new();
    broker.set_jetstream_enabled(false);
    let client = client(&broker);

    let err = client
        .streams()
        .create_or_update(&orders())
        .await
        .unwrap_err();
    assert!(matches!(err, JetStreamError::CapabilityUnavailable { .. }));
    assert_eq!(err.raw_code(), Some(codes::NOT_ENABLED_FOR_ACCOUNT));
}

#[tokio::test]
async fn test_concurrent_first_use_single_handshake() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(30)));
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();
    assert_eq!(broker.connection_count(), 1);

    let fresh = Client::memory(&broker, ClientConfig::default()).unwrap();
    let mut tasks = Vec::new();
    for i in 0..20 {
        let c = fresh.clone();
        tasks.push(tokio::spawn(async move {
            c.publish(
                "orders.created",
                Some(format!("{}", i).into()),
                &PublishOptions::default(),
            )
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(broker.connection_count(), 2);
    assert_eq!(fresh.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_connection_loss_surfaces_not_ready() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    broker.set_connected(false);
    let err = tokio::time::timeout(
        Duration::from_secs(1),
        client.publish("orders.created", None, &PublishOptions::default()),
    )
    .await
    .expect("must not hang")
    .unwrap_err();
    assert!(matches!(err, JetStreamError::NotReady(_)));
    assert!(!client.health());

    broker.set_connected(true);
    client
        .publish("orders.created", None, &PublishOptions::default())
        .await
        .unwrap();
}

// ─── Consumers & consume loops ───────────────────────────────────

#[tokio::test]
async fn test_orders_deliver_new_only_sees_later_message() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();

    client
        .publish(
            "orders.created",
            Some(Payload::json(&serde_json::json!({"id": 1})).unwrap()),
            &PublishOptions::default(),
        )
        .await
        .unwrap();
    let info = client
        .streams()
        .info("ORDERS", &StreamInfoOptions::default())
        .await
        .unwrap();
    assert_eq!(info.state.messages, 1);

    let consumer = client
        .consumers()
        .create(
            "ORDERS",
            &ConsumerConfig::durable("c1").deliver_policy(DeliverPolicy::New),
        )
        .await
        .unwrap();
    assert_eq!(consumer.start_sequence(), 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = client
        .consume("ORDERS", Some("c1"), fast(), move |m: JsMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(m.payload().clone());
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    client
        .publish(
            "orders.created",
            Some(Payload::json(&serde_json::json!({"id": 2})).unwrap()),
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    eventually(|| handle.stats().acked == 1).await;
    // give a wrongly delivered first message the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.delivered, 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(&seen[0][..], br#"{"id":2}"#);
}

#[tokio::test]
async fn test_consumer_update_and_info() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();
    client
        .consumers()
        .create(
            "ORDERS",
            &ConsumerConfig::durable("c1").filter_subject("orders.paid"),
        )
        .await
        .unwrap();

    for subject in ["orders.created", "orders.paid", "orders.paid"] {
        client
            .publish(subject, None, &PublishOptions::default())
            .await
            .unwrap();
    }

    let info = client.consumers().info("ORDERS", "c1").await.unwrap();
    assert_eq!(info.num_pending, 2);

    let updated = client
        .consumers()
        .update(
            "ORDERS",
            "c1",
            &ConsumerUpdate {
                max_deliver: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.config.max_deliver, 4);
    assert_eq!(updated.config.filter_subject.as_deref(), Some("orders.paid"));
}

#[tokio::test]
async fn test_independent_loops_on_one_connection() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();
    for name in ["a", "b"] {
        client
            .consumers()
            .create("ORDERS", &ConsumerConfig::durable(name))
            .await
            .unwrap();
    }

    let ok = |_m: JsMessage| async { Ok::<(), HandlerError>(()) };
    let a = client.consume("ORDERS", Some("a"), fast(), ok).await.unwrap();
    let b = client.consume("ORDERS", Some("b"), fast(), ok).await.unwrap();

    for _ in 0..10 {
        client
            .publish("orders.created", None, &PublishOptions::default())
            .await
            .unwrap();
    }
    eventually(|| a.stats().acked == 10 && b.stats().acked == 10).await;

    // stopping one loop leaves the other and management calls running
    a.stop().await.unwrap();
    client
        .publish("orders.created", None, &PublishOptions::default())
        .await
        .unwrap();
    eventually(|| b.stats().acked == 11).await;
    assert_eq!(client.consumers().names("ORDERS").await.unwrap().len(), 2);
    b.stop().await.unwrap();
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_unacked_in_flight_message_is_redelivered_after_stop() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();
    client
        .consumers()
        .create(
            "ORDERS",
            &ConsumerConfig::durable("c1").ack_wait(Duration::from_millis(150)),
        )
        .await
        .unwrap();
    client
        .publish("orders.created", Some("work".into()), &PublishOptions::default())
        .await
        .unwrap();

    // manual-ack handler that never acks
    let handle = client
        .consume("ORDERS", Some("c1"), fast().auto_ack(false), |_m: JsMessage| async {
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
    eventually(|| handle.stats().delivered == 1).await;
    handle.stop().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = client
        .consume("ORDERS", Some("c1"), fast(), move |m: JsMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(m.info().delivered);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
    eventually(|| handle.stats().acked == 1).await;
    handle.stop().await.unwrap();
    assert_eq!(seen.lock().unwrap().clone(), vec![2]);
}

#[tokio::test]
async fn test_dead_letter_after_max_deliver() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.streams().create_or_update(&orders()).await.unwrap();
    client
        .consumers()
        .create("ORDERS", &ConsumerConfig::durable("c1").max_deliver(3))
        .await
        .unwrap();
    client
        .publish("orders.created", Some("poison".into()), &PublishOptions::default())
        .await
        .unwrap();

    let dlq = Arc::new(MemoryDeadLetterHandler::default());
    let handle = client
        .consume(
            "ORDERS",
            Some("c1"),
            fast().dead_letter(dlq.clone()),
            |_m: JsMessage| async { Err::<(), _>("cannot parse") },
        )
        .await
        .unwrap();
    eventually(|| handle.stats().dead_lettered == 1).await;
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.handler_errors, 3);
    assert_eq!(stats.naked, 2);

    let letters = dlq.list(1).await.unwrap();
    assert_eq!(&letters[0].message.payload[..], b"poison");
    assert_eq!(letters[0].info.delivered, 3);
}
