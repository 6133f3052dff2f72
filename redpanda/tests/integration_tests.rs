//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! These tests are marked `#[ignore]` because they need Docker and take a
//! while to start the broker. Run them explicitly:
//!
//! ```bash
//! cargo test -p relay-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]

use futures::StreamExt;
use relay_core::ack::Received;
use relay_core::event_bus::{BusMessage, EventBus, MessageStream};
use relay_redpanda::RedpandaEventBus;
use relay_testing::fixtures::{ana, registration_body};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const WARMUP: &[u8] = b"warmup";

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn event_bus(brokers: &str, group: &str) -> RedpandaEventBus {
    RedpandaEventBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus")
}

/// Publish a warmup message so the topic exists before subscribing.
async fn ensure_subject_exists(bus: &RedpandaEventBus, subject: &str) {
    for attempt in 1..=60 {
        if bus.publish(subject, WARMUP).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {subject}");
    }
}

/// Collect `count` non-warmup messages, acknowledging each one.
async fn receive(stream: &mut MessageStream, count: usize) -> Vec<BusMessage> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while received.len() < count {
            if let Some(result) = stream.next().await {
                let Received { message, ack } = result.expect("Failed to receive message");
                ack.ack();
                if message.payload != WARMUP {
                    received.push(message);
                }
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");
    received
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn payload_bytes_arrive_unchanged() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = event_bus(&brokers, "relay-roundtrip");
    ensure_subject_exists(&bus, "customer.registered").await;

    let mut stream = bus
        .subscribe(&["customer.registered"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let body = registration_body(&ana());
    bus.publish("customer.registered", &body)
        .await
        .expect("Failed to publish");

    let received = receive(&mut stream, 1).await;
    assert_eq!(received[0].subject, "customer.registered");
    assert_eq!(received[0].payload, body);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn messages_are_tagged_with_their_subject() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = event_bus(&brokers, "relay-subjects");
    ensure_subject_exists(&bus, "customer.registered").await;
    ensure_subject_exists(&bus, "customer.updated").await;

    let mut stream = bus
        .subscribe(&["customer.registered", "customer.updated"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    bus.publish("customer.registered", b"a").await.expect("publish a");
    bus.publish("customer.updated", b"b").await.expect("publish b");

    let mut received: Vec<(String, Vec<u8>)> = receive(&mut stream, 2)
        .await
        .into_iter()
        .map(|m| (m.subject, m.payload))
        .collect();
    received.sort();
    assert_eq!(
        received,
        vec![
            ("customer.registered".to_string(), b"a".to_vec()),
            ("customer.updated".to_string(), b"b".to_vec()),
        ]
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn one_subject_keeps_publish_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = event_bus(&brokers, "relay-ordering");
    ensure_subject_exists(&bus, "customer.registered").await;

    let mut stream = bus
        .subscribe(&["customer.registered"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    for i in 0..10u8 {
        bus.publish("customer.registered", &[i])
            .await
            .expect("Failed to publish");
    }

    let payloads: Vec<Vec<u8>> = receive(&mut stream, 10)
        .await
        .into_iter()
        .map(|m| m.payload)
        .collect();
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    assert_eq!(payloads, expected);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_message_is_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = event_bus(&brokers, "relay-redelivery");
    ensure_subject_exists(&bus, "customer.registered").await;

    let mut stream = bus
        .subscribe(&["customer.registered"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    bus.publish("customer.registered", b"handled")
        .await
        .expect("publish handled");
    bus.publish("customer.registered", b"failed")
        .await
        .expect("publish failed");

    assert_eq!(receive(&mut stream, 1).await[0].payload, b"handled");
    let failed = tokio::time::timeout(Duration::from_secs(20), stream.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("Failed to receive message");
    assert_eq!(failed.message.payload, b"failed");
    drop(failed);
    drop(stream);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut stream = bus
        .subscribe(&["customer.registered"])
        .await
        .expect("Failed to resubscribe");
    let redelivered = receive(&mut stream, 1).await;
    assert_eq!(redelivered[0].payload, b"failed");
}
