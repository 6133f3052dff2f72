//! Redpanda event bus for the notification relay.
//!
//! Implements the [`EventBus`] trait from `relay-core` with rdkafka, so it
//! works against Redpanda or any other Kafka-compatible broker. A bus subject
//! maps one-to-one onto a topic name, and payloads travel as opaque bytes:
//! decoding is the pipeline's job.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only after the subscriber fired the message's
//!   [`Ack`](relay_core::ack::Ack), i.e. after the message was handled
//! - Commits follow delivery order; the first message whose ack is dropped
//!   stops all further commits and ends the subscription, so the next
//!   consumer of the group resumes at that message
//! - A crash before the commit redelivers the message
//! - Ordering holds within a partition; the subject is the message key
//!
//! # Example
//!
//! ```no_run
//! use relay_redpanda::RedpandaEventBus;
//! use relay_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("relay")
//!     .build()?;
//!
//! event_bus.publish("customer.registered", br#"{"data":{}}"#).await?;
//!
//! let mut stream = event_bus.subscribe(&["customer.registered"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(received) => {
//!             println!("Received {}", received.message);
//!             received.ack.ack();
//!         }
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use relay_core::ack::{Ack, Received};
use relay_core::event_bus::{BusMessage, EventBus, EventBusError, MessageStream, ReceivedMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of the channel between the consumer task and a subscriber.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Redpanda-backed [`EventBus`].
///
/// Each [`subscribe`](EventBus::subscribe) call creates its own consumer,
/// shared by two background tasks: one forwards messages into a bounded
/// channel, the other commits their offsets as the subscriber acks them.
///
/// # Example
///
/// ```no_run
/// use relay_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .auto_offset_reset("earliest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create an event bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring an event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by subscriptions.
    ///
    /// Without an explicit group, one is derived from the sorted subjects.
    #[must_use]
    pub fn consumer_group_for(&self, subjects: &[String]) -> String {
        consumer_group_id(self.consumer_group.as_deref(), subjects)
    }
}

fn consumer_group_id(explicit: Option<&str>, subjects: &[String]) -> String {
    if let Some(group) = explicit {
        return group.to_string();
    }
    let mut sorted = subjects.to_vec();
    sorted.sort();
    format!("relay-{}", sorted.join("-"))
}

/// Builder for a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"1"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every instance of the relay.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Capacity of each subscription's channel. Zero is raised to one.
    ///
    /// Default: [`DEFAULT_BUFFER_SIZE`]
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new consumer group starts: `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"latest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "latest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            buffer_size = buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let subject = subject.to_string();
        let payload = payload.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            let record = FutureRecord::to(&subject).payload(&payload).key(subject.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %subject,
                        partition = partition,
                        offset = offset,
                        size = payload.len(),
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        subject = %subject,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        subject,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        subjects: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let subjects: Vec<String> = subjects.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let group_id = self.consumer_group_for(&subjects);
            let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
                subjects: subjects.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            let topics: Vec<&str> = subjects.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topics)
                .map_err(|e| subscription_failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(
                subjects = ?subjects,
                consumer_group = %group_id,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to subjects"
            );

            let consumer = Arc::new(consumer);
            let (tx, mut rx) = mpsc::channel(self.buffer_size);
            let (commits_tx, commits_rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_messages(Arc::clone(&consumer), tx, commits_tx));
            tokio::spawn(commit_in_order(consumer, commits_rx));

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

/// Offset waiting for its message to be handled.
struct PendingCommit {
    topic: String,
    partition: i32,
    offset: i64,
    /// `None` for records that carry nothing to handle.
    handled: Option<oneshot::Receiver<()>>,
}

impl PendingCommit {
    fn offsets(&self) -> Result<TopicPartitionList, rdkafka::error::KafkaError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.topic,
            self.partition,
            Offset::Offset(self.offset + 1),
        )?;
        Ok(offsets)
    }
}

/// Forwards the consumer's messages until the subscriber or the commit task
/// goes away.
///
/// Every record is queued for commit before it is handed to the subscriber,
/// so the commit task sees offsets in delivery order.
async fn forward_messages(
    consumer: Arc<StreamConsumer>,
    tx: mpsc::Sender<Result<ReceivedMessage, EventBusError>>,
    commits: mpsc::UnboundedSender<PendingCommit>,
) {
    use futures::StreamExt;

    let mut stream = consumer.stream();

    loop {
        let received = tokio::select! {
            () = tx.closed() => {
                tracing::debug!("Subscriber dropped, exiting consumer task");
                break;
            }
            next = stream.next() => match next {
                Some(received) => received,
                None => break,
            },
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let mut pending = PendingCommit {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            handled: None,
        };

        let item = match message.payload() {
            Some(payload) => {
                tracing::trace!(
                    subject = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Received message"
                );
                let (handled_tx, handled_rx) = oneshot::channel();
                pending.handled = Some(handled_rx);
                let ack = Ack::new(move || {
                    let _ = handled_tx.send(());
                });
                Ok(Received::new(BusMessage::new(message.topic(), payload), ack))
            }
            None => Err(EventBusError::EmptyMessage(message.topic().to_string())),
        };

        if commits.send(pending).is_err() {
            tracing::debug!("Commit task stopped, exiting consumer task");
            break;
        }
        if tx.send(item).await.is_err() {
            tracing::debug!("Subscriber dropped, exiting consumer task");
            break;
        }
    }

    tracing::debug!("Consumer task exiting");
}

/// Commits offsets in delivery order, each once its message was handled.
///
/// Stops at the first message whose ack was dropped: committing anything
/// after it would skip that message on redelivery.
async fn commit_in_order(
    consumer: Arc<StreamConsumer>,
    mut pending: mpsc::UnboundedReceiver<PendingCommit>,
) {
    while let Some(mut entry) = pending.recv().await {
        let acknowledged = match entry.handled.take() {
            Some(handled) => handled.await.is_ok(),
            None => true,
        };
        if !acknowledged {
            tracing::warn!(
                subject = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                "Message was not acknowledged, it will be redelivered"
            );
            break;
        }

        let committed = entry
            .offsets()
            .and_then(|offsets| consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = committed {
            tracing::warn!(
                subject = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }

    tracing::debug!("Commit task exiting");
}
