//! In-memory message bus.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use relay_core::ack::{Ack, Received};
use relay_core::event_bus::{BusMessage, EventBus, EventBusError, MessageStream, ReceivedMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Delivery sequence number, unique per bus.
type Seq = u64;

type Sender = mpsc::UnboundedSender<Result<(Seq, BusMessage), EventBusError>>;

struct Subscription {
    id: u64,
    subjects: Vec<String>,
    tx: Sender,
}

struct InFlight {
    subscription: u64,
    seq: Seq,
    message: BusMessage,
}

#[derive(Default)]
struct BusState {
    /// Every message ever published, in order.
    published: Vec<BusMessage>,
    /// Messages no live subscription has taken yet.
    backlog: Vec<BusMessage>,
    /// Handed to a subscription, not acknowledged yet.
    in_flight: Vec<InFlight>,
    /// Messages whose ack fired, in ack order.
    acknowledged: Vec<BusMessage>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl BusState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&mut self, subscription: u64, tx: &Sender, message: BusMessage) -> bool {
        let seq = self.next_id();
        if tx.send(Ok((seq, message.clone()))).is_err() {
            return false;
        }
        self.in_flight.push(InFlight {
            subscription,
            seq,
            message,
        });
        true
    }

    fn drop_closed_subscriptions(&mut self) {
        self.subscriptions.retain(|s| !s.tx.is_closed());
    }

    /// Take unacknowledged messages of ended subscriptions on `subjects`.
    fn take_orphans(&mut self, subjects: &[String]) -> Vec<BusMessage> {
        let live: Vec<u64> = self.subscriptions.iter().map(|s| s.id).collect();
        let (orphans, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|f| {
                !live.contains(&f.subscription) && subjects.contains(&f.message.subject)
            });
        self.in_flight = kept;
        orphans.into_iter().map(|f| f.message).collect()
    }

    fn acknowledge(&mut self, seq: Seq) {
        if let Some(index) = self.in_flight.iter().position(|f| f.seq == seq) {
            let entry = self.in_flight.remove(index);
            self.acknowledged.push(entry.message);
        }
    }
}

/// In-memory bus modelling a single consumer group.
///
/// Messages go to every live subscription on their subject. Messages
/// published while nobody listens are held back and handed to the next
/// subscription that covers their subject, so tests may publish before the
/// listener has subscribed.
///
/// Acks stand in for offset commits. A message handed to a subscription
/// that ends before acking it is redelivered to the next subscription on
/// its subject, ahead of the backlog, as a broker resuming from the last
/// committed offset would.
///
/// ```
/// use futures::StreamExt;
/// use relay_core::event_bus::EventBus;
/// use relay_testing::InMemoryEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new();
/// bus.publish("customer.registered", b"{}").await.unwrap();
///
/// let mut stream = bus.subscribe(&["customer.registered"]).await.unwrap();
/// let received = stream.next().await.unwrap().unwrap();
/// assert_eq!(received.message.payload, b"{}");
/// assert!(bus.acknowledged().is_empty());
///
/// received.ack.ack();
/// assert_eq!(bus.acknowledged().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All messages published so far.
    #[must_use]
    pub fn published(&self) -> Vec<BusMessage> {
        self.lock().published.clone()
    }

    /// Messages acknowledged so far, in ack order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<BusMessage> {
        self.lock().acknowledged.clone()
    }

    /// Messages handed out but not acknowledged, in delivery order.
    #[must_use]
    pub fn unacknowledged(&self) -> Vec<BusMessage> {
        self.lock().in_flight.iter().map(|f| f.message.clone()).collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut state = self.lock();
        state.drop_closed_subscriptions();
        state.subscriptions.len()
    }

    /// Yield `error` on every live subscription.
    pub fn inject_error(&self, error: &EventBusError) {
        let state = self.lock();
        for subscription in &state.subscriptions {
            let _ = subscription.tx.send(Err(error.clone()));
        }
    }

    /// End every live subscription, as if the broker connection dropped.
    pub fn disconnect_all(&self) {
        self.lock().subscriptions.clear();
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let message = BusMessage::new(subject, payload);

        Box::pin(async move {
            let mut state = self.lock();
            state.published.push(message.clone());
            state.drop_closed_subscriptions();

            let targets: Vec<(u64, Sender)> = state
                .subscriptions
                .iter()
                .filter(|s| s.subjects.contains(&message.subject))
                .map(|s| (s.id, s.tx.clone()))
                .collect();

            let mut delivered = false;
            for (id, tx) in targets {
                delivered |= state.deliver(id, &tx, message.clone());
            }
            if !delivered {
                state.backlog.push(message);
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subjects: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let subjects: Vec<String> = subjects.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            if subjects.is_empty() {
                return Err(EventBusError::SubscriptionFailed {
                    subjects,
                    reason: "no subjects given".to_string(),
                });
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.lock();
                state.drop_closed_subscriptions();
                let id = state.next_id();

                let mut pending = state.take_orphans(&subjects);
                let backlog = std::mem::take(&mut state.backlog);
                let (matching, rest): (Vec<_>, Vec<_>) = backlog
                    .into_iter()
                    .partition(|m| subjects.contains(&m.subject));
                state.backlog = rest;
                pending.extend(matching);

                for message in pending {
                    state.deliver(id, &tx, message);
                }
                state.subscriptions.push(Subscription { id, subjects, tx });
            }

            let state = Arc::clone(&self.state);
            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item.map(|(seq, message)| with_recorded_ack(&state, seq, message));
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

fn with_recorded_ack(
    state: &Arc<Mutex<BusState>>,
    seq: Seq,
    message: BusMessage,
) -> ReceivedMessage {
    let state = Arc::clone(state);
    Received::new(
        message,
        Ack::new(move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .acknowledge(seq);
        }),
    )
}
