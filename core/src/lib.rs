//! # Relay Core
//!
//! Domain types and capability traits for the notification relay.
//!
//! The relay listens for domain events on a message bus, records them,
//! renders a notification and fans it out to chat subscribers. This crate
//! holds the parts of that pipeline that have no I/O of their own:
//!
//! - [`event`]: the `User` payload, domain and stored events, the subject table
//! - [`decoder`]: raw bus bytes to a validated [`event::DomainEvent`]
//! - [`event_bus`], [`event_store`], [`registry`], [`transport`],
//!   [`dead_letter`]: capabilities implemented by the infrastructure crates
//!   (`relay-redpanda`, `relay-postgres`, `relay-telegram`) and by the
//!   in-memory doubles in `relay-testing`
//! - [`ack`]: acknowledgement carried by every inbound item
//! - [`environment`]: injected clock
//!
//! All capability traits return `Pin<Box<dyn Future>>` so they can be shared
//! as `Arc<dyn Trait>` between the two listeners.

pub mod ack;
pub mod dead_letter;
pub mod decoder;
pub mod environment;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod registry;
pub mod transport;

pub use ack::{Ack, Received};
pub use dead_letter::{DeadLetter, DeadLetterSink, DeadLetterStatus, Stage};
pub use decoder::{DecodeError, decode};
pub use event::{DomainEvent, EventKind, StoredEvent, User};
pub use event_bus::{BusMessage, EventBus, EventBusError, MessageStream, ReceivedMessage};
pub use event_store::{EventStore, StorageError};
pub use registry::{ChatId, Subscriber, SubscriberRegistry, SubscriberStream};
pub use transport::{
    ChatCommand, ChatTransport, CommandSource, CommandStream, DeliveryError, ReceivedCommand,
    TransportError,
};
