//! Acknowledgement of inbound items.
//!
//! Every item a listener receives from the bus or from the chat command
//! source carries an [`Ack`]. The listener fires it once the item has been
//! handled; the source only then confirms the item upstream (Kafka offset
//! commit, Telegram `getUpdates` offset).
//!
//! ```text
//! source ──► Received { message, ack } ──► handler ──► ack.ack() ──► commit
//!                                             │
//!                                             └─ error: ack dropped, no commit
//! ```
//!
//! Dropping an [`Ack`] without firing it leaves the item unacknowledged, so
//! it is redelivered after the next restart or rebalance.

use std::fmt;

/// One-shot acknowledgement for a received item.
///
/// ```
/// use relay_core::ack::Ack;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// let ack = Ack::new(move || flag.store(true, Ordering::SeqCst));
///
/// ack.ack();
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[must_use = "dropping an Ack leaves the item unacknowledged"]
pub struct Ack(Option<Box<dyn FnOnce() + Send>>);

impl Ack {
    /// Ack that runs `on_ack` when fired.
    pub fn new(on_ack: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_ack)))
    }

    /// Ack for a source with nothing to confirm.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Confirm the item as handled.
    pub fn ack(mut self) {
        if let Some(on_ack) = self.0.take() {
            on_ack();
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ack")
            .field(&if self.0.is_some() { "pending" } else { "noop" })
            .finish()
    }
}

/// An inbound item together with its acknowledgement.
#[derive(Debug)]
pub struct Received<T> {
    /// The item itself.
    pub message: T,
    /// Fire after `message` has been handled.
    pub ack: Ack,
}

impl<T> Received<T> {
    /// Pair `message` with `ack`.
    pub const fn new(message: T, ack: Ack) -> Self {
        Self { message, ack }
    }

    /// Item whose source needs no confirmation.
    pub fn without_ack(message: T) -> Self {
        Self::new(message, Ack::noop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropped_ack_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let ack = Ack::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(ack);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn noop_ack_can_be_fired() {
        let received = Received::without_ack("item");
        assert_eq!(format!("{:?}", received.ack), "Ack(\"noop\")");
        received.ack.ack();
    }
}
