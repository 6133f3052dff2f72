//! # Relay Testing
//!
//! In-memory doubles for every relay capability plus a few test helpers.
//!
//! - [`InMemoryEventBus`], [`InMemoryEventStore`],
//!   [`InMemorySubscriberRegistry`], [`InMemoryDeadLetterQueue`]
//! - [`RecordingTransport`]: captures sends, fails on demand per recipient
//! - [`ScriptedCommandSource`]: feeds chat commands from a channel
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use relay_core::registry::{ChatId, SubscriberRegistry};
//! use relay_testing::InMemorySubscriberRegistry;
//!
//! # tokio_test::block_on(async {
//! let registry = InMemorySubscriberRegistry::new();
//! registry.register_if_absent(ChatId(1)).await.unwrap();
//! registry.register_if_absent(ChatId(1)).await.unwrap();
//! assert_eq!(registry.len(), 1);
//! # });
//! ```

use chrono::{DateTime, Utc};
use relay_core::environment::Clock;
use std::time::Duration;

mod bus;
mod dead_letter;
mod store;
mod transport;

pub use bus::InMemoryEventBus;
pub use dead_letter::InMemoryDeadLetterQueue;
pub use store::{InMemoryEventStore, InMemorySubscriberRegistry};
pub use transport::{RecordingTransport, ScriptedCommandSource};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests.
    ///
    /// ```
    /// use relay_testing::mocks::FixedClock;
    /// use relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Sample payloads.
pub mod fixtures {
    use relay_core::event::{SUBJECT_CUSTOMER_REGISTERED, User};
    use serde_json::json;

    /// The customer used throughout the tests: Ana Lee, en, US.
    #[must_use]
    pub fn ana() -> User {
        User {
            id: "1".to_string(),
            tenant_id: "t1".to_string(),
            phone: None,
            email: None,
            first_name: Some("Ana".to_string()),
            last_name: Some("Lee".to_string()),
            country: "US".to_string(),
            language: "en".to_string(),
        }
    }

    /// Wire body carrying `user`, as published by the upstream service.
    #[must_use]
    pub fn registration_body(user: &User) -> Vec<u8> {
        json!({
            "pattern": SUBJECT_CUSTOMER_REGISTERED,
            "data": { "payload": user },
        })
        .to_string()
        .into_bytes()
    }
}

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;
    use relay_core::event::User;

    fn required() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9 _.-]{0,15}"
    }

    fn optional() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[^\u{0}]{0,20}")
    }

    /// Any valid [`User`]: non-blank required fields, arbitrary optional ones.
    pub fn arb_user() -> impl Strategy<Value = User> {
        (
            required(),
            required(),
            optional(),
            optional(),
            optional(),
            optional(),
            required(),
            required(),
        )
            .prop_map(
                |(id, tenant_id, phone, email, first_name, last_name, country, language)| User {
                    id,
                    tenant_id,
                    phone,
                    email,
                    first_name,
                    last_name,
                    country,
                    language,
                },
            )
    }
}

/// Install a `fmt` subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub use mocks::{FixedClock, test_clock};
