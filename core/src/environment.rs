//! Injected environment capabilities.

use chrono::{DateTime, Utc};

/// Abstracts time so in-memory stores and tests can agree on timestamps.
///
/// The Postgres adapters stamp rows with the database clock instead.
///
/// ```
/// use chrono::{DateTime, TimeZone, Utc};
/// use relay_core::environment::Clock;
///
/// struct Frozen(DateTime<Utc>);
///
/// impl Clock for Frozen {
///     fn now(&self) -> DateTime<Utc> {
///         self.0
///     }
/// }
///
/// let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(Frozen(at).now(), at);
/// ```
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}
