//! Domain event types for the notification relay.
//!
//! A [`DomainEvent`] is what the decoder produces from a bus message: the
//! subject it arrived on plus the typed [`User`] payload. Once the event store
//! accepts it, it becomes a [`StoredEvent`] carrying storage metadata.
//!
//! # Event Kinds
//!
//! The relay routes bus subjects through a static table. Only subjects with an
//! [`EventKind`] are processed; everything else is ignored upstream.
//!
//! ```
//! use relay_core::event::EventKind;
//!
//! assert_eq!(
//!     EventKind::from_subject("customer.registered"),
//!     Some(EventKind::CustomerRegistered)
//! );
//! assert_eq!(EventKind::from_subject("customer.deleted"), None);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Subject of the customer-registered event on the bus.
pub const SUBJECT_CUSTOMER_REGISTERED: &str = "customer.registered";

/// A customer record as carried by bus events.
///
/// Field names follow the wire format (`tenantId`, `firstName`, ...).
/// Optional fields may be absent or empty and are kept exactly as received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Customer identifier.
    pub id: String,

    /// Tenant the customer belongs to.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,

    /// Phone number, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    /// Email address, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Given name, if provided.
    #[serde(rename = "firstName", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    /// Family name, if provided.
    #[serde(rename = "lastName", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    /// Country code.
    pub country: String,

    /// Preferred language.
    pub language: String,
}

/// A decoded, validated event ready for persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    /// The bus subject the event arrived on.
    pub subject: String,

    /// The event payload.
    pub payload: User,
}

impl DomainEvent {
    /// Create a new domain event.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: User) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }
}

/// A domain event as recorded by the event store.
///
/// Stored events are immutable. `deleted_at` is a storage-layer convention
/// and is never set by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    /// Storage identity.
    pub id: i64,

    /// The bus subject the event arrived on.
    pub subject: String,

    /// The persisted payload.
    pub payload: User,

    /// When the row was created.
    pub created_at: DateTime<Utc>,

    /// When the row was last updated (equal to `created_at` in practice).
    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredEvent {{ id: {}, subject: {}, user: {} }}",
            self.id, self.subject, self.payload.id
        )
    }
}

/// Event kinds the relay knows how to handle.
///
/// This is the static dispatch table of the bus listener: each kind names
/// the template used to render it and how its fields feed that template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new customer registered.
    CustomerRegistered,
}

impl EventKind {
    /// Look up the kind handling a bus subject.
    #[must_use]
    pub fn from_subject(subject: &str) -> Option<Self> {
        match subject {
            SUBJECT_CUSTOMER_REGISTERED => Some(Self::CustomerRegistered),
            _ => None,
        }
    }

    /// The bus subject this kind is published on.
    #[must_use]
    pub const fn subject(self) -> &'static str {
        match self {
            Self::CustomerRegistered => SUBJECT_CUSTOMER_REGISTERED,
        }
    }

    /// Name of the template rendering this kind.
    #[must_use]
    pub const fn template_name(self) -> &'static str {
        match self {
            Self::CustomerRegistered => "new_registration",
        }
    }

    /// Build the template context from an event payload.
    ///
    /// Absent optional fields render as empty strings.
    #[must_use]
    pub fn template_context(self, user: &User) -> BTreeMap<String, String> {
        match self {
            Self::CustomerRegistered => BTreeMap::from([
                ("firstname".to_string(), user.first_name.clone().unwrap_or_default()),
                ("lastname".to_string(), user.last_name.clone().unwrap_or_default()),
                ("language".to_string(), user.language.clone()),
                ("country".to_string(), user.country.clone()),
            ]),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}
