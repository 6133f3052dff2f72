//! Bus payload decoding.
//!
//! Converts the raw bytes of a bus message into a [`DomainEvent`]. The wire
//! format is a JSON object whose `data.payload` member holds a [`User`]:
//!
//! ```json
//! {
//!   "pattern": "customer.registered",
//!   "data": {
//!     "payload": {
//!       "id": "1", "tenantId": "t1", "country": "US", "language": "en",
//!       "firstName": "Ana", "lastName": "Lee"
//!     }
//!   }
//! }
//! ```
//!
//! Any other top-level key is ignored. Decoding is pure: it never touches
//! storage, so a rejected body leaves no trace besides the error.
//!
//! # Example
//!
//! ```
//! use relay_core::decoder::{decode, DecodeError};
//!
//! let body = br#"{"data":{"payload":{"id":"1","tenantId":"t1","country":"US","language":"en"}}}"#;
//! let event = decode("customer.registered", body).unwrap();
//! assert_eq!(event.payload.tenant_id, "t1");
//!
//! let err = decode("customer.registered", b"not json").unwrap_err();
//! assert!(matches!(err, DecodeError::InvalidJson(_)));
//! ```

use crate::event::{DomainEvent, User};
use serde::Deserialize;
use serde_json::error::Category;
use thiserror::Error;

/// Errors produced while decoding a bus payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body is not syntactically valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The body is JSON but does not have the expected shape
    /// (missing `data.payload`, missing required field, wrong field type).
    #[error("Malformed event body: {0}")]
    Malformed(String),

    /// A required field is present but empty.
    #[error("Required field '{0}' is empty")]
    EmptyField(&'static str),
}

impl DecodeError {
    fn from_json(err: &serde_json::Error) -> Self {
        match err.classify() {
            Category::Syntax | Category::Eof | Category::Io => Self::InvalidJson(err.to_string()),
            Category::Data => Self::Malformed(err.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    payload: User,
}

/// Decode a raw bus payload received on `subject`.
///
/// # Errors
///
/// - [`DecodeError::InvalidJson`] if the bytes are not JSON
/// - [`DecodeError::Malformed`] if `data.payload` is missing or does not match
///   the [`User`] shape
/// - [`DecodeError::EmptyField`] if `id`, `tenantId`, `country` or `language`
///   is blank
pub fn decode(subject: &str, bytes: &[u8]) -> Result<DomainEvent, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::from_json(&e))?;
    let user = envelope.data.payload;
    validate(&user)?;
    Ok(DomainEvent::new(subject, user))
}

fn validate(user: &User) -> Result<(), DecodeError> {
    let required = [
        ("id", &user.id),
        ("tenantId", &user.tenant_id),
        ("country", &user.country),
        ("language", &user.language),
    ];

    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(DecodeError::EmptyField(name));
        }
    }

    Ok(())
}
