//! Quote entity and request shapes shared by the store, service and HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the store. Starts at 1 and is never reused.
pub type QuoteId = u64;

/// A stored quote. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub author: String,
    /// Quote body, serialized as `quote` on the wire
    #[serde(rename = "quote")]
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /quotes`. Both fields are required; empty strings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub author: String,
    pub quote: String,
}

impl QuoteRequest {
    pub fn new(author: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            quote: quote.into(),
        }
    }
}
