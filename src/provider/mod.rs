//! Contact data provider boundary.
//!
//! The external skip-trace source is opaque to the engine: a billable
//! lookup function behind [`ContactProvider`]. The HTTP implementation
//! lives in [`http`]; tests inject in-process fakes.

mod http;
mod resilience;

pub use http::{HttpContactProvider, HttpProviderConfig};
pub use resilience::{ExponentialBackoff, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phones and emails extracted from a provider response.
///
/// Parsed exactly once, at cache write time; downstream consumers never
/// re-parse raw provider output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedContacts {
    pub phones: Vec<String>,
    pub emails: Vec<String>,
}

impl ParsedContacts {
    pub fn is_empty(&self) -> bool {
        self.phones.is_empty() && self.emails.is_empty()
    }
}

/// One normalized lookup request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupRequest {
    /// Business entity the lookup is made for.
    pub subject_id: String,
    /// Canonicalized street address.
    pub address: String,
    /// Canonicalized person name.
    pub person: String,
}

impl LookupRequest {
    /// The exact wire body sent to the provider. Also the input to the
    /// payload hash, so it must be deterministic for identical requests.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "address": self.address,
            "person": self.person,
            "reference": self.subject_id,
        })
    }
}

/// A successful provider answer.
#[derive(Clone, Debug)]
pub struct ProviderResponse {
    /// HTTP status (or synthetic 200 for non-HTTP providers).
    pub status: u16,
    /// Opaque serialized response, stored verbatim for audit.
    pub body: serde_json::Value,
    /// Contacts parsed out of `body`.
    pub contacts: ParsedContacts,
}

/// Errors from the provider boundary.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level request failure.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned an error response.
    #[error("provider error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider rate limit hit.
    #[error("provider rate limit exceeded")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },

    /// Invalid credentials.
    #[error("provider rejected credentials: {message}")]
    Auth { message: String },

    /// The provider is answering in demo/sandbox mode. Fabricated data
    /// must never reach the cache; this is a deployment misconfiguration.
    #[error("provider is in demo mode: {message}")]
    DemoMode { message: String },

    /// Provider explicitly reported no match for the subject.
    #[error("provider reported no match")]
    NoMatch,

    /// Request exceeded the configured timeout.
    #[error("provider call timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// Response body could not be interpreted.
    #[error("unparseable provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether a retry with backoff could reasonably succeed.
    ///
    /// Auth and demo-mode failures are configuration problems; retrying
    /// them would only burn the attempt budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout(_) => true,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => (500..=599).contains(status),
            ProviderError::Auth { .. }
            | ProviderError::DemoMode { .. }
            | ProviderError::NoMatch
            | ProviderError::Parse(_) => false,
        }
    }

    /// Provider-suggested retry delay, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The opaque billable lookup function.
#[async_trait]
pub trait ContactProvider: Send + Sync {
    /// Stable identifier of the external source (cache/ledger partition).
    fn name(&self) -> &str;

    /// Endpoint label recorded in the call ledger.
    fn endpoint(&self) -> &str;

    /// Perform one lookup. Every invocation is potentially billable.
    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Extract contacts from an opaque provider body.
///
/// Accepts the field spellings seen across provider payloads:
/// `phones` / `phone_numbers` as strings or `{ "number": .. }` objects,
/// `emails` / `email_addresses` as strings or `{ "address"|"email": .. }`.
pub fn parse_contacts(body: &serde_json::Value) -> ParsedContacts {
    fn strings(value: Option<&serde_json::Value>, keys: &[&str]) -> Vec<String> {
        let Some(items) = value.and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                if let Some(s) = item.as_str() {
                    return Some(s.to_string());
                }
                keys.iter()
                    .find_map(|k| item.get(*k).and_then(|v| v.as_str()))
                    .map(str::to_string)
            })
            .collect()
    }

    let phones = strings(body.get("phones"), &["number"])
        .into_iter()
        .chain(strings(body.get("phone_numbers"), &["number"]))
        .collect();
    let emails = strings(body.get("emails"), &["address", "email"])
        .into_iter()
        .chain(strings(body.get("email_addresses"), &["address", "email"]))
        .collect();

    ParsedContacts { phones, emails }
}
