//! Admission policy deciding whether a request may be coalesced.

use axum::http::Request;
use serde::{Deserialize, Serialize};

/// Opt-in gate: only requests carrying `header_name: header_value` are
/// coalesced. Everything else passes straight through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoalescePolicy {
    /// Header the client must send.
    pub header_name: String,
    /// Exact value the header must carry.
    pub header_value: String,
}

impl CoalescePolicy {
    /// Creates a policy requiring `name: value`.
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header_name: name.into(),
            header_value: value.into(),
        }
    }

    /// Returns true if both the header name and value are configured.
    pub fn is_enabled(&self) -> bool {
        !self.header_name.is_empty() && !self.header_value.is_empty()
    }

    /// Returns true if `request` should go through the coalescing registry.
    ///
    /// The comparison is exact and case-sensitive. Only the first value of
    /// the header is considered.
    pub fn admits<B>(&self, request: &Request<B>) -> bool {
        if !self.is_enabled() {
            return false;
        }

        request
            .headers()
            .get(self.header_name.as_str())
            .is_some_and(|value| value.as_bytes() == self.header_value.as_bytes())
    }
}
