//! Attack result records

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payloads::Variation;
use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse};

/// Outcome of sending one variation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackResult {
    /// Variation index within the attack
    pub index: usize,
    /// Payload per position; `None` where the original text was kept
    pub payloads: Vec<Option<String>>,
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    /// Transport error if the request failed
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AttackResult {
    pub fn new(variation: &Variation) -> Self {
        Self {
            index: variation.index,
            payloads: variation.payloads.clone(),
            request: variation.request.clone(),
            response: None,
            error: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_response(mut self, response: HttpResponse, elapsed: Duration) -> Self {
        self.response = Some(response);
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_error(mut self, error: &TransportError, elapsed: Duration) -> Self {
        self.error = Some(error.to_string());
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    pub fn response_length(&self) -> usize {
        self.response.as_ref().map(|r| r.body.len()).unwrap_or(0)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
