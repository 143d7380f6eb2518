//! HTTP response records

use serde::{Deserialize, Serialize};

use super::Headers;

/// An HTTP response read from an origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,

    /// Reason phrase (e.g., "OK", "Not Found")
    pub reason: String,

    /// HTTP version from the status line
    pub version: String,

    /// Response headers in wire order
    pub headers: Headers,

    /// Raw response body, de-chunked
    pub body: Vec<u8>,

    /// Time from dispatch to the last body byte, in milliseconds
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
