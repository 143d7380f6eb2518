//! Exchange records and their lifecycle
//!
//! An exchange is created when a request arrives and moves through an
//! explicit state machine until it is completed, dropped or failed. The
//! response is attached exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::{Body, Headers};
use crate::rules::Record;

/// Exchange identifier, unique per proxy process
pub type ExchangeId = u64;

/// Lifecycle of one request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeState {
    /// Request captured from the client
    Received,
    /// Match & replace applied
    Transformed,
    /// Waiting in an intercept queue
    Queued,
    /// Operator decision (or timeout) delivered
    Resolved,
    /// Sent to the origin
    Dispatched,
    /// Response delivered to the client
    Completed,
    /// Dropped by the operator
    Dropped,
    /// Origin could not be reached
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dropped | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_advance(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Dropped | Failed) => true,
            (Received, Transformed | Queued | Dispatched) => true,
            (Transformed, Queued | Dispatched) => true,
            (Queued, Resolved) => true,
            (Resolved, Dispatched | Queued | Completed) => true,
            (Dispatched, Transformed | Queued | Completed) => true,
            _ => false,
        }
    }
}

/// Response half of an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Body,
    pub duration_ms: u64,
}

/// A captured request with its eventual response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub method: String,
    pub url: String,
    pub host: String,
    pub headers: Headers,
    pub body: Body,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: Option<ExchangeResponse>,
    pub state: ExchangeState,

    /// Held in an intercept queue at some point
    pub intercepted: bool,

    /// Changed by the operator
    pub modified: bool,

    /// Dispatch failure message
    pub error: Option<String>,
}

impl Exchange {
    pub fn new(id: ExchangeId, method: &str, url: &str, headers: Headers, body: Body) -> Self {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            id,
            method: method.to_string(),
            url: url.to_string(),
            host,
            headers,
            body,
            started_at: Utc::now(),
            completed_at: None,
            response: None,
            state: ExchangeState::Received,
            intercepted: false,
            modified: false,
            error: None,
        }
    }

    pub fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// Move to `next`, refusing illegal transitions
    pub fn advance(&mut self, next: ExchangeState) -> bool {
        if !self.state.can_advance(next) {
            tracing::debug!("Exchange {}: ignoring {:?} -> {:?}", self.id, self.state, next);
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Attach the origin response. Only the first call has any effect.
    pub fn set_response(&mut self, response: ExchangeResponse) -> bool {
        if self.response.is_some() || self.state.is_terminal() {
            return false;
        }
        self.response = Some(response);
        true
    }

    /// Record a dispatch failure
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.advance(ExchangeState::Failed) {
            self.error = Some(error.into());
        }
    }

    /// Request view consumed by the match & replace engine
    pub fn request_record(&self) -> Record {
        Record {
            url: Some(self.url.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Take back a transformed request view
    pub fn apply_request_record(&mut self, record: Record) {
        if let Some(url) = record.url {
            if url != self.url {
                self.host = url::Url::parse(&url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| self.host.clone());
                self.url = url;
            }
        }
        self.headers = record.headers;
        self.body = record.body;
    }

    /// Apply operator edits to the request
    pub fn apply_request_overrides(&mut self, overrides: RequestOverrides) {
        if let Some(method) = overrides.method {
            self.method = method;
        }
        if let Some(url) = overrides.url {
            self.apply_request_record(Record {
                url: Some(url),
                headers: self.headers.clone(),
                body: self.body.clone(),
            });
        }
        if let Some(headers) = overrides.headers {
            self.headers = headers;
        }
        if let Some(body) = overrides.body {
            self.body = Body::text(body);
        }
        self.modified = true;
    }

    /// Apply operator edits to the response
    pub fn apply_response_overrides(&mut self, overrides: ResponseOverrides) {
        let Some(response) = self.response.as_mut() else {
            return;
        };
        if let Some(status) = overrides.status {
            response.status = status;
        }
        if let Some(reason) = overrides.reason {
            response.reason = reason;
        }
        if let Some(headers) = overrides.headers {
            response.headers = headers;
        }
        if let Some(body) = overrides.body {
            response.body = Body::text(body);
        }

        // The edited body is neither encoded nor pre-sized
        response.headers.remove("content-encoding");
        response.headers.remove("content-length");
        self.modified = true;
    }
}

/// Operator edits to a held request. Absent fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOverrides {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<String>,
}

/// Operator edits to a held response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseOverrides {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> Exchange {
        let mut headers = Headers::new();
        headers.append("Host", "example.com");
        Exchange::new(1, "GET", "https://example.com/a?b=1", headers, Body::default())
    }

    fn response() -> ExchangeResponse {
        let mut headers = Headers::new();
        headers.append("Content-Encoding", "gzip");
        headers.append("Content-Length", "10");
        ExchangeResponse {
            status: 200,
            reason: "OK".into(),
            headers,
            body: Body::text("hello"),
            duration_ms: 3,
        }
    }

    #[test]
    fn test_new_parses_host() {
        let ex = exchange();
        assert_eq!(ex.host, "example.com");
        assert!(ex.is_https());
        assert_eq!(ex.state, ExchangeState::Received);
    }

    #[test]
    fn test_state_machine() {
        let mut ex = exchange();
        assert!(ex.advance(ExchangeState::Transformed));
        assert!(ex.advance(ExchangeState::Queued));
        assert!(!ex.advance(ExchangeState::Completed));
        assert!(ex.advance(ExchangeState::Resolved));
        assert!(ex.advance(ExchangeState::Dispatched));
        assert!(ex.advance(ExchangeState::Completed));
        assert!(ex.completed_at.is_some());

        // Terminal states are final
        assert!(!ex.advance(ExchangeState::Failed));
        assert_eq!(ex.state, ExchangeState::Completed);
    }

    #[test]
    fn test_response_set_once() {
        let mut ex = exchange();
        ex.advance(ExchangeState::Dispatched);
        assert!(ex.set_response(response()));

        let mut second = response();
        second.status = 500;
        assert!(!ex.set_response(second));
        assert_eq!(ex.response.as_ref().unwrap().status, 200);
    }

    #[test]
    fn test_request_overrides() {
        let mut ex = exchange();
        ex.apply_request_overrides(RequestOverrides {
            url: Some("https://other.example/x".into()),
            body: Some("a=1".into()),
            ..Default::default()
        });
        assert_eq!(ex.host, "other.example");
        assert_eq!(ex.method, "GET");
        assert_eq!(ex.body.as_text(), Some("a=1"));
        assert!(ex.modified);
    }

    #[test]
    fn test_response_overrides_strip_encoding() {
        let mut ex = exchange();
        ex.set_response(response());
        ex.apply_response_overrides(ResponseOverrides {
            status: Some(403),
            body: Some("denied".into()),
            ..Default::default()
        });
        let resp = ex.response.unwrap();
        assert_eq!(resp.status, 403);
        assert_eq!(resp.body.as_text(), Some("denied"));
        assert!(!resp.headers.contains("content-encoding"));
        assert!(!resp.headers.contains("content-length"));
    }

    #[test]
    fn test_fail_records_error() {
        let mut ex = exchange();
        ex.fail("connection refused");
        assert_eq!(ex.state, ExchangeState::Failed);
        assert_eq!(ex.error.as_deref(), Some("connection refused"));
    }
}
