//! HTTP request records

use serde::{Deserialize, Serialize};
use url::Url;

use super::Headers;
use crate::error::TransportError;

/// An HTTP request as it goes over the wire to an origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method
    pub method: String,

    /// Absolute URL (scheme, authority, path and query)
    pub url: String,

    /// Request headers in wire order
    pub headers: Headers,

    /// Raw request body
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse and validate the target URL
    pub fn parsed_url(&self) -> Result<Url, TransportError> {
        let url = Url::parse(&self.url).map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" if url.host_str().is_some() => Ok(url),
            _ => Err(TransportError::InvalidUrl(self.url.clone())),
        }
    }

    /// Host part of the URL, if parseable
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

/// Path and query of a URL in request-target origin form
pub fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Host header value for a URL, omitting default ports
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
