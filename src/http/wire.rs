//! HTTP/1.1 message framing over async byte streams
//!
//! Only what the proxy needs: request/response heads, Content-Length and
//! chunked bodies, and read-until-close for legacy responses.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::Headers;
use crate::error::TransportError;

/// Upper bound on the size of a message head
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Serialize exactly as received (modulo line endings)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        push_headers(&mut out, &self.headers);
        out.into_bytes()
    }

    /// Whether the client wants the connection kept open afterwards
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close")
            || self.headers.has_token("proxy-connection", "close")
        {
            return false;
        }
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            return self.headers.has_token("connection", "keep-alive")
                || self.headers.has_token("proxy-connection", "keep-alive");
        }
        true
    }
}

/// Status line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        push_headers(&mut out, &self.headers);
        out.into_bytes()
    }
}

fn push_headers(out: &mut String, headers: &Headers) {
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
}

/// How the length of a message body is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

/// Body framing for a request
pub fn request_body_kind(headers: &Headers) -> BodyKind {
    if headers.is_chunked() {
        BodyKind::Chunked
    } else {
        match headers.content_length() {
            Some(0) | None => BodyKind::None,
            Some(n) => BodyKind::Length(n),
        }
    }
}

/// Body framing for a response to `method`
pub fn response_body_kind(method: &str, status: u16, headers: &Headers) -> BodyKind {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return BodyKind::None;
    }
    if headers.is_chunked() {
        return BodyKind::Chunked;
    }
    match headers.content_length() {
        Some(0) => BodyKind::None,
        Some(n) => BodyKind::Length(n),
        None => BodyKind::UntilClose,
    }
}

/// Read one line terminated by LF, without the line ending
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if n > *budget {
        return Err(TransportError::Protocol("message head too large".into()));
    }
    *budget -= n;
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<Headers, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_line(reader, budget)
            .await?
            .ok_or_else(|| TransportError::Protocol("connection closed inside headers".into()))?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.append(name.trim(), value.trim());
        }
    }
    Ok(headers)
}

/// Read a request head. Returns `None` on a clean EOF before any bytes.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    // Tolerate stray CRLFs between pipelined requests
    let line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(l) if l.trim().is_empty() => continue,
            Some(l) => break l,
        }
    };

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(TransportError::Protocol(format!("invalid request line: {:?}", line)));
    };
    let (method, target, version) = (method.to_string(), target.to_string(), version.to_string());

    let headers = read_headers(reader, &mut budget).await?;
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// Read a response head, skipping interim 1xx responses other than 101
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut budget = MAX_HEAD_BYTES;
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| TransportError::Protocol("origin closed before responding".into()))?;

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status: u16 = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| TransportError::Protocol(format!("invalid status line: {:?}", line)))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let headers = read_headers(reader, &mut budget).await?;
        if (100..200).contains(&status) && status != 101 {
            continue;
        }
        return Ok(ResponseHead {
            version,
            status,
            reason,
            headers,
        });
    }
}

/// Read a body of the given framing, refusing anything larger than `max`
pub async fn read_body<R>(reader: &mut R, kind: BodyKind, max: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let too_large = || TransportError::Protocol(format!("body exceeds {} bytes", max));

    match kind {
        BodyKind::None => Ok(Vec::new()),
        BodyKind::Length(n) => {
            if n > max {
                return Err(too_large());
            }
            let mut body = vec![0u8; n];
            reader.read_exact(&mut body).await?;
            Ok(body)
        }
        BodyKind::UntilClose => {
            let mut body = Vec::new();
            let read = (&mut *reader).take((max as u64).saturating_add(1)).read_to_end(&mut body).await?;
            if read > max {
                return Err(too_large());
            }
            Ok(body)
        }
        BodyKind::Chunked => {
            let mut body = Vec::new();
            loop {
                let mut budget = MAX_HEAD_BYTES;
                let size_line = read_line(reader, &mut budget)
                    .await?
                    .ok_or_else(|| TransportError::Protocol("connection closed inside chunked body".into()))?;
                let size_str = size_line.split(';').next().unwrap_or_default().trim();
                let size = usize::from_str_radix(size_str, 16)
                    .map_err(|_| TransportError::Protocol(format!("invalid chunk size: {:?}", size_line)))?;

                if size == 0 {
                    // Trailers, discarded
                    while let Some(line) = read_line(reader, &mut budget).await? {
                        if line.is_empty() {
                            break;
                        }
                    }
                    break;
                }
                if size > max.saturating_sub(body.len()) {
                    return Err(too_large());
                }

                let start = body.len();
                body.resize(start + size, 0);
                reader.read_exact(&mut body[start..]).await?;
                read_line(reader, &mut budget).await?;
            }
            Ok(body)
        }
    }
}

/// A complete short response generated by the proxy itself
pub fn simple_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Content-Length", message.len().to_string());
    headers.append("Connection", "close");
    let head = ResponseHead {
        version: "HTTP/1.1".into(),
        status,
        reason: reason.into(),
        headers,
    };
    let mut out = head.encode();
    out.extend_from_slice(message.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_head_preserves_order_and_case() {
        let raw = b"\r\nPOST http://example.com/login HTTP/1.1\r\nHost: example.com\r\nX-Token: abc\r\nContent-Length: 3\r\n\r\nxyz";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "http://example.com/login");
        assert_eq!(head.headers.get("x-token"), Some("abc"));
        assert_eq!(request_body_kind(&head.headers), BodyKind::Length(3));

        let body = read_body(&mut reader, BodyKind::Length(3), 1024).await.unwrap();
        assert_eq!(body, b"xyz");

        let encoded = String::from_utf8(head.encode()).unwrap();
        assert!(encoded.starts_with("POST http://example.com/login HTTP/1.1\r\nHost: example.com\r\nX-Token: abc\r\n"));
    }

    #[tokio::test]
    async fn test_eof_before_request_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunked_body_with_trailers() {
        let raw = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let body = read_body(&mut reader, BodyKind::Chunked, 1024).await.unwrap();
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn test_body_limit_enforced() {
        let raw = b"0123456789";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_body(&mut reader, BodyKind::UntilClose, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_chunk_size_rejected() {
        let raw = b"1\r\na\r\nffffffffffffffff\r\nxyz\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_body(&mut reader, BodyKind::Chunked, 1024).await.unwrap_err();
        assert!(matches!(&err, TransportError::Protocol(m) if m.contains("exceeds")), "{:?}", err);
    }

    #[tokio::test]
    async fn test_response_head_skips_continue() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "Not Found");
        assert_eq!(response_body_kind("GET", head.status, &head.headers), BodyKind::None);
    }

    #[test]
    fn test_response_body_kind() {
        let mut headers = Headers::new();
        assert_eq!(response_body_kind("GET", 200, &headers), BodyKind::UntilClose);
        assert_eq!(response_body_kind("HEAD", 200, &headers), BodyKind::None);
        assert_eq!(response_body_kind("GET", 304, &headers), BodyKind::None);
        headers.append("Transfer-Encoding", "gzip, chunked");
        assert_eq!(response_body_kind("GET", 200, &headers), BodyKind::Chunked);
    }

    #[test]
    fn test_keep_alive() {
        let mut head = RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: Headers::new(),
        };
        assert!(head.keep_alive());
        head.headers.append("Connection", "close");
        assert!(!head.keep_alive());
        head.headers = Headers::new();
        head.version = "HTTP/1.0".into();
        assert!(!head.keep_alive());
    }
}
