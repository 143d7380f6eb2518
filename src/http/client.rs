//! Origin HTTP client
//!
//! The single request primitive shared by the proxy tunnel and the intruder.
//! It speaks raw HTTP/1.1 so that headers reach the origin in the order and
//! casing the operator left them, and it never rejects an origin certificate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::request::{authority, origin_form};
use super::wire::{self, RequestHead};
use super::{Headers, HttpRequest, HttpResponse};
use crate::error::TransportError;

/// Headers that only describe the client-to-proxy hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Any bidirectional byte stream to an origin
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Boxed origin connection, plain TCP or TLS
pub type BoxedIo = Box<dyn Io>;

/// The ring provider used for every TLS config in the process
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// HTTP client for origin requests
#[derive(Clone)]
pub struct HttpClient {
    /// TLS connector with verification disabled
    tls: TlsConnector,

    /// Whole-request timeout
    timeout: Duration,

    /// Largest response body accepted
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(timeout: Duration, max_response_size: usize) -> Result<Self, TransportError> {
        let provider = crypto_provider();
        let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls {
                target: "client".into(),
                reason: e.to_string(),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();

        // HTTP/2 is never negotiated upstream
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            timeout,
            max_response_size,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a connection to an origin, wrapping it in TLS for secure schemes
    pub async fn connect(&self, secure: bool, host: &str, port: u16) -> Result<BoxedIo, TransportError> {
        let target = format!("{}:{}", host, port);
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| TransportError::Connect {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        if !secure {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(host.to_string()).map_err(|e| TransportError::Tls {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls {
                target,
                reason: e.to_string(),
            })?;
        Ok(Box::new(tls))
    }

    /// Send a request and read the whole response
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match tokio::time::timeout(self.timeout, self.send_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn send_inner(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.parsed_url()?;
        let secure = matches!(url.scheme(), "https" | "wss");
        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidUrl(request.url.clone()))?;

        let head = RequestHead {
            method: request.method.clone(),
            target: origin_form(&url),
            version: "HTTP/1.1".into(),
            headers: upstream_headers(&request.headers, &authority(&url), request.body.len()),
        };

        tracing::debug!("Dispatching {} {}", request.method, request.url);
        let start = Instant::now();

        let stream = self.connect(secure, &host, port).await?;
        let mut stream = BufReader::new(stream);
        stream.get_mut().write_all(&head.encode()).await?;
        if !request.body.is_empty() {
            stream.get_mut().write_all(&request.body).await?;
        }
        stream.get_mut().flush().await?;

        let response_head = wire::read_response_head(&mut stream).await?;
        let kind = wire::response_body_kind(&request.method, response_head.status, &response_head.headers);
        let body = wire::read_body(&mut stream, kind, self.max_response_size).await?;

        Ok(HttpResponse {
            status: response_head.status,
            reason: response_head.reason,
            version: response_head.version,
            headers: response_head.headers,
            body,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Headers for the origin hop: hop-by-hop fields dropped, Host ensured,
/// framing recomputed and the connection closed after the response
fn upstream_headers(headers: &Headers, host: &str, body_len: usize) -> Headers {
    let mut out: Headers = headers
        .iter()
        .filter(|(k, _)| !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if !out.contains("host") {
        out.append("Host", host);
    }
    if body_len > 0 || out.contains("content-length") {
        out.set("Content-Length", body_len.to_string());
    }
    out.append("Connection", "close");
    out
}

/// Certificate verifier that accepts whatever the origin presents
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_upstream_headers() {
        let mut headers = Headers::new();
        headers.append("Proxy-Connection", "keep-alive");
        headers.append("X-Api-Key", "k");
        headers.append("Connection", "keep-alive");

        let out = upstream_headers(&headers, "example.com", 4);
        assert!(!out.contains("proxy-connection"));
        assert_eq!(out.get("host"), Some("example.com"));
        assert_eq!(out.get("content-length"), Some("4"));
        assert_eq!(out.get("connection"), Some("close"));
        assert_eq!(out.iter().next(), Some(("X-Api-Key", "k")));
    }

    #[tokio::test]
    async fn test_send_reads_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.starts_with("GET /ping?x=1 HTTP/1.1\r\n"));
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                .await
                .unwrap();
        });

        let client = HttpClient::new(Duration::from_secs(5), 1024).unwrap();
        let resp = client
            .send(&HttpRequest::new("GET", &format!("http://{}/ping?x=1", addr)))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"pong");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new(Duration::from_secs(5), 1024).unwrap();
        let err = client
            .send(&HttpRequest::new("GET", &format!("http://{}/", addr)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
