//! Proxy server implementation
//!
//! Every accepted connection runs as its own task. A connection is either a
//! CONNECT tunnel (decrypted with a minted leaf, or piped raw when the host is
//! excluded), a plain HTTP proxy connection, or a WebSocket upgrade on one of
//! those. Excluded traffic is never recorded or held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use url::Url;

use super::exchange::{Exchange, ExchangeResponse, ExchangeState};
use super::history::RecordStore;
use super::intercept::{InterceptAction, InterceptManager};
use super::tls::CertificateAuthority;
use super::websocket::{self, RelayContext, WebSocketHistory};
use crate::app::config::ProxyConfig;
use crate::app::events::{EventSink, ProxyEvent};
use crate::error::ProxyError;
use crate::http::body::decompress;
use crate::http::wire::{self, RequestHead, ResponseHead};
use crate::http::{authority, origin_form, Body, Headers, HttpClient, HttpRequest};
use crate::rules::{apply_rules, Direction, Record, RuleStore};
use crate::scope::Exclusions;

/// Collaborators shared by the proxy, the operator surface and restarts
#[derive(Clone)]
pub struct ProxyShared {
    pub ca: Arc<CertificateAuthority>,
    pub intercept: Arc<InterceptManager>,
    pub rules: Arc<RuleStore>,
    pub exclusions: Arc<Exclusions>,
    pub store: Arc<dyn RecordStore>,
    pub ws_history: Arc<WebSocketHistory>,
    pub events: EventSink,
    /// Exchange id source; survives restarts so ids stay unique
    pub next_id: Arc<AtomicU64>,
}

/// Proxy status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub address: Option<SocketAddr>,
    pub intercept_enabled: bool,
    pub https_intercept: bool,
    pub pending_requests: usize,
    pub pending_responses: usize,
    pub pending_frames: usize,
    pub active_connections: usize,
}

/// Per-run state handed to every connection task
struct ProxyContext {
    config: ProxyConfig,
    shared: ProxyShared,
    client: HttpClient,
    active: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyContext {
    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct Running {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Intercepting proxy server
pub struct ProxyServer {
    /// Configuration
    config: ProxyConfig,

    shared: ProxyShared,

    /// Open connections of the current run
    active: Arc<AtomicUsize>,

    /// Present while listening
    running: Option<Running>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, shared: ProxyShared) -> Self {
        Self {
            config,
            shared,
            active: Arc::new(AtomicUsize::new(0)),
            running: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Check if proxy is running
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Start the proxy server, returning the bound address
    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }
        let bind = self.config.bind_addr();
        let start_error = |reason: String| ProxyError::StartError {
            addr: bind.clone(),
            reason,
        };

        let ca = self.shared.ca.clone();
        tokio::task::spawn_blocking(move || ca.ensure_root())
            .await
            .map_err(|e| start_error(e.to_string()))?
            .map_err(|e| start_error(e.to_string()))?;

        let client = HttpClient::new(self.config.upstream_timeout(), self.config.max_body_size)
            .map_err(|e| start_error(e.to_string()))?;

        let listener = TcpListener::bind(&bind).await.map_err(|e| start_error(e.to_string()))?;
        let addr = listener.local_addr().map_err(|e| start_error(e.to_string()))?;

        self.shared.intercept.set_enabled(self.config.intercept_enabled);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ProxyContext {
            config: self.config.clone(),
            shared: self.shared.clone(),
            client,
            active: self.active.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
        tracing::info!("Proxy server listening on {}", addr);

        self.running = Some(Running {
            addr,
            shutdown_tx,
            accept_task,
        });
        Ok(addr)
    }

    /// Stop accepting, release everything held, and close connections
    /// that outlive the grace period
    pub async fn stop(&mut self) -> Result<(), ProxyError> {
        let running = self.running.take().ok_or(ProxyError::NotRunning)?;
        let _ = running.shutdown_tx.send(true);
        self.shared.intercept.clear_pending();

        if let Err(e) = running.accept_task.await {
            tracing::warn!("Proxy accept task ended abnormally: {}", e);
        }
        self.shared.intercept.clear_pending();
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Replace the configuration, restarting if currently running
    pub async fn update_config(&mut self, config: ProxyConfig) -> Result<Option<SocketAddr>, ProxyError> {
        let was_running = self.running.is_some();
        if was_running {
            self.stop().await?;
        }
        self.config = config;
        self.shared.intercept.set_enabled(self.config.intercept_enabled);
        if was_running {
            return self.start().await.map(Some);
        }
        Ok(None)
    }

    pub fn status(&self) -> ProxyStatus {
        let intercept = &self.shared.intercept;
        ProxyStatus {
            running: self.is_running(),
            address: self.local_addr(),
            intercept_enabled: intercept.is_enabled(),
            https_intercept: self.config.https_intercept,
            pending_requests: intercept.requests().len(),
            pending_responses: intercept.responses().len(),
            pending_frames: intercept.frames().len(),
            active_connections: self.active.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the open connection count when a task ends or is aborted
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyContext>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Proxy: new connection from {}", peer_addr);
                    stream.set_nodelay(true).ok();
                    let ctx = ctx.clone();
                    connections.spawn(async move {
                        let _guard = ConnectionGuard::new(ctx.active.clone());
                        if let Err(e) = handle_connection(stream, ctx).await {
                            tracing::debug!("Proxy connection from {} ended: {:#}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);

    let grace = ctx.config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::info!("Closing {} connections after grace period", connections.len());
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Handle a single connection
async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> Result<()> {
    let mut conn = BufReader::new(stream);
    let Some(head) = wire::read_request_head(&mut conn).await? else {
        return Ok(());
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(conn, head, ctx).await
    } else {
        serve_http(conn, Some(head), None, ctx).await
    }
}

/// Split `host:port`, tolerating bracketed IPv6
fn split_authority(target: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = match target.strip_prefix('[') {
        Some(rest) => {
            let (host, after) = rest.split_once(']')?;
            (host, after.strip_prefix(':'))
        }
        None => match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (target, None),
        },
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(port) => port.parse().ok()?,
        None => default_port,
    };
    Some((host.to_string(), port))
}

/// Handle CONNECT method (HTTPS tunnel)
async fn handle_connect(mut conn: BufReader<TcpStream>, head: RequestHead, ctx: Arc<ProxyContext>) -> Result<()> {
    let Some((host, port)) = split_authority(&head.target, 443) else {
        conn.get_mut()
            .write_all(&wire::simple_response(400, "Bad Request", "Invalid CONNECT target"))
            .await?;
        return Ok(());
    };

    conn.get_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    if ctx.shared.exclusions.snapshot().excludes_host(&host) || !ctx.config.https_intercept {
        tracing::debug!("Proxy: tunneling {}:{} without interception", host, port);
        return tunnel(conn, &host, port, &ctx).await;
    }

    let leaf = ctx
        .shared
        .ca
        .issue_leaf(&host)
        .await
        .with_context(|| format!("Aborting tunnel to {}", host))?;
    let tls = TlsAcceptor::from(leaf.server_config())
        .accept(conn)
        .await
        .with_context(|| format!("TLS handshake with client for {} failed", host))?;
    tracing::debug!("Proxy: TLS established for {}:{}", host, port);

    serve_http(BufReader::new(tls), None, Some((host, port)), ctx).await
}

/// Pipe bytes both ways until either side closes
async fn tunnel<S>(mut conn: BufReader<S>, host: &str, port: u16, ctx: &ProxyContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = tokio::time::timeout(ctx.config.upstream_timeout(), TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("Timed out connecting to {}:{}", host, port))?
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    Ok(())
}

/// Absolute URL for a request read from a proxy connection. `tls_origin` is
/// the CONNECT target when the stream is a decrypted tunnel.
fn request_url(head: &RequestHead, tls_origin: Option<&(String, u16)>) -> Option<Url> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return Url::parse(&head.target).ok();
    }
    if !head.target.starts_with('/') {
        return None;
    }
    let url = match tls_origin {
        Some((host, 443)) => format!("https://{}{}", bracket(host), head.target),
        Some((host, port)) => format!("https://{}:{}{}", bracket(host), port, head.target),
        None => format!("http://{}{}", head.headers.get("host")?, head.target),
    };
    Url::parse(&url).ok()
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn url_host(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Serve HTTP requests from a client stream until it closes
async fn serve_http<S>(
    mut conn: BufReader<S>,
    mut first: Option<RequestHead>,
    tls_origin: Option<(String, u16)>,
    ctx: Arc<ProxyContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let head = match first.take() {
            Some(head) => head,
            None => {
                if ctx.shutting_down() {
                    return Ok(());
                }
                tokio::select! {
                    head = wire::read_request_head(&mut conn) => match head? {
                        Some(head) => head,
                        None => return Ok(()),
                    },
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        };

        let Some(url) = request_url(&head, tls_origin.as_ref()) else {
            conn.get_mut()
                .write_all(&wire::simple_response(400, "Bad Request", "Invalid request target"))
                .await?;
            return Ok(());
        };
        let host = url_host(&url);
        let excluded = ctx.shared.exclusions.snapshot().excludes(&host, url.as_str());

        if excluded && tls_origin.is_none() {
            return pipe_excluded(conn, head, &url, &ctx).await;
        }
        if websocket::is_websocket_upgrade(&head.headers) {
            return proxy_websocket(conn, head, url, excluded, &ctx).await;
        }

        let kind = wire::request_body_kind(&head.headers);
        let body = match wire::read_body(&mut conn, kind, ctx.config.max_body_size).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Rejecting request body for {}: {}", url, e);
                conn.get_mut()
                    .write_all(&wire::simple_response(413, "Payload Too Large", &e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        let keep_alive = head.keep_alive();
        let reply = handle_exchange(head, url, body, excluded, keep_alive, &ctx).await;
        conn.get_mut().write_all(&reply.bytes).await?;
        conn.get_mut().flush().await?;

        if reply.close {
            return Ok(());
        }
    }
}

/// Forward an excluded plain-HTTP request verbatim and pipe the rest
async fn pipe_excluded<S>(mut conn: BufReader<S>, head: RequestHead, url: &Url, ctx: &ProxyContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = url_host(url);
    let port = url.port_or_known_default().unwrap_or(80);
    tracing::debug!("Proxy: passing through excluded {}", url);

    let mut upstream = tokio::time::timeout(ctx.config.upstream_timeout(), TcpStream::connect((host.as_str(), port)))
        .await
        .with_context(|| format!("Timed out connecting to {}:{}", host, port))?
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    upstream.write_all(&head.encode()).await?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    Ok(())
}

/// Bytes to write back to the client
struct Reply {
    bytes: Vec<u8>,
    close: bool,
}

impl Reply {
    fn bad_gateway(message: &str) -> Self {
        Self {
            bytes: wire::simple_response(502, "Bad Gateway", message),
            close: true,
        }
    }
}

/// Run one request through rules, interception and dispatch
async fn handle_exchange(
    head: RequestHead,
    url: Url,
    body: Vec<u8>,
    excluded: bool,
    keep_alive: bool,
    ctx: &ProxyContext,
) -> Reply {
    let capture_limit = ctx.config.max_capture_size;
    let shared = &ctx.shared;
    let id = ctx.next_id();

    let oversized = body.len() > capture_limit;
    let captured = Body::capture(&body, head.headers.get("content-type"), capture_limit);
    let mut exchange = Exchange::new(id, &head.method, url.as_str(), head.headers.clone(), captured);
    let original_host = exchange.host.clone();
    tracing::debug!("Exchange {}: {} {}", id, exchange.method, exchange.url);

    // Oversized bodies are only partially captured and cannot be rewritten
    if !excluded && !oversized {
        let rules = shared.rules.snapshot();
        if !rules.is_empty() {
            let record = apply_rules(exchange.request_record(), &rules, Direction::Request);
            exchange.apply_request_record(record);
        }
        exchange.advance(ExchangeState::Transformed);

        if shared.intercept.is_enabled() && !ctx.shutting_down() {
            exchange.intercepted = true;
            exchange.advance(ExchangeState::Queued);

            let queue = shared.intercept.requests();
            let ticket = queue.enqueue(id, exchange.clone());
            shared
                .events
                .emit(ProxyEvent::RequestIntercepted(Box::new(exchange.clone())))
                .await;
            let resolution = queue.wait(ticket).await;
            if resolution.timed_out {
                tracing::info!("Exchange {}: no decision, auto-forwarding", id);
            }
            exchange.advance(ExchangeState::Resolved);

            match resolution.action {
                InterceptAction::Forward => {}
                InterceptAction::Drop => {
                    shared.intercept.take_response_mark(id);
                    exchange.advance(ExchangeState::Dropped);
                    finish(&exchange, ctx).await;
                    return Reply::bad_gateway("Request dropped by proxy operator");
                }
                InterceptAction::Modify(overrides) => exchange.apply_request_overrides(overrides),
            }
        }
    }

    let mut request = if oversized {
        HttpRequest {
            method: head.method.clone(),
            url: url.to_string(),
            headers: head.headers.clone(),
            body,
        }
    } else {
        let wire_body = exchange.body.as_bytes().to_vec();
        exchange.headers.sync_content_length(wire_body.len());
        HttpRequest {
            method: exchange.method.clone(),
            url: exchange.url.clone(),
            headers: exchange.headers.clone(),
            body: wire_body,
        }
    };
    if exchange.host != original_host {
        if let Ok(target) = Url::parse(&exchange.url) {
            request.headers.set("Host", authority(&target));
        }
    }

    exchange.advance(ExchangeState::Dispatched);
    let response = match ctx.client.send(&request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Exchange {}: {} {} failed: {}", id, request.method, request.url, e);
            shared.intercept.take_response_mark(id);
            exchange.fail(e.to_string());
            finish_unless_excluded(&exchange, excluded, ctx).await;
            return Reply::bad_gateway(&e.to_string());
        }
    };

    let mut headers = response.headers;
    let wire_body = decompress(&mut headers, response.body);
    let oversized_response = wire_body.len() > capture_limit;
    let mut captured = ExchangeResponse {
        status: response.status,
        reason: response.reason,
        body: Body::capture(&wire_body, headers.get("content-type"), capture_limit),
        headers,
        duration_ms: response.duration_ms,
    };

    let rewritable = !excluded && !oversized_response;
    if rewritable {
        let rules = shared.rules.snapshot();
        if !rules.is_empty() {
            let record = apply_rules(
                Record {
                    url: None,
                    headers: captured.headers,
                    body: captured.body,
                },
                &rules,
                Direction::Response,
            );
            captured.headers = record.headers;
            captured.body = record.body;
        }
    }
    exchange.set_response(captured);

    let marked = shared.intercept.take_response_mark(id);
    if marked && rewritable && !ctx.shutting_down() {
        exchange.advance(ExchangeState::Queued);
        let queue = shared.intercept.responses();
        let ticket = queue.enqueue(id, exchange.clone());
        shared
            .events
            .emit(ProxyEvent::ResponseIntercepted(Box::new(exchange.clone())))
            .await;
        let resolution = queue.wait(ticket).await;
        exchange.advance(ExchangeState::Resolved);

        match resolution.action {
            InterceptAction::Forward => {}
            InterceptAction::Drop => {
                exchange.advance(ExchangeState::Dropped);
                finish(&exchange, ctx).await;
                return Reply::bad_gateway("Response dropped by proxy operator");
            }
            InterceptAction::Modify(overrides) => exchange.apply_response_overrides(overrides),
        }
    }

    let Some(final_response) = exchange.response.as_ref() else {
        return Reply::bad_gateway("Response was lost");
    };
    let body = if oversized_response {
        wire_body
    } else {
        final_response.body.as_bytes().to_vec()
    };
    let head = ResponseHead {
        version: "HTTP/1.1".into(),
        status: final_response.status,
        reason: final_response.reason.clone(),
        headers: client_headers(&request.method, final_response.status, &final_response.headers, body.len(), keep_alive),
    };

    exchange.advance(ExchangeState::Completed);
    finish_unless_excluded(&exchange, excluded, ctx).await;

    let mut bytes = head.encode();
    bytes.extend_from_slice(&body);
    Reply {
        bytes,
        close: !keep_alive,
    }
}

/// Response headers for the client hop: framing recomputed for the
/// de-chunked body and connection handling owned by the proxy
fn client_headers(method: &str, status: u16, headers: &Headers, body_len: usize, keep_alive: bool) -> Headers {
    let mut out = headers.clone();
    for name in ["connection", "keep-alive", "proxy-connection", "transfer-encoding"] {
        out.remove(name);
    }
    let bodyless = wire::response_body_kind(method, status, &Headers::new()) == wire::BodyKind::None;
    if !bodyless {
        out.set("Content-Length", body_len.to_string());
    }
    if !keep_alive {
        out.append("Connection", "close");
    }
    out
}

async fn finish_unless_excluded(exchange: &Exchange, excluded: bool, ctx: &ProxyContext) {
    if !excluded {
        finish(exchange, ctx).await;
    }
}

/// Persist a terminal exchange and notify observers
async fn finish(exchange: &Exchange, ctx: &ProxyContext) {
    ctx.shared.store.save_exchange(exchange);
    ctx.shared
        .events
        .emit(ProxyEvent::ExchangeCompleted(Box::new(exchange.clone())))
        .await;
}

/// Replay an upgrade handshake to the origin and relay frames
async fn proxy_websocket<S>(
    mut conn: BufReader<S>,
    head: RequestHead,
    url: Url,
    excluded: bool,
    ctx: &ProxyContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let secure = url.scheme() == "https";
    let host = url_host(&url);
    let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

    let upstream = match ctx.client.connect(secure, &host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!("WebSocket origin {} unreachable: {}", url, e);
            conn.get_mut()
                .write_all(&wire::simple_response(502, "Bad Gateway", &e.to_string()))
                .await?;
            return Ok(());
        }
    };
    let mut upstream = BufReader::new(upstream);

    // Compressed frames could not be captured, so never negotiate them
    let mut headers = head.headers.clone();
    for name in ["proxy-connection", "proxy-authorization", "sec-websocket-extensions"] {
        headers.remove(name);
    }
    if !headers.contains("host") {
        headers.append("Host", authority(&url));
    }
    let upgrade = RequestHead {
        method: head.method.clone(),
        target: origin_form(&url),
        version: head.version.clone(),
        headers,
    };
    upstream.get_mut().write_all(&upgrade.encode()).await?;
    upstream.get_mut().flush().await?;

    let response = wire::read_response_head(&mut upstream).await?;
    conn.get_mut().write_all(&response.encode()).await?;

    if response.status != 101 {
        let kind = wire::response_body_kind(&head.method, response.status, &response.headers);
        let body = wire::read_body(&mut upstream, kind, ctx.config.max_body_size).await?;
        conn.get_mut().write_all(&body).await?;
        conn.get_mut().flush().await?;
        return Ok(());
    }
    conn.get_mut().flush().await?;

    if excluded {
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        return Ok(());
    }

    let mut ws_url = url.clone();
    let _ = ws_url.set_scheme(if secure { "wss" } else { "ws" });
    let history = ctx.shared.ws_history.clone();
    let session_id = history.create_session(ws_url.as_str(), &host);
    let origin = head.headers.get("origin").map(str::to_string);
    let subprotocol = response.headers.get("sec-websocket-protocol").map(str::to_string);
    history.update_session(session_id, |s| {
        s.origin = origin;
        s.subprotocol = subprotocol;
    });
    tracing::info!("WebSocket session {} opened to {}", session_id, ws_url);

    let relay_ctx = RelayContext {
        session_id,
        interceptable: !ctx.shutting_down(),
        intercept: ctx.shared.intercept.clone(),
        history,
        events: ctx.shared.events.clone(),
    };
    websocket::relay(conn, upstream, relay_ctx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{HistoryFilter, KeyAlgorithm, ProxyHistory, RequestOverrides, ResponseOverrides};
    use crate::proxy::{MessageDirection, WebSocketFrame};
    use crate::rules::{Rule, RuleScope, RuleTarget};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Harness {
        server: ProxyServer,
        shared: ProxyShared,
        history: Arc<ProxyHistory>,
        addr: SocketAddr,
        _dir: tempfile::TempDir,
    }

    async fn harness(configure: impl FnOnce(&mut ProxyConfig)) -> Harness {
        harness_with_events(EventSink::disabled(), configure).await
    }

    async fn harness_with_events(events: EventSink, configure: impl FnOnce(&mut ProxyConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(ProxyHistory::new(100));
        let mut config = ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        };
        configure(&mut config);

        let shared = ProxyShared {
            ca: Arc::new(CertificateAuthority::new(dir.path(), KeyAlgorithm::EcdsaP256)),
            intercept: Arc::new(InterceptManager::new(config.intercept_enabled, config.intercept_timeout())),
            rules: Arc::new(RuleStore::default()),
            exclusions: Arc::new(Exclusions::default()),
            store: history.clone(),
            ws_history: Arc::new(WebSocketHistory::default()),
            events,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        let mut server = ProxyServer::new(config, shared.clone());
        let addr = server.start().await.unwrap();
        Harness {
            server,
            shared,
            history,
            addr,
            _dir: dir,
        }
    }

    /// Origin answering every request with its target, body and selected headers
    async fn echo_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut reader = BufReader::new(sock);
                    let Ok(Some(head)) = wire::read_request_head(&mut reader).await else {
                        return;
                    };
                    let kind = wire::request_body_kind(&head.headers);
                    let body = wire::read_body(&mut reader, kind, 1 << 20).await.unwrap_or_default();
                    let payload = format!(
                        "{} {} token={}",
                        head.target,
                        String::from_utf8_lossy(&body),
                        head.headers.get("x-token").unwrap_or("-")
                    );
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                        payload.len(),
                        payload
                    );
                    let _ = reader.get_mut().write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// Send raw bytes through the proxy and read one response
    async fn send_raw(proxy: SocketAddr, request: String) -> (u16, Headers, String) {
        let stream = TcpStream::connect(proxy).await.unwrap();
        let mut conn = BufReader::new(stream);
        conn.get_mut().write_all(request.as_bytes()).await.unwrap();
        read_response(&mut conn).await
    }

    async fn read_response<R: tokio::io::AsyncBufRead + Unpin>(conn: &mut R) -> (u16, Headers, String) {
        let head = wire::read_response_head(conn).await.unwrap();
        let kind = wire::response_body_kind("GET", head.status, &head.headers);
        let body = wire::read_body(conn, kind, 1 << 20).await.unwrap();
        (head.status, head.headers, String::from_utf8(body).unwrap())
    }

    fn get(origin: SocketAddr, path: &str) -> String {
        format!(
            "GET http://{}{} HTTP/1.1\r\nHost: {}\r\nX-Token: t1\r\nConnection: close\r\n\r\n",
            origin, path, origin
        )
    }

    fn post(origin: SocketAddr, path: &str, body: &str) -> String {
        format!(
            "POST http://{}{} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            origin,
            path,
            origin,
            body.len(),
            body
        )
    }

    /// TLS origin signed by its own CA, answering `secure <target>`
    async fn tls_origin() -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let origin_ca = CertificateAuthority::new(dir.path(), KeyAlgorithm::EcdsaP256);
        origin_ca.ensure_root().unwrap();
        let leaf = origin_ca.issue_leaf("127.0.0.1").await.unwrap();
        let acceptor = TlsAcceptor::from(leaf.server_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(sock).await else {
                        return;
                    };
                    let mut reader = BufReader::new(tls);
                    let Ok(Some(head)) = wire::read_request_head(&mut reader).await else {
                        return;
                    };
                    let payload = format!("secure {}", head.target);
                    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", payload.len(), payload);
                    let _ = reader.get_mut().write_all(response.as_bytes()).await;
                    let _ = reader.get_mut().flush().await;
                });
            }
        });
        (addr, dir)
    }

    /// CONNECT through the proxy and complete TLS trusting only its root
    async fn open_tunnel(
        h: &Harness,
        origin: SocketAddr,
    ) -> BufReader<tokio_rustls::client::TlsStream<TcpStream>> {
        let stream = TcpStream::connect(h.addr).await.unwrap();
        let mut conn = BufReader::new(stream);
        conn.get_mut()
            .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
            .await
            .unwrap();
        let established = wire::read_response_head(&mut conn).await.unwrap();
        assert_eq!(established.status, 200);

        let mut roots = rustls::RootCertStore::empty();
        let root_der = h.shared.ca.export_root(crate::proxy::CertFormat::Der).unwrap();
        roots.add(rustls_pki_types::CertificateDer::from(root_der)).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(crate::http::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls_pki_types::ServerName::try_from("127.0.0.1").unwrap();
        BufReader::new(connector.connect(server_name, conn.into_inner()).await.unwrap())
    }

    /// Origin serving one fixed body under the given Content-Encoding
    async fn encoded_origin(encoding: &'static str, body: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(sock);
                    let Ok(Some(_)) = wire::read_request_head(&mut reader).await else {
                        return;
                    };
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: {}\r\nContent-Length: {}\r\n\r\n",
                        encoding,
                        body.len()
                    );
                    let _ = reader.get_mut().write_all(head.as_bytes()).await;
                    let _ = reader.get_mut().write_all(&body).await;
                });
            }
        });
        addr
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("example.com:80", 443), Some(("example.com".into(), 80)));
        assert_eq!(split_authority("example.com", 443), Some(("example.com".into(), 443)));
        assert_eq!(split_authority("[::1]:8443", 443), Some(("::1".into(), 8443)));
        assert_eq!(split_authority("[::1]", 443), Some(("::1".into(), 443)));
        assert_eq!(split_authority("example.com:https", 443), None);
        assert_eq!(split_authority(":443", 443), None);
    }

    #[test]
    fn test_request_url_forms() {
        let head = |target: &str| RequestHead {
            method: "GET".into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            headers: [("Host".to_string(), "plain.test:8080".to_string())].into_iter().collect(),
        };
        assert_eq!(
            request_url(&head("http://abs.test/a"), None).unwrap().as_str(),
            "http://abs.test/a"
        );
        assert_eq!(
            request_url(&head("/b?c=1"), None).unwrap().as_str(),
            "http://plain.test:8080/b?c=1"
        );
        let tls = ("secure.test".to_string(), 443);
        assert_eq!(request_url(&head("/x"), Some(&tls)).unwrap().as_str(), "https://secure.test/x");
        let tls = ("secure.test".to_string(), 8443);
        assert_eq!(
            request_url(&head("/x"), Some(&tls)).unwrap().as_str(),
            "https://secure.test:8443/x"
        );
        assert!(request_url(&head("*"), None).is_none());
    }

    #[test]
    fn test_client_headers_reframe_body() {
        let mut headers = Headers::new();
        headers.append("Transfer-Encoding", "chunked");
        headers.append("Connection", "keep-alive");
        headers.append("X-Kept", "1");

        let out = client_headers("GET", 200, &headers, 42, false);
        assert!(!out.contains("transfer-encoding"));
        assert_eq!(out.content_length(), Some(42));
        assert_eq!(out.get("connection"), Some("close"));
        assert_eq!(out.get("x-kept"), Some("1"));

        let out = client_headers("HEAD", 200, &headers, 0, true);
        assert!(!out.contains("content-length"));
        assert!(!out.contains("connection"));
    }

    #[tokio::test]
    async fn test_forwards_and_records_plain_http() {
        let origin = echo_origin().await;
        let h = harness(|_| {}).await;

        let (status, headers, body) = send_raw(h.addr, get(origin, "/hello?x=1")).await;
        assert_eq!(status, 200);
        assert_eq!(body, "/hello?x=1  token=t1");
        assert_eq!(headers.get("connection"), Some("close"));

        wait_for(|| h.history.len() == 1).await;
        let recorded = &h.history.query(&HistoryFilter::default())[0];
        assert_eq!(recorded.state, ExchangeState::Completed);
        assert_eq!(recorded.host, "127.0.0.1");
        assert_eq!(recorded.response.as_ref().unwrap().status, 200);
        assert!(!recorded.intercepted);
    }

    #[tokio::test]
    async fn test_keep_alive_serves_multiple_requests() {
        let origin = echo_origin().await;
        let h = harness(|_| {}).await;

        let stream = TcpStream::connect(h.addr).await.unwrap();
        let mut conn = BufReader::new(stream);
        for path in ["/one", "/two"] {
            let request = format!("GET http://{}{} HTTP/1.1\r\nHost: {}\r\n\r\n", origin, path, origin);
            conn.get_mut().write_all(request.as_bytes()).await.unwrap();
            let (status, _, body) = read_response(&mut conn).await;
            assert_eq!(status, 200);
            assert!(body.starts_with(path));
        }
        assert_eq!(h.history.len(), 2);
    }

    #[tokio::test]
    async fn test_rules_rewrite_both_directions() {
        let origin = echo_origin().await;
        let h = harness(|_| {}).await;
        h.shared.rules.save(Rule::literal(RuleTarget::Body, "secret", "redacted")).unwrap();
        h.shared
            .rules
            .save(Rule::literal(RuleTarget::Body, "/login", "/LOGIN").with_scope(RuleScope::Response))
            .unwrap();

        let (status, headers, body) = send_raw(h.addr, post(origin, "/login", "pw=secret")).await;
        assert_eq!(status, 200);
        assert_eq!(body, "/LOGIN pw=redacted token=-");
        assert_eq!(headers.content_length(), Some(body.len()));
    }

    #[tokio::test]
    async fn test_excluded_host_is_piped_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let h = harness(|_| {}).await;
        h.shared.exclusions.add_host("127.0.0.1");

        let request = format!(
            "GET http://{}/raw HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\nX-Odd-Case: Value\r\n\r\n",
            origin, origin
        );
        let (status, _, body) = send_raw(h.addr, request.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");
        assert_eq!(received.await.unwrap(), request);
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_intercept_auto_forwards_unchanged() {
        let origin = echo_origin().await;
        let h = harness(|c| {
            c.intercept_enabled = true;
            c.intercept_timeout_ms = 200;
        })
        .await;

        let (status, _, body) = send_raw(h.addr, get(origin, "/held")).await;
        assert_eq!(status, 200);
        assert_eq!(body, "/held  token=t1");

        let recorded = &h.history.query(&HistoryFilter::default())[0];
        assert!(recorded.intercepted);
        assert!(!recorded.modified);
        assert_eq!(recorded.headers.get("x-token"), Some("t1"));
        assert!(h.shared.intercept.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_gets_bad_gateway() {
        let origin = echo_origin().await;
        let h = harness(|c| c.intercept_enabled = true).await;

        let client = tokio::spawn(send_raw(h.addr, get(origin, "/drop-me")));
        let intercept = h.shared.intercept.clone();
        wait_for(|| intercept.requests().len() == 1).await;

        let held = intercept.requests().list().remove(0);
        assert_eq!(held.item.url, format!("http://{}/drop-me", origin));
        intercept.drop_request(held.id).unwrap();
        assert!(intercept.drop_request(held.id).is_err());

        let (status, _, _) = client.await.unwrap();
        assert_eq!(status, 502);
        wait_for(|| h.history.len() == 1).await;
        assert_eq!(h.history.exchange(held.id).unwrap().state, ExchangeState::Dropped);
    }

    #[tokio::test]
    async fn test_modified_request_reaches_origin() {
        let origin = echo_origin().await;
        let h = harness(|c| c.intercept_enabled = true).await;

        let client = tokio::spawn(send_raw(h.addr, post(origin, "/orig", "a=1")));
        let intercept = h.shared.intercept.clone();
        wait_for(|| intercept.requests().len() == 1).await;

        let id = intercept.requests().list()[0].id;
        intercept
            .modify_request(
                id,
                RequestOverrides {
                    url: Some(format!("http://{}/edited", origin)),
                    body: Some("a=2&b=3".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let (status, _, body) = client.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "/edited a=2&b=3 token=-");
        assert!(h.history.exchange(id).unwrap().modified);
    }

    #[tokio::test]
    async fn test_marked_response_is_held_and_modified() {
        let origin = echo_origin().await;
        let h = harness(|c| c.intercept_enabled = true).await;
        let intercept = h.shared.intercept.clone();

        let client = tokio::spawn(send_raw(h.addr, get(origin, "/resp")));
        wait_for(|| intercept.requests().len() == 1).await;
        let id = intercept.requests().list()[0].id;

        intercept.mark_response(id).unwrap();
        intercept.forward_request(id).unwrap();
        assert_eq!(intercept.mark_response(id), Err(crate::error::IntegrityError::NotPending(id)));

        wait_for(|| intercept.responses().len() == 1).await;
        let held = intercept.responses().get(id).unwrap();
        assert_eq!(held.item.response.as_ref().unwrap().status, 200);
        intercept
            .modify_response(
                id,
                ResponseOverrides {
                    status: Some(418),
                    reason: Some("I'm a teapot".into()),
                    body: Some("short and stout".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let (status, headers, body) = client.await.unwrap();
        assert_eq!(status, 418);
        assert_eq!(body, "short and stout");
        assert_eq!(headers.content_length(), Some(15));
    }

    #[tokio::test]
    async fn test_unreachable_origin_gets_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let h = harness(|_| {}).await;
        let (status, _, body) = send_raw(h.addr, get(dead, "/")).await;
        assert_eq!(status, 502);
        assert!(!body.is_empty());

        let recorded = &h.history.query(&HistoryFilter::default())[0];
        assert_eq!(recorded.state, ExchangeState::Failed);
        assert!(recorded.error.is_some());
    }

    #[tokio::test]
    async fn test_connect_is_decrypted_with_minted_leaf() {
        let (origin, _origin_dir) = tls_origin().await;
        let h = harness(|_| {}).await;

        let mut tls = open_tunnel(&h, origin).await;
        tls.get_mut()
            .write_all(b"GET /inner?q=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let (status, _, body) = read_response(&mut tls).await;
        assert_eq!(status, 200);
        assert_eq!(body, "secure /inner?q=1");

        let recorded = &h.history.query(&HistoryFilter::default())[0];
        assert_eq!(recorded.url, format!("https://{}/inner?q=1", origin));
        assert!(recorded.is_https());
    }

    #[tokio::test]
    async fn test_excluded_prefix_in_tunnel_skips_interception() {
        let (origin, _origin_dir) = tls_origin().await;
        let h = harness(|c| c.intercept_enabled = true).await;
        assert!(h.shared.exclusions.add_url_prefix(&format!("https://{}/static/", origin)));

        let mut tls = open_tunnel(&h, origin).await;
        tls.get_mut()
            .write_all(b"GET /static/app.js HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let (status, _, body) = tokio::time::timeout(Duration::from_secs(5), read_response(&mut tls))
            .await
            .expect("excluded request was held");
        assert_eq!(status, 200);
        assert_eq!(body, "secure /static/app.js");

        assert!(h.shared.intercept.requests().is_empty());
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn test_encoded_responses_reach_client_decoded() {
        use std::io::Write;

        let plain = "compressed payload ".repeat(20);
        let mut gzip = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gzip.write_all(plain.as_bytes()).unwrap();
        let mut br = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut br, 4096, 5, 22);
            w.write_all(plain.as_bytes()).unwrap();
        }

        let h = harness(|_| {}).await;
        for (encoding, encoded) in [("gzip", gzip.finish().unwrap()), ("br", br)] {
            let origin = encoded_origin(encoding, encoded).await;
            let (status, headers, body) = send_raw(h.addr, get(origin, "/packed")).await;
            assert_eq!(status, 200);
            assert_eq!(body, plain, "{}", encoding);
            assert!(!headers.contains("content-encoding"), "{}", encoding);
            assert_eq!(headers.content_length(), Some(plain.len()));
        }

        wait_for(|| h.history.len() == 2).await;
        for recorded in h.history.query(&HistoryFilter::default()) {
            let response = recorded.response.unwrap();
            assert_eq!(response.body.as_text(), Some(plain.as_str()));
            assert!(!response.headers.contains("content-encoding"));
        }
    }

    #[tokio::test]
    async fn test_undrained_observer_does_not_stall_intercept_timeout() {
        let origin = echo_origin().await;
        let (events, _unread) = EventSink::channel(1, 20);
        let h = harness_with_events(events, |c| {
            c.intercept_enabled = true;
            c.intercept_timeout_ms = 200;
        })
        .await;

        for path in ["/first", "/second", "/third"] {
            let (status, _, body) = tokio::time::timeout(Duration::from_secs(3), send_raw(h.addr, get(origin, path)))
                .await
                .expect("held request never auto-forwarded");
            assert_eq!(status, 200);
            assert!(body.starts_with(path));
        }
        assert!(h.shared.intercept.requests().is_empty());
    }

    #[tokio::test]
    async fn test_websocket_upgrade_is_relayed_and_recorded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(sock);
            let head = wire::read_request_head(&mut reader).await.unwrap().unwrap();
            assert!(!head.headers.contains("sec-websocket-extensions"));
            assert_eq!(head.target, "/ws");
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
                .await
                .unwrap();
            let raw = websocket::read_frame(&mut reader).await.unwrap().unwrap();
            let frame = raw.frame.unwrap();
            let echo = WebSocketFrame::text(String::from_utf8(frame.payload).unwrap());
            reader.get_mut().write_all(&echo.encode()).await.unwrap();
            reader.get_mut().flush().await.unwrap();
        });

        let h = harness(|_| {}).await;
        let stream = TcpStream::connect(h.addr).await.unwrap();
        let mut conn = BufReader::new(stream);
        let upgrade = format!(
            "GET http://{}/ws HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
            origin, origin
        );
        conn.get_mut().write_all(upgrade.as_bytes()).await.unwrap();
        let switched = wire::read_response_head(&mut conn).await.unwrap();
        assert_eq!(switched.status, 101);

        let hello = WebSocketFrame::text("hello").with_mask([1, 2, 3, 4]);
        conn.get_mut().write_all(&hello.encode()).await.unwrap();
        let raw = websocket::read_frame(&mut conn).await.unwrap().unwrap();
        assert_eq!(raw.frame.unwrap().payload, b"hello");

        let sessions = h.shared.ws_history.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].url, format!("ws://{}/ws", origin));
        let messages = h.shared.ws_history.session_messages(sessions[0].id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].direction, MessageDirection::ClientToServer);
        assert_eq!(messages[1].payload, "hello");
    }

    #[tokio::test]
    async fn test_stop_releases_held_requests() {
        let origin = echo_origin().await;
        let mut h = harness(|c| c.intercept_enabled = true).await;

        let client = tokio::spawn(send_raw(h.addr, get(origin, "/pending")));
        let intercept = h.shared.intercept.clone();
        wait_for(|| intercept.requests().len() == 1).await;
        assert_eq!(h.server.status().pending_requests, 1);

        h.server.stop().await.unwrap();
        let (status, _, _) = client.await.unwrap();
        assert_eq!(status, 200);

        let status = h.server.status();
        assert!(!status.running);
        assert_eq!(status.active_connections, 0);
        assert!(matches!(h.server.stop().await, Err(ProxyError::NotRunning)));
        assert!(TcpStream::connect(h.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_restarts() {
        let mut h = harness(|_| {}).await;
        let mut config = h.server.config().clone();
        config.intercept_enabled = true;
        let addr = h.server.update_config(config).await.unwrap();
        assert!(addr.is_some());
        assert!(h.server.status().intercept_enabled);
        assert!(h.server.is_running());
        h.server.stop().await.unwrap();
    }
}
