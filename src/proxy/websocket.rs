//! WebSocket Interception Module
//!
//! Frame codec, the bidirectional relay that runs after a successful
//! upgrade, and the session/message history it records into.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::intercept::{InterceptAction, InterceptManager};
use crate::app::events::{EventSink, ProxyEvent};
use crate::error::{DecodeError, TransportError};
use crate::http::Headers;

/// Largest frame payload accepted by the relay
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => return Err(DecodeError::InvalidOpcode(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// One WebSocket frame with its payload unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key, present on client-to-server frames
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl WebSocketFrame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Complete single-frame text or binary message
    pub fn is_message(&self) -> bool {
        self.fin && matches!(self.opcode, Opcode::Text | Opcode::Binary)
    }

    /// Parse one frame from the front of `buf`, returning it with the
    /// number of bytes it occupied
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Incomplete { needed: 2 - buf.len() });
        }

        let fin = buf[0] & 0x80 != 0;
        let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        let (len, mut offset) = match buf[1] & 0x7F {
            126 => {
                require(buf, 4)?;
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                require(buf, 10)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(bytes), 10)
            }
            n => (n as u64, 2),
        };
        if len > MAX_FRAME_PAYLOAD {
            return Err(DecodeError::PayloadTooLarge(len));
        }

        let mask = if masked {
            require(buf, offset + 4)?;
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        let end = offset + len as usize;
        require(buf, end)?;
        let mut payload = buf[offset..end].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok((
            Self {
                fin,
                opcode,
                mask,
                payload,
            },
            end,
        ))
    }

    /// Serialize, masking the payload when a key is set
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        out.push(if self.fin { 0x80 } else { 0 } | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }
}

fn require(buf: &[u8], len: usize) -> Result<(), DecodeError> {
    if buf.len() < len {
        Err(DecodeError::Incomplete { needed: len - buf.len() })
    } else {
        Ok(())
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// A frame as read off the wire
#[derive(Debug)]
pub struct RawFrame {
    /// Exact bytes received, forwarded untouched
    pub bytes: Vec<u8>,
    /// Parsed view, `None` if the frame could not be interpreted
    pub frame: Option<WebSocketFrame>,
}

/// Read one frame. Returns `None` on EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<RawFrame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = vec![0u8; 2];
    match reader.read_exact(&mut bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let extended = match bytes[1] & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask_len = if bytes[1] & 0x80 != 0 { 4 } else { 0 };
    read_more(reader, &mut bytes, extended + mask_len).await?;

    let len = match extended {
        2 => u16::from_be_bytes([bytes[2], bytes[3]]) as u64,
        8 => {
            let mut be = [0u8; 8];
            be.copy_from_slice(&bytes[2..10]);
            u64::from_be_bytes(be)
        }
        _ => (bytes[1] & 0x7F) as u64,
    };
    if len > MAX_FRAME_PAYLOAD {
        return Err(TransportError::Protocol(DecodeError::PayloadTooLarge(len).to_string()));
    }
    read_more(reader, &mut bytes, len as usize).await?;

    let frame = match WebSocketFrame::decode(&bytes) {
        Ok((frame, _)) => Some(frame),
        Err(e) => {
            tracing::debug!("Relaying undecodable frame as opaque bytes: {}", e);
            None
        }
    };
    Ok(Some(RawFrame { bytes, frame }))
}

async fn read_more<R>(reader: &mut R, bytes: &mut Vec<u8>, n: usize) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    if n == 0 {
        return Ok(());
    }
    let start = bytes.len();
    bytes.resize(start + n, 0);
    reader.read_exact(&mut bytes[start..]).await?;
    Ok(())
}

/// Direction of a WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    /// Message from client to server
    ClientToServer,
    /// Message from server to client
    ServerToClient,
}

impl MessageDirection {
    pub fn label(&self) -> &'static str {
        match self {
            MessageDirection::ClientToServer => "Client → Server",
            MessageDirection::ServerToClient => "Server → Client",
        }
    }
}

/// Type of WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl From<Opcode> for MessageType {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Text => MessageType::Text,
            Opcode::Ping => MessageType::Ping,
            Opcode::Pong => MessageType::Pong,
            Opcode::Close => MessageType::Close,
            Opcode::Binary | Opcode::Continuation => MessageType::Binary,
        }
    }
}

/// A captured WebSocket message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    /// Unique message ID
    pub id: u64,
    /// Session ID this message belongs to
    pub session_id: u64,
    /// Message direction
    pub direction: MessageDirection,
    /// Message type
    pub message_type: MessageType,
    /// Message payload (text or hex-encoded binary)
    pub payload: String,
    /// Raw payload size in bytes
    pub size: usize,
    /// Timestamp when message was captured
    pub timestamp: DateTime<Utc>,
    /// Whether payload is hex-encoded binary
    pub is_binary: bool,
    /// Replaced by the operator before forwarding
    pub modified: bool,
}

/// A held frame is presented to the operator as its message
pub type InterceptedFrame = WebSocketMessage;

impl WebSocketMessage {
    pub fn from_frame(frame: &WebSocketFrame, session_id: u64, direction: MessageDirection, id: u64) -> Self {
        let message_type = MessageType::from(frame.opcode);
        let (payload, is_binary) = match message_type {
            MessageType::Text => (String::from_utf8_lossy(&frame.payload).into_owned(), false),
            MessageType::Close if frame.payload.len() >= 2 => {
                let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                let reason = String::from_utf8_lossy(&frame.payload[2..]);
                (format!("{}: {}", code, reason), false)
            }
            MessageType::Close => ("Connection closed".to_string(), false),
            _ => (hex::encode(&frame.payload), true),
        };

        Self {
            id,
            session_id,
            direction,
            message_type,
            payload,
            size: frame.payload.len(),
            timestamp: Utc::now(),
            is_binary,
            modified: false,
        }
    }
}

/// WebSocket session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// A WebSocket connection session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSession {
    /// Unique session ID
    pub id: u64,
    /// WebSocket URL (ws:// or wss://)
    pub url: String,
    /// Host
    pub host: String,
    /// Session state
    pub state: SessionState,
    /// Number of messages sent (client to server)
    pub messages_sent: usize,
    /// Number of messages received (server to client)
    pub messages_received: usize,
    /// Total bytes sent
    pub bytes_sent: usize,
    /// Total bytes received
    pub bytes_received: usize,
    /// Connection start time
    pub started_at: DateTime<Utc>,
    /// Connection end time (if closed)
    pub ended_at: Option<DateTime<Utc>>,
    /// Origin header (if present)
    pub origin: Option<String>,
    /// Subprotocol (if negotiated)
    pub subprotocol: Option<String>,
}

impl WebSocketSession {
    pub fn new(id: u64, url: &str, host: &str) -> Self {
        Self {
            id,
            url: url.to_string(),
            host: host.to_string(),
            state: SessionState::Connecting,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            started_at: Utc::now(),
            ended_at: None,
            origin: None,
            subprotocol: None,
        }
    }

    pub fn mark_open(&mut self) {
        self.state = SessionState::Open;
    }

    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.ended_at = Some(Utc::now());
    }

    fn record(&mut self, direction: MessageDirection, size: usize) {
        match direction {
            MessageDirection::ClientToServer => {
                self.messages_sent += 1;
                self.bytes_sent += size;
            }
            MessageDirection::ServerToClient => {
                self.messages_received += 1;
                self.bytes_received += size;
            }
        }
    }
}

/// WebSocket history manager
pub struct WebSocketHistory {
    sessions: RwLock<VecDeque<WebSocketSession>>,
    messages: RwLock<VecDeque<WebSocketMessage>>,
    max_sessions: usize,
    max_messages: usize,
    next_session_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl Default for WebSocketHistory {
    fn default() -> Self {
        Self::new(100, 10000)
    }
}

impl WebSocketHistory {
    pub fn new(max_sessions: usize, max_messages: usize) -> Self {
        Self {
            sessions: RwLock::new(VecDeque::new()),
            messages: RwLock::new(VecDeque::new()),
            max_sessions,
            max_messages,
            next_session_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Create a new session and return its ID
    pub fn create_session(&self, url: &str, host: &str) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.write();
        sessions.push_back(WebSocketSession::new(id, url, host));
        while sessions.len() > self.max_sessions {
            sessions.pop_front();
        }
        id
    }

    pub fn update_session<F>(&self, session_id: u64, f: F)
    where
        F: FnOnce(&mut WebSocketSession),
    {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            f(session);
        }
    }

    /// Record a frame and return the stored message
    pub fn add_message(&self, frame: &WebSocketFrame, session_id: u64, direction: MessageDirection) -> WebSocketMessage {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = WebSocketMessage::from_frame(frame, session_id, direction, id);

        self.update_session(session_id, |session| session.record(direction, message.size));

        let mut messages = self.messages.write();
        messages.push_back(message.clone());
        while messages.len() > self.max_messages {
            messages.pop_front();
        }
        message
    }

    /// Replace the payload of a stored message after operator edits
    pub fn mark_modified(&self, message_id: u64, payload: &str) {
        let mut messages = self.messages.write();
        if let Some(message) = messages.iter_mut().rev().find(|m| m.id == message_id) {
            message.payload = payload.to_string();
            message.size = payload.len();
            message.message_type = MessageType::Text;
            message.is_binary = false;
            message.modified = true;
        }
    }

    pub fn sessions(&self) -> Vec<WebSocketSession> {
        self.sessions.read().iter().cloned().collect()
    }

    pub fn session(&self, session_id: u64) -> Option<WebSocketSession> {
        self.sessions.read().iter().find(|s| s.id == session_id).cloned()
    }

    pub fn session_messages(&self, session_id: u64) -> Vec<WebSocketMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.state == SessionState::Open)
            .count()
    }
}

/// Check if an HTTP request is a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &Headers) -> bool {
    headers.has_token("connection", "upgrade") && headers.has_token("upgrade", "websocket")
}

/// Shared state for one relayed session
pub struct RelayContext {
    pub session_id: u64,
    /// Frames may be held for the operator (host not excluded)
    pub interceptable: bool,
    pub intercept: Arc<InterceptManager>,
    pub history: Arc<WebSocketHistory>,
    pub events: EventSink,
}

/// Relay frames between an upgraded client and origin until either side
/// closes
pub async fn relay<C, U>(client: C, upstream: U, ctx: RelayContext) -> Result<(), TransportError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    ctx.history.update_session(ctx.session_id, WebSocketSession::mark_open);

    let result = tokio::select! {
        r = pump(client_read, upstream_write, MessageDirection::ClientToServer, &ctx) => r,
        r = pump(upstream_read, client_write, MessageDirection::ServerToClient, &ctx) => r,
    };

    ctx.history.update_session(ctx.session_id, WebSocketSession::mark_closed);
    tracing::debug!("WebSocket session {} closed", ctx.session_id);
    result
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: MessageDirection,
    ctx: &RelayContext,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(raw) = read_frame(&mut reader).await? {
        let mut out = raw.bytes;
        let mut closing = false;

        if let Some(frame) = raw.frame {
            closing = frame.opcode == Opcode::Close;

            // Fragmented messages and control frames pass through uncaptured
            if frame.is_message() {
                let message = ctx.history.add_message(&frame, ctx.session_id, direction);
                ctx.events.emit(ProxyEvent::WebSocketMessage(message.clone())).await;

                if ctx.interceptable && ctx.intercept.is_enabled() {
                    match hold_frame(message, out, direction, ctx).await {
                        Some(bytes) => out = bytes,
                        None => continue,
                    }
                }
            }
        }

        writer.write_all(&out).await?;
        writer.flush().await?;

        if closing {
            break;
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Hold a message for the operator. Returns replacement bytes for a
/// modified frame, the original bytes on forward, or `None` on drop.
async fn hold_frame(
    message: WebSocketMessage,
    original: Vec<u8>,
    direction: MessageDirection,
    ctx: &RelayContext,
) -> Option<Vec<u8>> {
    let id = message.id;
    let frames = ctx.intercept.frames();
    let ticket = frames.enqueue(id, message.clone());
    ctx.events.emit(ProxyEvent::FrameIntercepted(message)).await;

    match frames.wait(ticket).await.action {
        InterceptAction::Forward => Some(original),
        InterceptAction::Drop => {
            tracing::debug!("Dropped WebSocket message {}", id);
            None
        }
        InterceptAction::Modify(text) => {
            ctx.history.mark_modified(id, &text);
            let mut frame = WebSocketFrame::text(text);
            // Client frames must be masked
            if direction == MessageDirection::ClientToServer {
                frame = frame.with_mask(rand::random());
            }
            Some(frame.encode())
        }
    }
}
