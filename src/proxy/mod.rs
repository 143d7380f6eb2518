//! Intercepting proxy module
//!
//! Provides the HTTP/HTTPS/WebSocket man-in-the-middle proxy: the
//! connection tunnel, the on-the-fly certificate authority, the intercept
//! queues and the captured traffic history.

mod exchange;
mod history;
mod intercept;
mod server;
mod tls;
pub mod websocket;

pub use exchange::{Exchange, ExchangeId, ExchangeResponse, ExchangeState, RequestOverrides, ResponseOverrides};
pub use history::{HistoryFilter, ProxyHistory, RecordStore};
pub use intercept::{HeldItem, InterceptAction, InterceptManager, InterceptQueue, Resolution, Ticket};
pub use server::{ProxyServer, ProxyShared, ProxyStatus};
pub use tls::{CaInfo, CertFormat, CertificateAuthority, CertificateEntry, KeyAlgorithm};
pub use websocket::{
    InterceptedFrame, MessageDirection, MessageType, WebSocketFrame, WebSocketHistory, WebSocketMessage,
    WebSocketSession,
};
