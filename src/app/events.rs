//! Events pushed to observers
//!
//! The proxy and the intruder report through an [`EventSink`]. Events that
//! need an operator decision are always delivered, without ever making the
//! emitter wait on a slow observer; high-volume notifications are capped per
//! channel and dropped beyond the cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::intruder::{AttackProgress, AttackStatus};
use crate::proxy::{Exchange, WebSocketMessage};

/// Observer-facing events
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// Request held for a decision
    RequestIntercepted(Box<Exchange>),

    /// Response held for a decision
    ResponseIntercepted(Box<Exchange>),

    /// WebSocket message held for a decision
    FrameIntercepted(WebSocketMessage),

    /// Exchange finished and recorded
    ExchangeCompleted(Box<Exchange>),

    /// WebSocket message relayed
    WebSocketMessage(WebSocketMessage),

    /// Attack progress update
    AttackProgress(AttackProgress),

    /// Attack reached a terminal status
    AttackFinished { attack_id: String, status: AttackStatus },

    /// Status message
    Status(String),

    /// Error occurred
    Error(String),
}

/// Logical stream an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Never throttled
    Control,
    History,
    WebSocket,
    Attack,
}

impl ProxyEvent {
    pub fn channel(&self) -> Channel {
        match self {
            ProxyEvent::ExchangeCompleted(_) => Channel::History,
            ProxyEvent::WebSocketMessage(_) => Channel::WebSocket,
            ProxyEvent::AttackProgress(_) => Channel::Attack,
            _ => Channel::Control,
        }
    }
}

/// Fixed one-second window counter per channel
struct Throttle {
    max_per_second: u32,
    windows: Mutex<HashMap<Channel, (Instant, u32)>>,
}

impl Throttle {
    fn allow(&self, channel: Channel) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let (start, count) = windows.entry(channel).or_insert((now, 0));

        if now.duration_since(*start) >= Duration::from_secs(1) {
            *start = now;
            *count = 0;
        }
        if *count >= self.max_per_second {
            return false;
        }
        *count += 1;
        true
    }
}

/// Cloneable handle for emitting events
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProxyEvent>>,
    throttle: Arc<Throttle>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ProxyEvent>, max_per_second: u32) -> Self {
        Self {
            tx: Some(tx),
            throttle: Arc::new(Throttle {
                max_per_second,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            throttle: Arc::new(Throttle {
                max_per_second: 0,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a bounded channel and a sink feeding it
    pub fn channel(capacity: usize, max_per_second: u32) -> (Self, mpsc::Receiver<ProxyEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, max_per_second), rx)
    }

    pub async fn emit(&self, event: ProxyEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        match event.channel() {
            Channel::Control => match tx.try_send(event) {
                Ok(()) => {}
                // Held items start their timeout only after this returns, so
                // a full channel must never park the caller
                Err(mpsc::error::TrySendError::Full(event)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if tx.send(event).await.is_err() {
                            tracing::debug!("Event receiver closed");
                        }
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Event receiver closed");
                }
            },
            channel => {
                if !self.throttle.allow(channel) {
                    tracing::trace!("Throttled {:?} event", channel);
                    return;
                }
                // A slow consumer loses notifications, never blocks traffic
                let _ = tx.try_send(event);
            }
        }
    }
}
