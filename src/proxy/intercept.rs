//! Request, response and frame interception
//!
//! Each queue maps an id to a held item plus a single-shot channel back to
//! the connection flow that is waiting on it. Exactly one of an operator
//! resolution or the timeout delivers the outcome: whichever removes the
//! entry from the map under the lock wins. A flow that goes away while its
//! item is held takes the entry with it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::exchange::{Exchange, RequestOverrides, ResponseOverrides};
use super::websocket::InterceptedFrame;
use crate::error::IntegrityError;

/// Operator decision for a held item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "overrides", rename_all = "lowercase")]
pub enum InterceptAction<M> {
    /// Continue unchanged
    Forward,
    /// Abandon; the client gets a 502
    Drop,
    /// Continue with edits applied
    Modify(M),
}

/// Outcome delivered to a waiting flow
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<M> {
    pub action: InterceptAction<M>,
    /// No decision arrived before the timeout
    pub timed_out: bool,
}

struct Pending<T, M> {
    item: T,
    created_at: DateTime<Utc>,
    /// Distinguishes re-enqueues under the same id
    seq: u64,
    tx: oneshot::Sender<InterceptAction<M>>,
}

type PendingMap<T, M> = Mutex<HashMap<u64, Pending<T, M>>>;

/// Receiving half handed to the flow that enqueued an item.
///
/// Dropping it withdraws the item if it is still held.
pub struct Ticket<T, M> {
    id: u64,
    seq: u64,
    rx: oneshot::Receiver<InterceptAction<M>>,
    pending: Weak<PendingMap<T, M>>,
}

impl<T, M> Ticket<T, M> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T, M> Drop for Ticket<T, M> {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        let withdrawn = {
            let mut pending = pending.lock();
            let ours = pending.get(&self.id).map(|p| p.seq == self.seq).unwrap_or(false);
            if ours {
                pending.remove(&self.id)
            } else {
                None
            }
        };
        if withdrawn.is_some() {
            tracing::debug!("Intercept {} abandoned by its connection", self.id);
        }
    }
}

/// A held item as seen by the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeldItem<T> {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub item: T,
}

/// Pending items awaiting a decision, with auto-forward after `timeout`
pub struct InterceptQueue<T, M> {
    pending: Arc<PendingMap<T, M>>,
    next_seq: AtomicU64,
    timeout: Duration,
}

impl<T: Clone, M> InterceptQueue<T, M> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hold `item` under `id`. A previous entry with the same id is forwarded.
    pub fn enqueue(&self, id: u64, item: T) -> Ticket<T, M> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.lock().insert(
            id,
            Pending {
                item,
                created_at: Utc::now(),
                seq,
                tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.tx.send(InterceptAction::Forward);
        }
        Ticket {
            id,
            seq,
            rx,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Suspend until the item is resolved or the timeout elapses
    pub async fn wait(&self, mut ticket: Ticket<T, M>) -> Resolution<M> {
        let id = ticket.id;

        match tokio::time::timeout(self.timeout, &mut ticket.rx).await {
            Ok(Ok(action)) => Resolution {
                action,
                timed_out: false,
            },
            // Sender dropped without a decision
            Ok(Err(_)) => Resolution {
                action: InterceptAction::Forward,
                timed_out: false,
            },
            Err(_) => {
                let expired = self.pending.lock().remove(&id).is_some();
                if expired {
                    tracing::info!("Intercept {} timed out, forwarding", id);
                    return Resolution {
                        action: InterceptAction::Forward,
                        timed_out: true,
                    };
                }

                // A resolution won the race and is already in the channel
                Resolution {
                    action: (&mut ticket.rx).await.unwrap_or(InterceptAction::Forward),
                    timed_out: false,
                }
            }
        }
    }

    /// Deliver a decision. Fails if `id` is unknown or already resolved.
    pub fn resolve(&self, id: u64, action: InterceptAction<M>) -> Result<(), IntegrityError> {
        let pending = self
            .pending
            .lock()
            .remove(&id)
            .ok_or(IntegrityError::NotPending(id))?;

        // The waiter may have gone away with its connection
        let _ = pending.tx.send(action);
        Ok(())
    }

    /// Run `f` on a pending item while holding the queue lock
    pub fn with_pending<R>(&self, id: u64, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.pending.lock().get(&id).map(|p| f(&p.item))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<HeldItem<T>> {
        self.pending.lock().get(&id).map(|p| HeldItem {
            id,
            created_at: p.created_at,
            item: p.item.clone(),
        })
    }

    /// Snapshot of held items, oldest first
    pub fn list(&self) -> Vec<HeldItem<T>> {
        let pending = self.pending.lock();
        let mut items: Vec<_> = pending
            .iter()
            .map(|(id, p)| HeldItem {
                id: *id,
                created_at: p.created_at,
                item: p.item.clone(),
            })
            .collect();
        items.sort_by_key(|h| (h.created_at, h.id));
        items
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Forward everything currently held. Returns how many were released.
    pub fn clear_pending(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.tx.send(InterceptAction::Forward);
        }
        count
    }
}

/// Interception state shared between the proxy and its operator
pub struct InterceptManager {
    /// Global intercept enabled
    enabled: AtomicBool,

    /// Held requests
    requests: InterceptQueue<Exchange, RequestOverrides>,

    /// Held responses
    responses: InterceptQueue<Exchange, ResponseOverrides>,

    /// Held WebSocket frames; modify carries replacement text
    frames: InterceptQueue<InterceptedFrame, String>,

    /// Requests whose response the operator wants to see
    response_marks: Mutex<HashSet<u64>>,
}

impl InterceptManager {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            requests: InterceptQueue::new(timeout),
            responses: InterceptQueue::new(timeout),
            frames: InterceptQueue::new(timeout),
            response_marks: Mutex::new(HashSet::new()),
        }
    }

    /// Enable/disable global interception
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> &InterceptQueue<Exchange, RequestOverrides> {
        &self.requests
    }

    pub fn responses(&self) -> &InterceptQueue<Exchange, ResponseOverrides> {
        &self.responses
    }

    pub fn frames(&self) -> &InterceptQueue<InterceptedFrame, String> {
        &self.frames
    }

    pub fn forward_request(&self, id: u64) -> Result<(), IntegrityError> {
        self.requests.resolve(id, InterceptAction::Forward)
    }

    pub fn drop_request(&self, id: u64) -> Result<(), IntegrityError> {
        self.response_marks.lock().remove(&id);
        self.requests.resolve(id, InterceptAction::Drop)
    }

    pub fn modify_request(&self, id: u64, overrides: RequestOverrides) -> Result<(), IntegrityError> {
        self.requests.resolve(id, InterceptAction::Modify(overrides))
    }

    /// Ask to hold the response of a request that is still held.
    ///
    /// The mark is taken under the request queue lock, so it is always
    /// visible by the time the request is resolved.
    pub fn mark_response(&self, id: u64) -> Result<(), IntegrityError> {
        self.requests
            .with_pending(id, |_| {
                self.response_marks.lock().insert(id);
            })
            .ok_or(IntegrityError::NotPending(id))
    }

    /// Consume the response mark for `id`
    pub fn take_response_mark(&self, id: u64) -> bool {
        self.response_marks.lock().remove(&id)
    }

    pub fn forward_response(&self, id: u64) -> Result<(), IntegrityError> {
        self.responses.resolve(id, InterceptAction::Forward)
    }

    pub fn drop_response(&self, id: u64) -> Result<(), IntegrityError> {
        self.responses.resolve(id, InterceptAction::Drop)
    }

    pub fn modify_response(&self, id: u64, overrides: ResponseOverrides) -> Result<(), IntegrityError> {
        self.responses.resolve(id, InterceptAction::Modify(overrides))
    }

    pub fn forward_frame(&self, id: u64) -> Result<(), IntegrityError> {
        self.frames.resolve(id, InterceptAction::Forward)
    }

    pub fn drop_frame(&self, id: u64) -> Result<(), IntegrityError> {
        self.frames.resolve(id, InterceptAction::Drop)
    }

    pub fn modify_frame(&self, id: u64, text: String) -> Result<(), IntegrityError> {
        self.frames.resolve(id, InterceptAction::Modify(text))
    }

    /// Force-forward everything held in every queue
    pub fn clear_pending(&self) -> usize {
        self.response_marks.lock().clear();
        let released = self.requests.clear_pending() + self.responses.clear_pending() + self.frames.clear_pending();
        if released > 0 {
            tracing::info!("Released {} held items", released);
        }
        released
    }
}
