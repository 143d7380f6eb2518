//! Attack execution
//!
//! Every variation is generated up front. A fixed pool of workers then pulls
//! indices from a shared atomic cursor, so each variation is sent exactly
//! once no matter how many workers race for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::payloads::{self, PayloadPosition, PayloadSet, Variation};
use super::results::AttackResult;
use super::{AttackMode, AttackProgress, AttackStatus};
use crate::app::config::IntruderConfig;
use crate::app::events::{EventSink, ProxyEvent};
use crate::error::ValidationError;
use crate::http::{HttpClient, HttpRequest};
use crate::proxy::RecordStore;

/// Parameters for one attack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Base request the payloads are substituted into
    pub template: Option<HttpRequest>,
    pub positions: Vec<PayloadPosition>,
    pub payload_sets: Vec<PayloadSet>,
    #[serde(default)]
    pub mode: AttackMode,
    /// Worker count; the configured default when absent
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Requests per second per worker
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

/// Returned from [`Intruder::start`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackHandle {
    pub attack_id: String,
    pub total_variations: usize,
}

/// Point-in-time view of an attack
#[derive(Debug, Clone, Serialize)]
pub struct AttackSnapshot {
    pub id: String,
    pub mode: AttackMode,
    pub status: AttackStatus,
    pub total: usize,
    pub completed: usize,
    pub started_at: DateTime<Utc>,
    pub results: Vec<AttackResult>,
}

/// Shared state of a running or finished attack
struct Attack {
    id: String,
    mode: AttackMode,
    status: RwLock<AttackStatus>,
    variations: Vec<Variation>,
    cursor: AtomicUsize,
    completed: AtomicUsize,
    results: RwLock<Vec<AttackResult>>,
    started_at: DateTime<Utc>,
}

impl Attack {
    fn status(&self) -> AttackStatus {
        *self.status.read()
    }

    /// Claim the next unsent variation
    fn next_variation(&self) -> Option<&Variation> {
        if self.status() != AttackStatus::Running {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.variations.get(index)
    }

    fn progress(&self, completed: usize) -> AttackProgress {
        let total = self.variations.len();
        AttackProgress {
            attack_id: self.id.clone(),
            completed,
            total,
            percentage: if total == 0 {
                100.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
        }
    }

    fn snapshot(&self) -> AttackSnapshot {
        AttackSnapshot {
            id: self.id.clone(),
            mode: self.mode,
            status: self.status(),
            total: self.variations.len(),
            completed: self.completed.load(Ordering::SeqCst),
            started_at: self.started_at,
            results: self.results.read().clone(),
        }
    }
}

/// Concurrent attack engine
pub struct Intruder {
    client: HttpClient,
    defaults: IntruderConfig,
    store: Arc<dyn RecordStore>,
    events: EventSink,
    attacks: RwLock<HashMap<String, Arc<Attack>>>,
}

impl Intruder {
    pub fn new(client: HttpClient, defaults: IntruderConfig, store: Arc<dyn RecordStore>, events: EventSink) -> Self {
        Self {
            client,
            defaults,
            store,
            events,
            attacks: RwLock::new(HashMap::new()),
        }
    }

    /// Validate, generate every variation and launch the worker pool.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: AttackConfig) -> Result<AttackHandle, ValidationError> {
        let template = config.template.as_ref().ok_or(ValidationError::MissingTemplate)?;
        let variations = payloads::generate(template, &config.positions, &config.payload_sets, config.mode)?;

        let attack = Arc::new(Attack {
            id: uuid::Uuid::new_v4().to_string(),
            mode: config.mode,
            status: RwLock::new(AttackStatus::Running),
            variations,
            cursor: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            results: RwLock::new(Vec::new()),
            started_at: Utc::now(),
        });
        self.attacks.write().insert(attack.id.clone(), attack.clone());

        let total = attack.variations.len();
        let concurrency = config.concurrency.unwrap_or(self.defaults.concurrency).clamp(1, total.max(1));
        let delay = config
            .rate_limit
            .or(self.defaults.rate_limit)
            .filter(|r| *r > 0)
            .map(|r| Duration::from_millis(1000 / r as u64));

        tracing::info!(
            "Starting {} attack {} with {} variations on {} workers",
            attack.mode.name(),
            attack.id,
            total,
            concurrency
        );

        let workers: Vec<_> = (0..concurrency)
            .map(|_| {
                tokio::spawn(worker(
                    attack.clone(),
                    self.client.clone(),
                    self.store.clone(),
                    self.events.clone(),
                    delay,
                ))
            })
            .collect();

        let events = self.events.clone();
        let supervised = attack.clone();
        tokio::spawn(async move {
            for handle in workers {
                if let Err(e) = handle.await {
                    tracing::error!("Attack worker panicked: {}", e);
                }
            }
            let status = {
                let mut status = supervised.status.write();
                if *status == AttackStatus::Running {
                    *status = AttackStatus::Completed;
                }
                *status
            };
            tracing::info!(
                "Attack {} {:?} after {} of {} variations",
                supervised.id,
                status,
                supervised.completed.load(Ordering::SeqCst),
                supervised.variations.len()
            );
            events
                .emit(ProxyEvent::AttackFinished {
                    attack_id: supervised.id.clone(),
                    status,
                })
                .await;
        });

        Ok(AttackHandle {
            attack_id: attack.id.clone(),
            total_variations: total,
        })
    }

    /// Stop handing out variations; in-flight requests still complete
    pub fn stop(&self, attack_id: &str) -> Result<(), ValidationError> {
        let attack = self
            .attacks
            .read()
            .get(attack_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownAttack(attack_id.to_string()))?;

        let mut status = attack.status.write();
        if *status == AttackStatus::Running {
            tracing::info!("Stopping attack {}", attack_id);
            *status = AttackStatus::Stopped;
        }
        Ok(())
    }

    pub fn attack(&self, attack_id: &str) -> Option<AttackSnapshot> {
        self.attacks.read().get(attack_id).map(|a| a.snapshot())
    }

    pub fn list(&self) -> Vec<AttackSnapshot> {
        let mut all: Vec<_> = self.attacks.read().values().map(|a| a.snapshot()).collect();
        all.sort_by_key(|a| a.started_at);
        all
    }
}

async fn worker(
    attack: Arc<Attack>,
    client: HttpClient,
    store: Arc<dyn RecordStore>,
    events: EventSink,
    delay: Option<Duration>,
) {
    while let Some(variation) = attack.next_variation() {
        let start = Instant::now();
        let result = match client.send(&variation.request).await {
            Ok(response) => AttackResult::new(variation).with_response(response, start.elapsed()),
            Err(e) => {
                tracing::debug!("Variation {} of attack {} failed: {}", variation.index, attack.id, e);
                AttackResult::new(variation).with_error(&e, start.elapsed())
            }
        };

        store.save_attack_result(&attack.id, &result);
        attack.results.write().push(result);
        let completed = attack.completed.fetch_add(1, Ordering::SeqCst) + 1;
        events.emit(ProxyEvent::AttackProgress(attack.progress(completed))).await;

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}
