//! Intruder module - concurrent payload attacks
//!
//! Substitutes payloads into marked positions of a base request and replays
//! the resulting variations against the target with a bounded worker pool.

mod engine;
mod payloads;
mod results;

pub use engine::{AttackConfig, AttackHandle, AttackSnapshot, Intruder};
pub use payloads::{generate, PayloadPosition, PayloadSet, PositionLocation, Variation};
pub use results::AttackResult;

use serde::{Deserialize, Serialize};

/// Payload combination strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackMode {
    /// One position at a time, every payload in turn
    #[default]
    Sniper,
    /// Same payload in every position
    BatteringRam,
    /// Sets advance in lockstep, one per position
    Pitchfork,
    /// Every combination across sets
    ClusterBomb,
}

impl AttackMode {
    pub fn all() -> &'static [AttackMode] {
        &[
            AttackMode::Sniper,
            AttackMode::BatteringRam,
            AttackMode::Pitchfork,
            AttackMode::ClusterBomb,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AttackMode::Sniper => "Sniper",
            AttackMode::BatteringRam => "Battering Ram",
            AttackMode::Pitchfork => "Pitchfork",
            AttackMode::ClusterBomb => "Cluster Bomb",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AttackMode::Sniper => "Single position at a time with all payloads",
            AttackMode::BatteringRam => "Same payload to all positions",
            AttackMode::Pitchfork => "Parallel iteration through payload sets",
            AttackMode::ClusterBomb => "All combinations of payloads",
        }
    }
}

/// Attack lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackStatus {
    Running,
    Stopped,
    Completed,
}

impl AttackStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, AttackStatus::Running)
    }
}

/// Progress notification for an attack
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttackProgress {
    pub attack_id: String,
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
}
