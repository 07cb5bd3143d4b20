//! Investigation state: the single owned phase + start time, and the values the
//! state machine hands back to its caller (transitions and commands).

pub mod machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::control::{PauseRequest, ResumeRequest, Service};
use crate::detect::IssueSignature;
use crate::focus::{AddOutcome, FixAttempt};

pub use self::machine::Investigator;

/// Warnings kept for the status snapshot.
pub const WARNING_RING: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Monitoring,
    Investigating,
    Paused,
    Verifying,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Monitoring => "monitoring",
            Phase::Investigating => "investigating",
            Phase::Paused => "paused",
            Phase::Verifying => "verifying",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitoring" => Ok(Phase::Monitoring),
            "investigating" => Ok(Phase::Investigating),
            "paused" => Ok(Phase::Paused),
            "verifying" => Ok(Phase::Verifying),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationSettings {
    pub enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for InvestigationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 15,
        }
    }
}

/// The timed window after a fix is accepted.
///
/// Unarmed while restarts and the readiness gate run; regression matching and
/// the period countdown start only once armed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationWindow {
    pub focus_group_id: Uuid,
    pub pattern: IssueSignature,
    pub period_seconds: u64,
    pub required_restarts: Vec<Service>,
    pub armed: bool,
    pub accepted_at: DateTime<Utc>,
}

/// Phase plus its one authoritative start timestamp. Elapsed and remaining
/// times are always derived from `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigationState {
    pub phase: Phase,
    pub start_time: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub verification: Option<VerificationWindow>,
}

impl InvestigationState {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            phase: Phase::Monitoring,
            start_time: None,
            timeout_seconds,
            verification: None,
        }
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.start_time
            .map(|start| (now - start).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Seconds left in the current timed phase, if it has one.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let total = match self.phase {
            Phase::Investigating => self.timeout_seconds,
            Phase::Verifying => match &self.verification {
                Some(w) if w.armed => w.period_seconds,
                _ => return None,
            },
            Phase::Monitoring | Phase::Paused => return None,
        };
        Some(total.saturating_sub(self.elapsed_seconds(now)))
    }
}

/// One phase change, as logged and recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub focus_group_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// Side effects requested by the state machine. Executed by the monitor off
/// the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause(PauseRequest),
    Resume(ResumeRequest),
    Restart {
        focus_group_id: Uuid,
        services: Vec<Service>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// What one call into the state machine changed.
#[derive(Debug, Default)]
pub struct Step {
    pub outcome: Option<AddOutcome>,
    /// The issue matched the verification pattern and failed the fix.
    pub regression: bool,
    pub transitions: Vec<Transition>,
    pub commands: Vec<Command>,
    /// Fix attempts created or concluded, keyed by focus group.
    pub fix_attempts: Vec<(Uuid, FixAttempt)>,
}

impl Step {
    pub fn changed(&self) -> bool {
        self.outcome.is_some()
            || self.regression
            || !self.transitions.is_empty()
            || !self.commands.is_empty()
            || !self.fix_attempts.is_empty()
    }

    pub fn final_phase(&self) -> Option<Phase> {
        self.transitions.last().map(|t| t.to)
    }
}
