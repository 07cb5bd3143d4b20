//! Focus groups: the single active investigation, the queue of unrelated
//! issues waiting their turn, and the fix attempts made against each group.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::control::Service;
use crate::detect::{Issue, Severity};

pub use self::store::{FocusGroupStore, IssueStats, StoreSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no focus group is active")]
    NoActiveGroup,
    #[error("focus group {0} has no pending fix attempt")]
    NoPendingAttempt(Uuid),
}

/// Result of handing an issue to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    NewFocusGroup,
    AddedToGroup,
    Queued,
    Duplicate,
}

impl AddOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOutcome::NewFocusGroup => "new_focus_group",
            AddOutcome::AddedToGroup => "added_to_group",
            AddOutcome::Queued => "queued",
            AddOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixResult {
    Pending,
    Success,
    Failed,
}

impl FixResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixResult::Pending => "pending",
            FixResult::Success => "success",
            FixResult::Failed => "failed",
        }
    }
}

/// One attempt to resolve a focus group's root issue. Append-only per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    pub id: Uuid,
    pub fix_description: String,
    pub required_restarts: Vec<Service>,
    pub result: FixResult,
    pub failure_reason: Option<String>,
    pub new_logs: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub concluded_at: Option<DateTime<Utc>>,
}

impl FixAttempt {
    pub fn new(fix_description: impl Into<String>, required_restarts: Vec<Service>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fix_description: fix_description.into(),
            required_restarts,
            result: FixResult::Pending,
            failure_reason: None,
            new_logs: Vec::new(),
            submitted_at: now,
            concluded_at: None,
        }
    }
}

/// The active investigation: a root issue plus correlated issues, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusGroup {
    pub id: Uuid,
    pub root_issue: Issue,
    pub related_issues: Vec<Issue>,
    pub started_at: DateTime<Utc>,
    pub fix_attempts: Vec<FixAttempt>,
    pub last_updated: DateTime<Utc>,
}

impl FocusGroup {
    pub fn new(root_issue: Issue, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            root_issue,
            related_issues: Vec::new(),
            started_at: now,
            fix_attempts: Vec::new(),
            last_updated: now,
        }
    }

    /// Root first, then related issues in insertion order.
    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        std::iter::once(&self.root_issue).chain(self.related_issues.iter())
    }

    /// Highest severity anywhere in the group.
    pub fn highest_severity(&self) -> Severity {
        self.issues()
            .map(|i| i.severity)
            .max()
            .unwrap_or(self.root_issue.severity)
    }

    pub fn failed_attempts(&self) -> usize {
        self.fix_attempts
            .iter()
            .filter(|a| a.result == FixResult::Failed)
            .count()
    }

    pub fn pending_attempt(&self) -> Option<&FixAttempt> {
        self.fix_attempts.iter().rev().find(|a| a.result == FixResult::Pending)
    }

    fn pending_attempt_mut(&mut self) -> Option<&mut FixAttempt> {
        self.fix_attempts.iter_mut().rev().find(|a| a.result == FixResult::Pending)
    }
}

/// A concluded fix attempt, kept for the status snapshot after its group closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOutcome {
    pub focus_group_id: Uuid,
    pub issue_type: String,
    pub fix_description: String,
    pub result: FixResult,
    pub failure_reason: Option<String>,
    pub concluded_at: DateTime<Utc>,
}
