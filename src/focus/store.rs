//! In-memory focus group store, owned by the investigation state machine and
//! persisted as a JSON document after changes.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AddOutcome, FixAttempt, FixOutcome, FixResult, FocusGroup, StoreError};
use crate::detect::correlate::{self, CorrelationSettings};
use crate::detect::{Issue, Severity, Source};

/// Fix outcomes kept for the status snapshot.
const RECENT_OUTCOMES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub correlation: CorrelationSettings,
    pub duplicate_window_seconds: u64,
    pub failed_attempt_warning: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            correlation: CorrelationSettings::default(),
            duplicate_window_seconds: 300,
            failed_attempt_warning: 5,
        }
    }
}

/// Aggregate counters over every classified issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStats {
    pub total: u64,
    pub duplicates: u64,
    pub queued: u64,
    pub related: u64,
    pub focus_groups_opened: u64,
    pub by_severity: BTreeMap<Severity, u64>,
    pub by_source: BTreeMap<Source, u64>,
}

impl IssueStats {
    fn count(&mut self, issue: &Issue) {
        self.total += 1;
        *self.by_severity.entry(issue.severity).or_default() += 1;
        *self.by_source.entry(issue.source).or_default() += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusGroupStore {
    active: Option<FocusGroup>,
    queue: VecDeque<Issue>,
    /// Accepted issues inside the duplicate window, oldest first.
    recent: VecDeque<Issue>,
    recent_outcomes: VecDeque<FixOutcome>,
    stats: IssueStats,
    #[serde(skip)]
    settings: StoreSettings,
}

impl FocusGroupStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Replace settings, e.g. after loading a persisted store.
    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn active(&self) -> Option<&FocusGroup> {
        self.active.as_ref()
    }

    pub fn queue(&self) -> impl Iterator<Item = &Issue> {
        self.queue.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &IssueStats {
        &self.stats
    }

    pub fn recent_outcomes(&self) -> impl Iterator<Item = &FixOutcome> {
        self.recent_outcomes.iter()
    }

    /// Route a classified issue: open a group, join the active one, queue it,
    /// or drop it as a duplicate.
    pub fn add_issue(&mut self, issue: Issue) -> AddOutcome {
        self.stats.count(&issue);
        self.prune_recent(issue.detected_at);

        let threshold = self.settings.correlation.duplicate_similarity;
        let outcome = match self.active.as_mut() {
            None => {
                let seen = self
                    .recent
                    .iter()
                    .any(|r| r.source == issue.source && correlate::is_duplicate(r, &issue, threshold));
                if seen {
                    AddOutcome::Duplicate
                } else {
                    let group = FocusGroup::new(issue.clone(), issue.detected_at);
                    info!(focus_group = %group.id, issue_type = %issue.issue_type, severity = %issue.severity, "opened focus group");
                    self.active = Some(group);
                    self.stats.focus_groups_opened += 1;
                    AddOutcome::NewFocusGroup
                }
            }
            Some(group) => {
                if group.issues().any(|g| correlate::is_duplicate(g, &issue, threshold)) {
                    AddOutcome::Duplicate
                } else if correlate::relation(&group.root_issue, &issue, &self.settings.correlation).is_some() {
                    group.last_updated = issue.detected_at;
                    group.related_issues.push(issue.clone());
                    self.stats.related += 1;
                    AddOutcome::AddedToGroup
                } else if self.queue.iter().any(|q| correlate::is_duplicate(q, &issue, threshold)) {
                    AddOutcome::Duplicate
                } else {
                    self.queue.push_back(issue.clone());
                    self.stats.queued += 1;
                    AddOutcome::Queued
                }
            }
        };

        match outcome {
            AddOutcome::Duplicate => {
                self.stats.duplicates += 1;
                debug!(issue_type = %issue.issue_type, "duplicate issue suppressed");
            }
            _ => self.recent.push_back(issue),
        }
        outcome
    }

    /// Attach a regression line to the active group (unless it duplicates an
    /// issue already there).
    pub fn note_regression(&mut self, issue: Issue) {
        self.stats.count(&issue);
        let threshold = self.settings.correlation.duplicate_similarity;
        match self.active.as_mut() {
            Some(group) if !group.issues().any(|g| correlate::is_duplicate(g, &issue, threshold)) => {
                group.last_updated = issue.detected_at;
                group.related_issues.push(issue);
                self.stats.related += 1;
            }
            _ => self.stats.duplicates += 1,
        }
    }

    /// Close the active group. The head of the queue, if any, becomes the root
    /// of a fresh group.
    pub fn close_and_promote_next(&mut self, now: DateTime<Utc>) -> Option<&FocusGroup> {
        if let Some(closed) = self.active.take() {
            info!(focus_group = %closed.id, related = closed.related_issues.len(), "closed focus group");
        }
        let next = self.queue.pop_front()?;
        let group = FocusGroup::new(next, now);
        info!(focus_group = %group.id, issue_type = %group.root_issue.issue_type, "promoted queued issue");
        self.stats.focus_groups_opened += 1;
        self.active = Some(group);
        self.active.as_ref()
    }

    /// Append a fix attempt to the active group. Returns true when the group
    /// already had at least `failed_attempt_warning` failed attempts.
    pub fn record_fix_attempt(&mut self, attempt: FixAttempt) -> Result<bool, StoreError> {
        let group = self.active.as_mut().ok_or(StoreError::NoActiveGroup)?;
        let repeated = group.failed_attempts() >= self.settings.failed_attempt_warning;
        group.fix_attempts.push(attempt);
        Ok(repeated)
    }

    /// Conclude the pending attempt on the active group.
    pub fn conclude_fix_attempt(
        &mut self,
        result: FixResult,
        failure_reason: Option<String>,
        new_logs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<FixAttempt, StoreError> {
        let group = self.active.as_mut().ok_or(StoreError::NoActiveGroup)?;
        let group_id = group.id;
        let issue_type = group.root_issue.issue_type.clone();
        let attempt = group
            .pending_attempt_mut()
            .ok_or(StoreError::NoPendingAttempt(group_id))?;

        attempt.result = result;
        attempt.failure_reason = failure_reason;
        attempt.new_logs.extend(new_logs);
        attempt.concluded_at = Some(now);
        let concluded = attempt.clone();

        self.recent_outcomes.push_back(FixOutcome {
            focus_group_id: group_id,
            issue_type,
            fix_description: concluded.fix_description.clone(),
            result,
            failure_reason: concluded.failure_reason.clone(),
            concluded_at: now,
        });
        while self.recent_outcomes.len() > RECENT_OUTCOMES {
            self.recent_outcomes.pop_front();
        }
        Ok(concluded)
    }

    /// Whether the active group has reached the failed-attempt warning level.
    pub fn repeated_failures(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|g| g.failed_attempts() >= self.settings.failed_attempt_warning)
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|g| g.id)
    }

    fn prune_recent(&mut self, now: DateTime<Utc>) {
        let window = Duration::seconds(self.settings.duplicate_window_seconds as i64);
        while self
            .recent
            .front()
            .is_some_and(|r| now - r.detected_at > window)
        {
            self.recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Service;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn issue(issue_type: &str, severity: Severity, message: &str, secs: i64) -> Issue {
        Issue::new(issue_type, severity, Source::Server, message, at(secs))
    }

    #[test]
    fn test_first_issue_opens_focus_group() {
        let mut store = FocusGroupStore::default();
        let outcome = store.add_issue(issue("pot_mismatch", Severity::Critical, "pot mismatch table 7", 0));
        assert_eq!(outcome, AddOutcome::NewFocusGroup);
        assert_eq!(store.active().unwrap().root_issue.issue_type, "pot_mismatch");
        assert_eq!(store.stats().focus_groups_opened, 1);
    }

    #[test]
    fn test_same_payload_twice_is_stored_once() {
        let mut store = FocusGroupStore::default();
        let first = issue("timeout", Severity::Medium, "lobby refresh timeout after 5000ms", 0);
        let mut second = first.clone();
        second.id = Uuid::new_v4();
        second.detected_at = at(120);

        assert_eq!(store.add_issue(first), AddOutcome::NewFocusGroup);
        assert_eq!(store.add_issue(second), AddOutcome::Duplicate);
        let group = store.active().unwrap();
        assert!(group.related_issues.is_empty());
        assert_eq!(store.queued_len(), 0);
        assert_eq!(store.stats().duplicates, 1);
        assert_eq!(store.stats().total, 2);
    }

    #[test]
    fn test_recent_duplicate_without_active_group_is_discarded() {
        let mut store = FocusGroupStore::default();
        store.add_issue(issue("timeout", Severity::Medium, "lobby refresh timeout after 5000ms", 0));
        store.close_and_promote_next(at(10));
        assert!(store.active().is_none());

        let again = issue("timeout", Severity::Medium, "lobby refresh timeout after 5000ms", 60);
        assert_eq!(store.add_issue(again), AddOutcome::Duplicate);
        assert!(store.active().is_none());

        // outside the five minute window it opens a new group
        let later = issue("timeout", Severity::Medium, "lobby refresh timeout after 5000ms", 400);
        assert_eq!(store.add_issue(later), AddOutcome::NewFocusGroup);
    }

    #[test]
    fn test_related_issue_joins_group_and_unrelated_is_queued() {
        let mut store = FocusGroupStore::default();
        store.add_issue(
            issue("pot_mismatch", Severity::Critical, "pot mismatch detected", 0).with_resource_id("t-7"),
        );
        let related = issue("award_calculation_error", Severity::High, "side pot payout wrong", 5)
            .with_resource_id("t-7");
        assert_eq!(store.add_issue(related), AddOutcome::AddedToGroup);

        let unrelated = issue("slow_query", Severity::Low, "slow query on leaderboard", 6);
        assert_eq!(store.add_issue(unrelated.clone()), AddOutcome::Queued);

        let mut unrelated_again = unrelated;
        unrelated_again.detected_at = at(8);
        assert_eq!(store.add_issue(unrelated_again), AddOutcome::Duplicate);

        let group = store.active().unwrap();
        assert_eq!(group.related_issues.len(), 1);
        assert_eq!(group.highest_severity(), Severity::Critical);
        assert_eq!(store.queued_len(), 1);
    }

    #[test]
    fn test_close_and_promote_next_is_fifo() {
        let mut store = FocusGroupStore::default();
        store.add_issue(issue("pot_mismatch", Severity::Critical, "pot mismatch detected", 0));
        store.add_issue(issue("slow_query", Severity::Low, "slow query on leaderboard", 40));
        store.add_issue(issue("deprecation", Severity::Low, "deprecated avatar endpoint used", 41));

        let next = store.close_and_promote_next(at(100)).unwrap();
        assert_eq!(next.root_issue.issue_type, "slow_query");
        assert!(next.related_issues.is_empty());
        assert!(next.fix_attempts.is_empty());

        let next = store.close_and_promote_next(at(101)).unwrap();
        assert_eq!(next.root_issue.issue_type, "deprecation");
        assert!(store.close_and_promote_next(at(102)).is_none());
        assert!(store.active().is_none());
    }

    #[test]
    fn test_fix_attempts_and_repeated_failure_warning() {
        let mut store = FocusGroupStore::new(StoreSettings {
            failed_attempt_warning: 2,
            ..StoreSettings::default()
        });
        assert_eq!(
            store.record_fix_attempt(FixAttempt::new("x", vec![], at(0))),
            Err(StoreError::NoActiveGroup)
        );

        store.add_issue(issue("pot_mismatch", Severity::Critical, "pot mismatch detected", 0));
        for n in 0..2 {
            let repeated = store
                .record_fix_attempt(FixAttempt::new(format!("attempt {n}"), vec![Service::Server], at(n)))
                .unwrap();
            assert!(!repeated);
            store
                .conclude_fix_attempt(FixResult::Failed, Some("regressed".into()), vec!["pot mismatch".into()], at(n))
                .unwrap();
        }
        assert!(store.repeated_failures());
        let repeated = store
            .record_fix_attempt(FixAttempt::new("third", vec![], at(5)))
            .unwrap();
        assert!(repeated);

        let concluded = store
            .conclude_fix_attempt(FixResult::Success, None, vec![], at(6))
            .unwrap();
        assert_eq!(concluded.fix_description, "third");
        assert_eq!(store.active().unwrap().fix_attempts.len(), 3);
        assert_eq!(store.recent_outcomes().count(), 3);
        assert!(matches!(
            store.conclude_fix_attempt(FixResult::Success, None, vec![], at(7)),
            Err(StoreError::NoPendingAttempt(_))
        ));
    }

    #[test]
    fn test_store_round_trips_through_json() {
        let mut store = FocusGroupStore::default();
        store.add_issue(issue("pot_mismatch", Severity::Critical, "pot mismatch detected", 0));
        store.add_issue(issue("slow_query", Severity::Low, "slow query on leaderboard", 40));

        let json = serde_json::to_string(&store).unwrap();
        let restored: FocusGroupStore = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.active_id(), store.active_id());
        assert_eq!(restored.queued_len(), 1);
        assert_eq!(restored.stats(), store.stats());
    }
}
