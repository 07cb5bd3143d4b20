//! The investigation state machine.
//!
//! `Investigator` owns the phase, the focus group store and the warning ring.
//! Every input carries its own `now`, so the whole machine is deterministic and
//! driven by one caller at a time.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    Command, InvestigationSettings, InvestigationState, Phase, Step, Transition, VerificationWindow,
    Warning, WARNING_RING,
};
use crate::control::{PauseRequest, ResumeRequest, Service, ServiceHealth};
use crate::detect::Issue;
use crate::fix::FixDescriptor;
use crate::focus::{AddOutcome, FixAttempt, FixResult, FocusGroup, FocusGroupStore};
use crate::verify::{self, VerificationSettings};

/// Related-issue messages attached to a pause request.
const PAUSE_CONTEXT: usize = 10;

pub struct Investigator {
    state: InvestigationState,
    store: FocusGroupStore,
    settings: InvestigationSettings,
    verification: VerificationSettings,
    warnings: VecDeque<Warning>,
    services: BTreeMap<Service, ServiceHealth>,
    lines_scanned: u64,
}

impl Investigator {
    pub fn new(
        settings: InvestigationSettings,
        verification: VerificationSettings,
        store: FocusGroupStore,
    ) -> Self {
        Self {
            state: InvestigationState::new(settings.timeout_seconds),
            store,
            settings,
            verification,
            warnings: VecDeque::new(),
            services: BTreeMap::new(),
            lines_scanned: 0,
        }
    }

    pub fn state(&self) -> &InvestigationState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn store(&self) -> &FocusGroupStore {
        &self.store
    }

    pub fn settings(&self) -> &InvestigationSettings {
        &self.settings
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.warnings.iter()
    }

    pub fn services(&self) -> &BTreeMap<Service, ServiceHealth> {
        &self.services
    }

    pub fn lines_scanned(&self) -> u64 {
        self.lines_scanned
    }

    pub fn note_line(&mut self) {
        self.lines_scanned += 1;
    }

    /// Re-derive the phase from a store loaded at startup. A persisted active
    /// group starts a fresh investigation.
    pub fn restore(&mut self, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();
        if self.store.active().is_some() {
            self.abandon_pending_attempt(now, &mut step);
            self.open_investigation(now, "restored from persisted state", &mut step);
        }
        step
    }

    /// Route one classified issue.
    pub fn handle_issue(&mut self, issue: Issue, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();

        if self.is_regression(&issue) {
            self.regress(issue, now, &mut step);
            return step;
        }

        let outcome = self.store.add_issue(issue);
        step.outcome = Some(outcome);
        if outcome == AddOutcome::NewFocusGroup && self.state.phase == Phase::Monitoring {
            self.open_investigation(now, "new focus group", &mut step);
        }
        step
    }

    /// Accept a fix descriptor for the paused focus group. Anything else is
    /// stale and discarded with a warning.
    pub fn handle_fix(&mut self, fix: &FixDescriptor, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();

        if self.state.phase != Phase::Paused {
            self.warn(
                format!(
                    "discarded fix for {} while {}: fixes are accepted only when paused",
                    fix.focus_group_id, self.state.phase
                ),
                now,
            );
            return step;
        }
        let Some(group) = self.store.active() else {
            return step;
        };
        if group.id != fix.focus_group_id {
            let active = group.id;
            self.warn(
                format!("discarded stale fix for {} (active focus group is {})", fix.focus_group_id, active),
                now,
            );
            return step;
        }

        let group_id = group.id;
        let root = group.root_issue.clone();
        let restarts = Service::restart_order(&fix.required_restarts);
        let attempt = FixAttempt::new(fix.fix_description.clone(), restarts.clone(), now);

        match self.store.record_fix_attempt(attempt.clone()) {
            Ok(true) => {
                let failed = self.store.active().map(FocusGroup::failed_attempts).unwrap_or_default();
                self.warn(
                    format!("focus group {} has {} failed fix attempts", group_id, failed),
                    now,
                );
            }
            Ok(false) => {}
            Err(e) => {
                self.warn(format!("could not record fix attempt: {}", e), now);
                return step;
            }
        }
        step.fix_attempts.push((group_id, attempt));

        let period = verify::compute_period_with(&self.verification, root.severity, &restarts, &root.issue_type);
        info!(
            focus_group = %group_id,
            period_secs = period,
            restarts = ?restarts,
            fix = %fix.fix_description,
            "fix accepted"
        );

        let armed = restarts.is_empty();
        self.enter(Phase::Verifying, "fix applied", now, &mut step);
        self.state.verification = Some(VerificationWindow {
            focus_group_id: group_id,
            pattern: root.signature(),
            period_seconds: period,
            required_restarts: restarts.clone(),
            armed,
            accepted_at: now,
        });
        if !armed {
            step.commands.push(Command::Restart {
                focus_group_id: group_id,
                services: restarts,
            });
        }
        step
    }

    /// Restarts finished and the readiness gate returned. Arms the verification
    /// window for the matching group.
    pub fn handle_services_ready(
        &mut self,
        focus_group_id: Uuid,
        ready: bool,
        health: Vec<(Service, ServiceHealth)>,
        now: DateTime<Utc>,
    ) {
        self.record_health(health);

        let pending = self.state.phase == Phase::Verifying
            && self
                .state
                .verification
                .as_ref()
                .is_some_and(|w| w.focus_group_id == focus_group_id && !w.armed);
        if !pending {
            return;
        }
        if !ready {
            self.warn(
                format!("services not healthy after restart for {}, verifying anyway", focus_group_id),
                now,
            );
        }
        self.arm(now);
    }

    pub fn record_health(&mut self, health: Vec<(Service, ServiceHealth)>) {
        self.services.extend(health);
    }

    /// Advance timers. Called on a steady cadence by the control loop.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();

        if let Some(violation) = self.invariant_violation() {
            self.reset(violation, now, &mut step);
            return step;
        }

        let elapsed = self.state.elapsed_seconds(now);
        match self.state.phase {
            Phase::Monitoring | Phase::Paused => {}
            Phase::Investigating => {
                let timeout = self.state.timeout_seconds;
                if elapsed >= timeout.saturating_mul(2) {
                    self.warn(
                        format!("investigation ran {}s past a {}s timeout, forcing completion", elapsed, timeout),
                        now,
                    );
                    self.pause(now, "investigation safety ceiling", &mut step);
                } else if elapsed >= timeout {
                    self.complete_investigation(now, &mut step);
                }
            }
            Phase::Verifying => {
                let (armed, period) = match &self.state.verification {
                    Some(w) => (w.armed, w.period_seconds),
                    None => return step,
                };
                if !armed {
                    if elapsed >= self.verification.arm_deadline_secs() {
                        self.warn("no readiness report after restarts, starting verification".to_string(), now);
                        self.arm(now);
                    }
                } else if elapsed >= period {
                    self.verification_passed(now, &mut step);
                }
            }
        }
        step
    }

    /// Push onto the warning ring and log it.
    pub fn warn(&mut self, message: String, now: DateTime<Utc>) {
        warn!(phase = %self.state.phase, "{}", message);
        self.warnings.push_back(Warning { at: now, message });
        while self.warnings.len() > WARNING_RING {
            self.warnings.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn enter(&mut self, to: Phase, reason: &str, now: DateTime<Utc>, step: &mut Step) {
        let from = self.state.phase;
        self.state.phase = to;
        self.state.start_time = (to != Phase::Monitoring).then_some(now);
        if to != Phase::Verifying {
            self.state.verification = None;
        }
        if from == Phase::Monitoring && to == Phase::Monitoring {
            return;
        }

        let focus_group_id = self.store.active_id();
        info!(from = %from, to = %to, focus_group = ?focus_group_id, reason, "phase transition");
        step.transitions.push(Transition {
            from,
            to,
            reason: reason.to_string(),
            focus_group_id,
            at: now,
        });
    }

    /// Start work on the active group, closing out non-severe groups at once
    /// when investigation is disabled.
    fn open_investigation(&mut self, now: DateTime<Utc>, reason: &str, step: &mut Step) {
        loop {
            let Some(group) = self.store.active() else {
                self.enter(Phase::Monitoring, "queue empty", now, step);
                return;
            };
            if self.settings.enabled && self.settings.timeout_seconds > 0 {
                self.enter(Phase::Investigating, reason, now, step);
                return;
            }
            if group.highest_severity().pauses_client() {
                self.pause(now, "severe issue with investigation disabled", step);
                return;
            }
            info!(focus_group = %group.id, "closing non-severe focus group without investigation");
            self.store.close_and_promote_next(now);
        }
    }

    fn complete_investigation(&mut self, now: DateTime<Utc>, step: &mut Step) {
        let severe = self
            .store
            .active()
            .is_some_and(|g| g.highest_severity().pauses_client());
        if severe {
            self.pause(now, "investigation complete", step);
        } else {
            self.close_out(now, "investigation complete, no pause needed", step);
        }
    }

    /// Enter Paused. The client itself is only paused for critical/high groups.
    fn pause(&mut self, now: DateTime<Utc>, reason: &str, step: &mut Step) {
        self.enter(Phase::Paused, reason, now, step);
        if let Some(group) = self.store.active() {
            if group.highest_severity().pauses_client() {
                step.commands.push(Command::Pause(pause_request(group, reason)));
            }
        }
    }

    fn close_out(&mut self, now: DateTime<Utc>, reason: &str, step: &mut Step) {
        if self.store.close_and_promote_next(now).is_some() {
            self.open_investigation(now, "promoted queued issue", step);
        } else {
            self.enter(Phase::Monitoring, reason, now, step);
        }
    }

    fn arm(&mut self, now: DateTime<Utc>) {
        if let Some(window) = self.state.verification.as_mut() {
            window.armed = true;
            self.state.start_time = Some(now);
            info!(focus_group = %window.focus_group_id, period_secs = window.period_seconds, "verification window armed");
        }
    }

    fn is_regression(&self, issue: &Issue) -> bool {
        self.state.phase == Phase::Verifying
            && self
                .state
                .verification
                .as_ref()
                .is_some_and(|w| w.armed && verify::matches(issue, &w.pattern))
    }

    fn regress(&mut self, issue: Issue, now: DateTime<Utc>, step: &mut Step) {
        let elapsed = self.state.elapsed_seconds(now);
        let reason = format!("{} reappeared {}s into verification", issue.signature(), elapsed);
        step.regression = true;

        match self.store.conclude_fix_attempt(
            FixResult::Failed,
            Some(reason.clone()),
            vec![issue.message.clone()],
            now,
        ) {
            Ok(attempt) => {
                if let Some(id) = self.store.active_id() {
                    step.fix_attempts.push((id, attempt));
                }
            }
            Err(e) => error!(error = %e, "regression without a pending fix attempt"),
        }
        self.store.note_regression(issue);
        self.warn(format!("fix failed: {}", reason), now);
        self.pause(now, "regression during verification", step);
    }

    fn verification_passed(&mut self, now: DateTime<Utc>, step: &mut Step) {
        match self.store.conclude_fix_attempt(FixResult::Success, None, Vec::new(), now) {
            Ok(attempt) => {
                if let Some(group) = self.store.active() {
                    info!(focus_group = %group.id, fix = %attempt.fix_description, "fix verified");
                    if group.highest_severity().pauses_client() {
                        step.commands.push(Command::Resume(ResumeRequest {
                            focus_group_id: group.id,
                            resource_id: target_resource(group),
                        }));
                    }
                    step.fix_attempts.push((group.id, attempt));
                }
            }
            Err(e) => error!(error = %e, "verification finished without a pending fix attempt"),
        }
        self.close_out(now, "verification passed", step);
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    fn invariant_violation(&self) -> Option<String> {
        let phase = self.state.phase;
        let active = self.store.active_id();

        if phase == Phase::Monitoring {
            return active.map(|id| format!("monitoring with focus group {} still active", id));
        }
        if self.state.start_time.is_none() {
            return Some(format!("{} has no start time", phase));
        }
        let Some(active) = active else {
            return Some(format!("{} without an active focus group", phase));
        };
        if phase == Phase::Verifying {
            match &self.state.verification {
                None => return Some("verifying without a verification window".to_string()),
                Some(w) if w.focus_group_id != active => {
                    return Some(format!(
                        "verification window references {} but {} is active",
                        w.focus_group_id, active
                    ));
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Reset to Monitoring and re-derive from the store.
    fn reset(&mut self, violation: String, now: DateTime<Utc>, step: &mut Step) {
        error!(phase = %self.state.phase, violation = %violation, "invariant violated, resetting to monitoring");
        self.warn(format!("state reset: {}", violation), now);
        self.enter(Phase::Monitoring, "invariant reset", now, step);
        if self.store.active().is_some() {
            self.abandon_pending_attempt(now, step);
            self.open_investigation(now, "re-derived after reset", step);
        }
    }

    fn abandon_pending_attempt(&mut self, now: DateTime<Utc>, step: &mut Step) {
        let pending = self
            .store
            .active()
            .is_some_and(|g| g.pending_attempt().is_some());
        if !pending {
            return;
        }
        let reason = Some("verification interrupted".to_string());
        if let Ok(attempt) = self.store.conclude_fix_attempt(FixResult::Failed, reason, Vec::new(), now) {
            if let Some(id) = self.store.active_id() {
                step.fix_attempts.push((id, attempt));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut InvestigationState {
        &mut self.state
    }
}

/// Root resource id, else the first related issue that carries one.
fn target_resource(group: &FocusGroup) -> Option<String> {
    group.issues().find_map(|i| i.resource_id.clone())
}

fn pause_request(group: &FocusGroup, reason: &str) -> PauseRequest {
    let skip = group.related_issues.len().saturating_sub(PAUSE_CONTEXT);
    PauseRequest {
        focus_group_id: group.id,
        resource_id: target_resource(group),
        signature: group.root_issue.signature(),
        severity: group.highest_severity(),
        reason: reason.to_string(),
        related_count: group.related_issues.len(),
        context: group
            .related_issues
            .iter()
            .skip(skip)
            .map(|i| i.message.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Severity, Source};
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn investigator(enabled: bool, timeout_seconds: u64) -> Investigator {
        Investigator::new(
            InvestigationSettings { enabled, timeout_seconds },
            VerificationSettings::default(),
            FocusGroupStore::default(),
        )
    }

    fn pot_mismatch(secs: i64) -> Issue {
        Issue::new(
            "pot_mismatch",
            Severity::Critical,
            Source::Server,
            "pot mismatch: expected 400 got 380",
            at(secs),
        )
        .with_resource_id("table-7")
    }

    fn pause_into(inv: &mut Investigator) -> Uuid {
        inv.handle_issue(pot_mismatch(0), at(0));
        inv.tick(at(15));
        assert_eq!(inv.phase(), Phase::Paused);
        inv.store().active_id().unwrap()
    }

    fn fix(id: Uuid, restarts: Vec<Service>) -> FixDescriptor {
        FixDescriptor {
            focus_group_id: id,
            fix_description: "recompute side pots before award".to_string(),
            required_restarts: restarts,
        }
    }

    #[test]
    fn test_critical_issue_investigates_then_pauses() {
        let mut inv = investigator(true, 15);
        let step = inv.handle_issue(pot_mismatch(0), at(0));
        assert_eq!(step.outcome, Some(AddOutcome::NewFocusGroup));
        assert_eq!(step.final_phase(), Some(Phase::Investigating));
        assert_eq!(inv.state().start_time, Some(at(0)));

        assert!(inv.tick(at(14)).transitions.is_empty());

        let step = inv.tick(at(15));
        assert_eq!(step.final_phase(), Some(Phase::Paused));
        match &step.commands[..] {
            [Command::Pause(req)] => {
                assert_eq!(req.resource_id.as_deref(), Some("table-7"));
                assert_eq!(req.severity, Severity::Critical);
            }
            other => panic!("expected one pause command, got {:?}", other),
        }
    }

    #[test]
    fn test_safety_ceiling_forces_pause() {
        let mut inv = investigator(true, 15);
        inv.handle_issue(pot_mismatch(0), at(0));
        // the first tick after a long stall lands past twice the timeout
        let step = inv.tick(at(31));
        assert_eq!(step.final_phase(), Some(Phase::Paused));
        assert_eq!(step.transitions[0].reason, "investigation safety ceiling");
        assert!(inv.warnings().any(|w| w.message.contains("forcing completion")));
    }

    #[test]
    fn test_low_severity_group_closes_without_pause() {
        let mut inv = investigator(true, 15);
        inv.handle_issue(
            Issue::new("slow_query", Severity::Low, Source::Database, "slow query took 900ms", at(0)),
            at(0),
        );
        let step = inv.tick(at(15));
        assert_eq!(step.final_phase(), Some(Phase::Monitoring));
        assert!(step.commands.is_empty());
        assert!(inv.store().active().is_none());
    }

    #[test]
    fn test_disabled_investigation_pauses_severe_immediately() {
        let mut inv = investigator(false, 15);
        let step = inv.handle_issue(pot_mismatch(0), at(0));
        assert_eq!(step.final_phase(), Some(Phase::Paused));
        assert!(matches!(step.commands[..], [Command::Pause(_)]));

        let mut inv = investigator(true, 0);
        let step = inv.handle_issue(
            Issue::new("timeout", Severity::Medium, Source::Server, "lobby timeout", at(0)),
            at(0),
        );
        assert!(step.transitions.is_empty());
        assert_eq!(inv.phase(), Phase::Monitoring);
        assert!(inv.store().active().is_none());
    }

    #[test]
    fn test_fix_enters_verifying_and_succeeds() {
        let mut inv = investigator(true, 15);
        let id = pause_into(&mut inv);

        let step = inv.handle_fix(&fix(id, vec![Service::Server]), at(20));
        assert_eq!(step.final_phase(), Some(Phase::Verifying));
        assert_eq!(
            step.commands,
            vec![Command::Restart { focus_group_id: id, services: vec![Service::Server] }]
        );
        let window = inv.state().verification.clone().unwrap();
        assert_eq!(window.period_seconds, 135);
        assert!(!window.armed);

        inv.handle_services_ready(id, true, vec![(Service::Server, ServiceHealth::healthy())], at(30));
        assert!(inv.state().verification.as_ref().unwrap().armed);
        assert_eq!(inv.state().start_time, Some(at(30)));

        assert!(inv.tick(at(164)).transitions.is_empty());
        let step = inv.tick(at(165));
        assert_eq!(step.final_phase(), Some(Phase::Monitoring));
        assert!(matches!(&step.commands[..], [Command::Resume(r)] if r.focus_group_id == id));
        assert_eq!(step.fix_attempts[0].1.result, FixResult::Success);
        assert!(inv.store().active().is_none());
    }

    #[test]
    fn test_stale_or_early_fix_is_discarded() {
        let mut inv = investigator(true, 15);
        inv.handle_issue(pot_mismatch(0), at(0));
        let id = inv.store().active_id().unwrap();

        // still investigating
        assert!(!inv.handle_fix(&fix(id, vec![]), at(5)).changed());

        inv.tick(at(15));
        assert!(!inv.handle_fix(&fix(Uuid::new_v4(), vec![]), at(16)).changed());
        assert_eq!(inv.phase(), Phase::Paused);
        assert_eq!(inv.warnings().count(), 2);
    }

    #[test]
    fn test_regression_returns_to_paused_on_same_group() {
        let mut inv = investigator(true, 15);
        let id = pause_into(&mut inv);
        inv.handle_fix(&fix(id, vec![]), at(20));
        assert!(inv.state().verification.as_ref().unwrap().armed);

        let step = inv.handle_issue(pot_mismatch(70), at(70));
        assert!(step.regression);
        assert_eq!(step.final_phase(), Some(Phase::Paused));
        assert_eq!(inv.store().active_id(), Some(id));
        let group = inv.store().active().unwrap();
        assert_eq!(group.fix_attempts.len(), 1);
        assert_eq!(group.fix_attempts[0].result, FixResult::Failed);
        assert!(matches!(step.commands[..], [Command::Pause(_)]));
    }

    #[test]
    fn test_unarmed_window_arms_at_deadline() {
        let mut inv = investigator(true, 15);
        let id = pause_into(&mut inv);
        inv.handle_fix(&fix(id, vec![Service::Database]), at(20));

        // a matching line before the window is armed is not a regression
        let step = inv.handle_issue(pot_mismatch(25), at(25));
        assert!(!step.regression);

        let deadline = VerificationSettings::default().arm_deadline_secs() as i64;
        inv.tick(at(20 + deadline));
        assert!(inv.state().verification.as_ref().unwrap().armed);
        assert_eq!(inv.phase(), Phase::Verifying);
    }

    #[test]
    fn test_queued_issue_is_promoted_after_close() {
        let mut inv = investigator(true, 15);
        inv.handle_issue(
            Issue::new("slow_query", Severity::Low, Source::Database, "slow query took 900ms", at(0)),
            at(0),
        );
        let step = inv.handle_issue(pot_mismatch(10), at(10));
        assert_eq!(step.outcome, Some(AddOutcome::Queued));
        assert_eq!(inv.phase(), Phase::Investigating);

        let step = inv.tick(at(15));
        assert_eq!(step.final_phase(), Some(Phase::Investigating));
        assert!(step.commands.is_empty());
        let active = inv.store().active().unwrap();
        assert_eq!(active.root_issue.issue_type, "pot_mismatch");
        assert_eq!(inv.state().start_time, Some(at(15)));
    }

    #[test]
    fn test_missing_start_time_resets_and_rederives() {
        let mut inv = investigator(true, 15);
        pause_into(&mut inv);
        inv.state_mut().start_time = None;

        let step = inv.tick(at(20));
        let phases: Vec<Phase> = step.transitions.iter().map(|t| t.to).collect();
        assert_eq!(phases, vec![Phase::Monitoring, Phase::Investigating]);
        assert!(inv.warnings().any(|w| w.message.starts_with("state reset")));
        assert_eq!(inv.state().start_time, Some(at(20)));
    }

    #[test]
    fn test_warning_ring_is_bounded() {
        let mut inv = investigator(true, 15);
        for n in 0..(WARNING_RING + 5) {
            inv.warn(format!("warning {}", n), at(n as i64));
        }
        assert_eq!(inv.warnings().count(), WARNING_RING);
        assert_eq!(inv.warnings().next().unwrap().message, "warning 5");
    }

    #[test]
    fn test_restore_reopens_persisted_group() {
        let mut store = FocusGroupStore::default();
        store.add_issue(pot_mismatch(0));
        let mut inv = Investigator::new(InvestigationSettings::default(), VerificationSettings::default(), store);
        let step = inv.restore(at(100));
        assert_eq!(step.final_phase(), Some(Phase::Investigating));
        assert_eq!(inv.state().start_time, Some(at(100)));
    }
}
