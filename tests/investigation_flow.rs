//! End-to-end investigation scenarios driven through the public API with
//! injected timestamps: raw log line in, phases and commands out.

use chrono::{DateTime, Duration, Utc};

use tablewatch::control::{Service, ServiceHealth};
use tablewatch::detect::{correlate, Classifier};
use tablewatch::fix::FixDescriptor;
use tablewatch::focus::{AddOutcome, FixResult, FocusGroupStore, StoreSettings};
use tablewatch::investigation::{Command, InvestigationSettings, Investigator, Phase};
use tablewatch::status::StatusSnapshot;
use tablewatch::verify::{self, VerificationSettings};

const POT_LINE: &str = "[ERROR] GameEngine: Pot mismatch detected tableId=table-42 expected=1200 actual=1150";

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn investigator() -> Investigator {
    Investigator::new(
        InvestigationSettings { enabled: true, timeout_seconds: 15 },
        VerificationSettings::default(),
        FocusGroupStore::new(StoreSettings::default()),
    )
}

/// Steps 1-3 of the scenario: detect, pause, accept a server-restart fix and
/// report the server ready at `ready_at`.
fn into_verifying(inv: &mut Investigator, ready_at: i64) -> uuid::Uuid {
    let classifier = Classifier::new();
    let issue = classifier.classify_at(POT_LINE, at(0)).expect("pot mismatch is an issue");
    assert_eq!(issue.issue_type, "pot_mismatch");
    assert_eq!(issue.resource_id.as_deref(), Some("table-42"));

    let step = inv.handle_issue(issue, at(0));
    assert_eq!(step.outcome, Some(AddOutcome::NewFocusGroup));
    assert_eq!(inv.phase(), Phase::Investigating);
    let group = inv.store().active_id().unwrap();

    for s in 1..15 {
        assert!(inv.tick(at(s)).transitions.is_empty(), "no transition at {}s", s);
    }
    let step = inv.tick(at(15));
    assert_eq!(inv.phase(), Phase::Paused);
    match &step.commands[..] {
        [Command::Pause(req)] => {
            assert_eq!(req.focus_group_id, group);
            assert_eq!(req.resource_id.as_deref(), Some("table-42"));
        }
        other => panic!("expected a pause command, got {:?}", other),
    }

    let fix = FixDescriptor {
        focus_group_id: group,
        fix_description: "round side pots before settlement".to_string(),
        required_restarts: vec![Service::Server],
    };
    let step = inv.handle_fix(&fix, at(20));
    assert_eq!(inv.phase(), Phase::Verifying);
    assert_eq!(
        step.commands,
        vec![Command::Restart { focus_group_id: group, services: vec![Service::Server] }]
    );
    assert_eq!(inv.state().verification.as_ref().unwrap().period_seconds, 135);

    inv.handle_services_ready(group, true, vec![(Service::Server, ServiceHealth::healthy())], at(ready_at));
    group
}

#[test]
fn test_pot_mismatch_scenario_end_to_end() {
    let mut inv = investigator();
    let group = into_verifying(&mut inv, 30);

    // quiet window: unrelated noise does not disturb verification
    let classifier = Classifier::new();
    let noise = classifier
        .classify_at("WARN slow query on leaderboard took 2100ms", at(60))
        .unwrap();
    inv.handle_issue(noise, at(60));

    assert!(inv.tick(at(30 + 134)).transitions.is_empty());
    let step = inv.tick(at(30 + 135));

    let resumed = step
        .commands
        .iter()
        .any(|c| matches!(c, Command::Resume(r) if r.focus_group_id == group && r.resource_id.as_deref() == Some("table-42")));
    assert!(resumed, "resume command expected, got {:?}", step.commands);
    assert_eq!(step.fix_attempts.len(), 1);
    assert_eq!(step.fix_attempts[0].1.result, FixResult::Success);

    // the queued slow query becomes the next investigation
    assert_eq!(inv.phase(), Phase::Investigating);
    assert_ne!(inv.store().active_id(), Some(group));
    assert_eq!(inv.store().active().unwrap().root_issue.issue_type, "slow_query");
}

#[test]
fn test_quiet_verification_returns_to_monitoring() {
    let mut inv = investigator();
    into_verifying(&mut inv, 30);
    inv.tick(at(165));
    assert_eq!(inv.phase(), Phase::Monitoring);
    assert!(inv.store().active().is_none());

    let snapshot = StatusSnapshot::capture(&inv, at(166));
    assert_eq!(snapshot.phase, Phase::Monitoring);
    assert_eq!(snapshot.recent_fix_attempts.len(), 1);
    assert_eq!(snapshot.recent_fix_attempts[0].result, FixResult::Success);
}

#[test]
fn test_regression_during_verification() {
    let mut inv = investigator();
    let group = into_verifying(&mut inv, 30);

    let classifier = Classifier::new();
    let again = classifier.classify_at(POT_LINE, at(80)).unwrap();
    let step = inv.handle_issue(again, at(80));

    assert!(step.regression);
    assert_eq!(inv.phase(), Phase::Paused);
    assert_eq!(inv.store().active_id(), Some(group), "same focus group is reused");
    let active = inv.store().active().unwrap();
    assert_eq!(active.fix_attempts.len(), 1);
    assert_eq!(active.fix_attempts[0].result, FixResult::Failed);
    assert!(matches!(step.commands[..], [Command::Pause(_)]));

    // a second fix is accepted against the same group
    let fix = FixDescriptor {
        focus_group_id: group,
        fix_description: "lock pot during settlement".to_string(),
        required_restarts: vec![],
    };
    inv.handle_fix(&fix, at(90));
    assert_eq!(inv.phase(), Phase::Verifying);
    assert_eq!(inv.store().active().unwrap().fix_attempts.len(), 2);
}

#[test]
fn test_other_table_is_not_a_regression() {
    let mut inv = investigator();
    into_verifying(&mut inv, 30);

    let classifier = Classifier::new();
    let other = classifier
        .classify_at(
            "[ERROR] GameEngine: Pot mismatch detected tableId=table-7 expected=300 actual=280",
            at(80),
        )
        .unwrap();
    let step = inv.handle_issue(other, at(80));
    assert!(!step.regression);
    assert_eq!(inv.phase(), Phase::Verifying);
}

#[test]
fn test_stalled_investigation_is_forced_by_ceiling() {
    let mut inv = investigator();
    let issue = Classifier::new().classify_at(POT_LINE, at(0)).unwrap();
    inv.handle_issue(issue, at(0));

    // no tick reaches the machine until well after twice the timeout
    let step = inv.tick(at(30));
    assert_eq!(step.final_phase(), Some(Phase::Paused));
    assert_eq!(inv.phase(), Phase::Paused);
}

#[test]
fn test_properties() {
    // fix-success lines never classify
    let classifier = Classifier::new();
    assert!(classifier.classify("Pot mismatch fix successful on tableId=t-9").is_none());
    assert!(classifier.classify("Auto-fix applied: pot mismatch on tableId=t-9").is_none());

    // equal resource id relates regardless of text, never beyond the window
    let a = classifier.classify_at("Pot mismatch tableId=t-1", at(0)).unwrap();
    let b = classifier.classify_at("Player dropped from session tableId=t-1", at(10)).unwrap();
    assert!(correlate::related(&a, &b, 30));
    let late = classifier.classify_at("Player dropped from session tableId=t-1", at(31)).unwrap();
    assert!(!correlate::related(&a, &late, 30));

    assert_eq!(
        verify::compute_period(tablewatch::detect::Severity::Critical, &[Service::Database, Service::Server], "pot_mismatch"),
        150
    );
}

#[test]
fn test_same_payload_twice_within_window_is_duplicate() {
    let classifier = Classifier::new();
    let mut store = FocusGroupStore::default();
    let first = classifier.classify_at("ERROR lobby refresh timeout after 5000ms", at(0)).unwrap();
    let second = classifier.classify_at("ERROR lobby refresh timeout after 5000ms", at(240)).unwrap();
    assert_eq!(store.add_issue(first), AddOutcome::NewFocusGroup);
    assert_eq!(store.add_issue(second), AddOutcome::Duplicate);
    assert_eq!(store.active().unwrap().issues().count(), 1);
}
