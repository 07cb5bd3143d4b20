//! Status snapshot: the read-only view external displays consume.
//!
//! Built from the investigator after every transition and on a steady cadence,
//! published on a `watch` channel and mirrored to a JSON file. Never read back
//! into live state. A mirror that stops landing on disk is reported back to the
//! control loop as a warning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::control::{Service, ServiceHealth};
use crate::detect::{Issue, Severity};
use crate::focus::{FixOutcome, IssueStats};
use crate::investigation::{Investigator, Phase, VerificationWindow, Warning};
use crate::monitor::MonitorEvent;

/// Queued issues listed in the snapshot.
const QUEUE_PREVIEW: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusGroupSummary {
    pub id: Uuid,
    pub root_issue: Issue,
    pub related_count: usize,
    pub highest_severity: Severity,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub fix_attempts: usize,
    pub failed_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub phase: Phase,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub remaining_seconds: Option<u64>,
    pub timeout_seconds: u64,
    pub investigation_enabled: bool,
    pub focus_group: Option<FocusGroupSummary>,
    pub queued_count: usize,
    pub queued: Vec<Issue>,
    pub verification: Option<VerificationWindow>,
    pub recent_fix_attempts: Vec<FixOutcome>,
    pub counters: IssueStats,
    pub lines_scanned: u64,
    pub repeated_failures: bool,
    pub warnings: Vec<Warning>,
    pub services: BTreeMap<Service, ServiceHealth>,
    pub players_online: Option<u64>,
    pub active_simulations: Option<u64>,
}

impl StatusSnapshot {
    pub fn capture(investigator: &Investigator, now: DateTime<Utc>) -> Self {
        let state = investigator.state();
        let store = investigator.store();
        let services = investigator.services().clone();
        let server = services.get(&Service::Server);

        Self {
            generated_at: now,
            phase: state.phase,
            phase_started_at: state.start_time,
            elapsed_seconds: state.elapsed_seconds(now),
            remaining_seconds: state.remaining_seconds(now),
            timeout_seconds: state.timeout_seconds,
            investigation_enabled: investigator.settings().enabled,
            focus_group: store.active().map(|g| FocusGroupSummary {
                id: g.id,
                root_issue: g.root_issue.clone(),
                related_count: g.related_issues.len(),
                highest_severity: g.highest_severity(),
                started_at: g.started_at,
                last_updated: g.last_updated,
                fix_attempts: g.fix_attempts.len(),
                failed_attempts: g.failed_attempts(),
            }),
            queued_count: store.queued_len(),
            queued: store.queue().take(QUEUE_PREVIEW).cloned().collect(),
            verification: state.verification.clone(),
            recent_fix_attempts: store.recent_outcomes().cloned().collect(),
            counters: store.stats().clone(),
            lines_scanned: investigator.lines_scanned(),
            repeated_failures: store.repeated_failures(),
            warnings: investigator.warnings().cloned().collect(),
            players_online: server.and_then(|h| h.players_online),
            active_simulations: server.and_then(|h| h.active_simulations),
            services,
        }
    }

    /// Snapshot of a monitor with nothing in flight.
    #[cfg(test)]
    pub(crate) fn idle(now: DateTime<Utc>) -> Self {
        Self {
            generated_at: now,
            phase: Phase::Monitoring,
            phase_started_at: None,
            elapsed_seconds: 0,
            remaining_seconds: None,
            timeout_seconds: 0,
            investigation_enabled: true,
            focus_group: None,
            queued_count: 0,
            queued: Vec::new(),
            verification: None,
            recent_fix_attempts: Vec::new(),
            counters: IssueStats::default(),
            lines_scanned: 0,
            repeated_failures: false,
            warnings: Vec::new(),
            services: BTreeMap::new(),
            players_online: None,
            active_simulations: None,
        }
    }
}

/// Write the snapshot atomically (temp file + rename).
pub async fn write_snapshot(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<StatusSnapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read status file: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse status file: {}", path.display()))
}

/// Mirror every published snapshot to `path`. Only the first failure of a
/// failing stretch is sent to `events`, since the warning itself republishes.
pub fn spawn_status_writer(
    mut snapshots: watch::Receiver<StatusSnapshot>,
    path: PathBuf,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failing = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let snapshot = snapshots.borrow_and_update().clone();
            match write_snapshot(&path, &snapshot).await {
                Ok(()) => failing = false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to write status file");
                    if !failing {
                        failing = true;
                        let _ = events.try_send(MonitorEvent::Warning(format!(
                            "status file {} not written: {:#}",
                            path.display(),
                            e
                        )));
                    }
                }
            }
        }

        // final state on the way out
        let snapshot = snapshots.borrow().clone();
        if let Err(e) = write_snapshot(&path, &snapshot).await {
            warn!(path = %path.display(), error = %e, "failed to write final status file");
        }
        debug!("status writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Source;
    use crate::focus::FocusGroupStore;
    use crate::investigation::InvestigationSettings;
    use crate::verify::VerificationSettings;

    #[test]
    fn test_capture_reports_focus_group_and_timers() {
        let t0 = Utc::now();
        let mut inv = Investigator::new(
            InvestigationSettings::default(),
            VerificationSettings::default(),
            FocusGroupStore::default(),
        );
        inv.handle_issue(
            Issue::new("chips_lost", Severity::Critical, Source::Server, "chips lost for seat 3", t0),
            t0,
        );
        let mut health = ServiceHealth::healthy();
        health.players_online = Some(12);
        inv.record_health(vec![(Service::Server, health)]);

        let snap = StatusSnapshot::capture(&inv, t0 + chrono::Duration::seconds(6));
        assert_eq!(snap.phase, Phase::Investigating);
        assert_eq!(snap.elapsed_seconds, 6);
        assert_eq!(snap.remaining_seconds, Some(9));
        assert_eq!(snap.focus_group.unwrap().root_issue.issue_type, "chips_lost");
        assert_eq!(snap.counters.total, 1);
        assert_eq!(snap.players_online, Some(12));
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.json");
        let snap = StatusSnapshot::idle(Utc::now());
        write_snapshot(&path, &snap).await.unwrap();

        let back = read_snapshot(&path).unwrap();
        assert_eq!(back, snap);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["phase"], "monitoring");
        assert!(raw.get("queuedCount").is_some());
    }

    #[tokio::test]
    async fn test_unwritable_status_file_warns_once() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let (publish, snapshots) = watch::channel(StatusSnapshot::idle(Utc::now()));
        let (events, mut inbox) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let handle = spawn_status_writer(snapshots, blocker.join("status.json"), events, shutdown.clone());

        publish.send(StatusSnapshot::idle(Utc::now())).unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), inbox.recv())
            .await
            .expect("warning sent");
        match event {
            Some(MonitorEvent::Warning(message)) => assert!(message.contains("status file"), "{}", message),
            other => panic!("expected a warning, got {:?}", other),
        }

        publish.send(StatusSnapshot::idle(Utc::now())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(inbox.try_recv().is_err(), "repeat failures stay quiet");
    }
}
