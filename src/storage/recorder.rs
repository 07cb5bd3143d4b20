//! Sequential writer for everything the control loop wants persisted.
//!
//! The loop never touches SQLite itself: it sends [`Record`]s here and moves
//! on. Records are written in arrival order on the blocking pool. The first
//! failure after a run of successful writes is reported back to the loop as a
//! warning.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::Pool;
use crate::detect::Issue;
use crate::focus::{FixAttempt, FocusGroupStore};
use crate::investigation::Transition;
use crate::monitor::MonitorEvent;

#[derive(Debug)]
pub enum Record {
    Issue {
        issue: Issue,
        disposition: &'static str,
        focus_group_id: Option<Uuid>,
    },
    Transition(Transition),
    FixAttempt {
        focus_group_id: Uuid,
        attempt: FixAttempt,
    },
    FocusState(Box<FocusGroupStore>),
}

impl Record {
    fn kind(&self) -> &'static str {
        match self {
            Record::Issue { .. } => "issue",
            Record::Transition(_) => "transition",
            Record::FixAttempt { .. } => "fix_attempt",
            Record::FocusState(_) => "focus_state",
        }
    }
}

fn write(pool: &Pool, record: Record) -> anyhow::Result<()> {
    match record {
        Record::Issue {
            issue,
            disposition,
            focus_group_id,
        } => super::save_issue(pool, &issue, disposition, focus_group_id),
        Record::Transition(t) => super::save_transition(pool, &t),
        Record::FixAttempt {
            focus_group_id,
            attempt,
        } => super::save_fix_attempt(pool, focus_group_id, &attempt),
        Record::FocusState(store) => super::save_focus_state(pool, &store, Utc::now()),
    }
}

/// Drain `records` until every sender is dropped.
pub fn spawn_recorder(
    pool: Pool,
    mut records: mpsc::Receiver<Record>,
    events: mpsc::Sender<MonitorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failing = false;
        while let Some(record) = records.recv().await {
            let kind = record.kind();
            let pool = pool.clone();
            let failure = match tokio::task::spawn_blocking(move || write(&pool, record)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!(kind, error = %e, "failed to persist record");
                    Some(format!("failed to persist {} record: {:#}", kind, e))
                }
                Err(e) => {
                    error!(kind, error = %e, "recorder task panicked");
                    Some(format!("recorder panicked writing {} record", kind))
                }
            };
            match failure {
                Some(message) if !failing => {
                    failing = true;
                    // the loop may already be gone during shutdown
                    let _ = events.try_send(MonitorEvent::Warning(message));
                }
                Some(_) => {}
                None => failing = false,
            }
        }
        debug!("recorder stopped");
    })
}
