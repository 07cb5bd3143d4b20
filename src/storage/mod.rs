//! SQLite storage layer -- schema, queries, migrations.

pub mod recorder;
pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::detect::Issue;
use crate::focus::{FixAttempt, FocusGroupStore, StoreSettings};
use crate::investigation::Transition;

pub use self::recorder::{spawn_recorder, Record};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A classified issue and what the store did with it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    #[serde(flatten)]
    pub issue: Issue,
    pub disposition: String,
    pub focus_group_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttemptRecord {
    pub focus_group_id: Uuid,
    #[serde(flatten)]
    pub attempt: FixAttempt,
}

pub fn save_issue(pool: &Pool, issue: &Issue, disposition: &str, focus_group_id: Option<Uuid>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO issues
            (id, issue_type, severity, source, resource_id, disposition, focus_group_id, issue_json, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            issue.id.to_string(),
            issue.issue_type,
            issue.severity.as_str(),
            issue.source.as_str(),
            issue.resource_id,
            disposition,
            focus_group_id.map(|id| id.to_string()),
            serde_json::to_string(issue)?,
            issue.detected_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Most recent issues first.
pub fn list_recent_issues(pool: &Pool, limit: usize) -> Result<Vec<IssueRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT issue_json, disposition, focus_group_id FROM issues
         ORDER BY detected_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (json, disposition, group) = row?;
        let issue: Issue = serde_json::from_str(&json).context("corrupt issue row")?;
        records.push(IssueRecord {
            issue,
            disposition,
            focus_group_id: group.and_then(|g| Uuid::parse_str(&g).ok()),
        });
    }
    Ok(records)
}

pub fn save_transition(pool: &Pool, transition: &Transition) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO transitions (from_phase, to_phase, reason, focus_group_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            transition.from.as_str(),
            transition.to.as_str(),
            transition.reason,
            transition.focus_group_id.map(|id| id.to_string()),
            transition.at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Newest transitions first.
pub fn list_transitions(pool: &Pool, limit: usize) -> Result<Vec<Transition>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT from_phase, to_phase, reason, focus_group_id, created_at FROM transitions
         ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut transitions = Vec::new();
    for row in rows {
        let (from, to, reason, group, at) = row?;
        transitions.push(Transition {
            from: from.parse().map_err(anyhow::Error::msg)?,
            to: to.parse().map_err(anyhow::Error::msg)?,
            reason,
            focus_group_id: group.and_then(|g| Uuid::parse_str(&g).ok()),
            at: parse_time(&at)?,
        });
    }
    Ok(transitions)
}

/// Insert or update a fix attempt (attempts are concluded after creation).
pub fn save_fix_attempt(pool: &Pool, focus_group_id: Uuid, attempt: &FixAttempt) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO fix_attempts
            (id, focus_group_id, fix_description, result, failure_reason, attempt_json, submitted_at, concluded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            result = excluded.result,
            failure_reason = excluded.failure_reason,
            attempt_json = excluded.attempt_json,
            concluded_at = excluded.concluded_at",
        params![
            attempt.id.to_string(),
            focus_group_id.to_string(),
            attempt.fix_description,
            attempt.result.as_str(),
            attempt.failure_reason,
            serde_json::to_string(attempt)?,
            attempt.submitted_at.to_rfc3339(),
            attempt.concluded_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Most recently submitted first.
pub fn list_fix_attempts(pool: &Pool, limit: usize) -> Result<Vec<FixAttemptRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT focus_group_id, attempt_json FROM fix_attempts
         ORDER BY submitted_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (group, json) = row?;
        records.push(FixAttemptRecord {
            focus_group_id: Uuid::parse_str(&group).context("corrupt focus group id")?,
            attempt: serde_json::from_str(&json).context("corrupt fix attempt row")?,
        });
    }
    Ok(records)
}

pub fn save_focus_state(pool: &Pool, store: &FocusGroupStore, now: DateTime<Utc>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO focus_state (id, state_json, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
        params![serde_json::to_string(store)?, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Load the persisted store. An unparsable document is dropped and replaced by
/// an empty store; the second value then carries a warning for the operator.
pub fn load_focus_state(pool: &Pool, settings: StoreSettings) -> Result<(FocusGroupStore, Option<String>)> {
    let conn = pool.get()?;
    let json: Option<String> = conn
        .query_row("SELECT state_json FROM focus_state WHERE id = 1", [], |row| row.get(0))
        .optional()?;

    let Some(json) = json else {
        return Ok((FocusGroupStore::new(settings), None));
    };
    match serde_json::from_str::<FocusGroupStore>(&json) {
        Ok(store) => Ok((store.with_settings(settings), None)),
        Err(e) => {
            warn!(error = %e, "persisted focus state is unreadable, starting empty");
            conn.execute("DELETE FROM focus_state WHERE id = 1", [])?;
            let message = format!("persisted focus state was unreadable ({}), started empty", e);
            Ok((FocusGroupStore::new(settings), Some(message)))
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp '{}'", value))?
        .with_timezone(&Utc))
}
