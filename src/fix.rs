//! Fix descriptors: written by whoever fixed the problem, picked up by the
//! monitor to move a paused focus group into verification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::Service;
use crate::monitor::MonitorEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixDescriptor {
    #[serde(alias = "focus_group_id")]
    pub focus_group_id: Uuid,
    #[serde(alias = "fix_description")]
    pub fix_description: String,
    #[serde(default, alias = "required_restarts")]
    pub required_restarts: Vec<Service>,
}

#[derive(Debug, Error)]
pub enum FixError {
    #[error("failed to access fix file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed fix descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("fix descriptor has an empty description")]
    EmptyDescription,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FixError + '_ {
    move |source| FixError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn parse_descriptor(text: &str) -> Result<FixDescriptor, FixError> {
    let mut descriptor: FixDescriptor = serde_json::from_str(text)?;
    descriptor.fix_description = descriptor.fix_description.trim().to_string();
    if descriptor.fix_description.is_empty() {
        return Err(FixError::EmptyDescription);
    }
    Ok(descriptor)
}

/// Consume the descriptor at `path`, if any. A malformed file is moved aside to
/// `<path>.rejected` so it is not picked up again.
pub async fn take_descriptor(path: &Path) -> Result<Option<FixDescriptor>, FixError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };

    match parse_descriptor(&text) {
        Ok(descriptor) => {
            tokio::fs::remove_file(path).await.map_err(io_err(path))?;
            Ok(Some(descriptor))
        }
        Err(e) => {
            let rejected = rejected_path(path);
            tokio::fs::rename(path, &rejected).await.map_err(io_err(path))?;
            warn!(path = %path.display(), moved_to = %rejected.display(), error = %e, "rejected fix descriptor");
            Err(e)
        }
    }
}

/// Write a descriptor atomically (temp file + rename).
pub async fn write_descriptor(path: &Path, descriptor: &FixDescriptor) -> Result<(), FixError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    let body = serde_json::to_vec_pretty(descriptor)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await.map_err(io_err(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

fn rejected_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".rejected");
    PathBuf::from(name)
}

/// Poll the fix file and forward descriptors into the control loop.
pub fn spawn_fix_watcher(
    path: PathBuf,
    interval: Duration,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %path.display(), "watching for fix descriptors");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let event = match take_descriptor(&path).await {
                Ok(Some(descriptor)) => {
                    debug!(focus_group = %descriptor.focus_group_id, "fix descriptor picked up");
                    MonitorEvent::Fix(descriptor)
                }
                Ok(None) => continue,
                Err(e) => MonitorEvent::Warning(format!("fix descriptor discarded: {}", e)),
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("fix watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_camel_and_snake_case() {
        let id = Uuid::new_v4();
        let camel = format!(
            r#"{{"focusGroupId":"{}","fixDescription":"reset pot ledger","requiredRestarts":["server","database"]}}"#,
            id
        );
        let fix = parse_descriptor(&camel).unwrap();
        assert_eq!(fix.focus_group_id, id);
        assert_eq!(fix.required_restarts, vec![Service::Server, Service::Database]);

        let snake = format!(r#"{{"focus_group_id":"{}","fix_description":"x"}}"#, id);
        let fix = parse_descriptor(&snake).unwrap();
        assert!(fix.required_restarts.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(parse_descriptor("{not json"), Err(FixError::Malformed(_))));
        let blank = format!(r#"{{"focusGroupId":"{}","fixDescription":"   "}}"#, Uuid::new_v4());
        assert!(matches!(parse_descriptor(&blank), Err(FixError::EmptyDescription)));
        let bad_service = format!(
            r#"{{"focusGroupId":"{}","fixDescription":"x","requiredRestarts":["cache"]}}"#,
            Uuid::new_v4()
        );
        assert!(parse_descriptor(&bad_service).is_err());
    }

    #[tokio::test]
    async fn test_take_consumes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fix-applied.json");
        assert!(take_descriptor(&path).await.unwrap().is_none());

        let fix = FixDescriptor {
            focus_group_id: Uuid::new_v4(),
            fix_description: "guard null seat".to_string(),
            required_restarts: vec![Service::Client],
        };
        write_descriptor(&path, &fix).await.unwrap();
        assert_eq!(take_descriptor(&path).await.unwrap(), Some(fix));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fix-applied.json");
        std::fs::write(&path, "garbage").unwrap();

        assert!(take_descriptor(&path).await.is_err());
        assert!(!path.exists());
        assert!(dir.path().join("fix-applied.json.rejected").exists());
        assert!(take_descriptor(&path).await.unwrap().is_none());
    }
}
