//! External collaborators: service health, restarts, client pause/resume.
//!
//! The core never talks to processes directly. Everything goes through the
//! [`ServiceControl`] trait, and every call made by the monitor is wrapped in a
//! short timeout plus a bounded retry (see [`with_retry`]).

pub mod local;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::detect::{IssueSignature, Severity};

pub use self::local::LocalControl;

/// A restartable, health-checked collaborator. Variant order is restart order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Database,
    Server,
    Client,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Database, Service::Server, Service::Client];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Database => "database",
            Service::Server => "server",
            Service::Client => "client",
        }
    }

    /// Deduplicate and sort into restart order: database, server, client.
    pub fn restart_order(services: &[Service]) -> Vec<Service> {
        let mut ordered = services.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(Service::Database),
            "server" => Ok(Service::Server),
            "client" | "unity" => Ok(Service::Client),
            other => Err(format!("unknown service '{}'", other)),
        }
    }
}

/// Result of one health query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub healthy: bool,
    pub players_online: Option<u64>,
    pub active_simulations: Option<u64>,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            players_online: None,
            active_simulations: None,
            detail: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
            ..Self::healthy()
        }
    }
}

/// Pause command sent to the client collaborator. A `None` resource id means
/// broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
    pub focus_group_id: Uuid,
    pub resource_id: Option<String>,
    pub signature: IssueSignature,
    pub severity: Severity,
    pub reason: String,
    pub related_count: usize,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub focus_group_id: Uuid,
    pub resource_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{op} returned status {status}")]
    Status { op: String, status: u16 },
    #[error("restart of {service} exited with {code:?}")]
    CommandFailed { service: Service, code: Option<i32> },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Missing configuration is a deliberate setup choice, not a transient failure.
    pub fn is_not_configured(&self) -> bool {
        matches!(self, ControlError::NotConfigured(_))
    }
}

/// Operations the monitor needs from the outside world.
#[async_trait::async_trait]
pub trait ServiceControl: Send + Sync {
    async fn health(&self, service: Service) -> Result<ServiceHealth, ControlError>;

    async fn restart(&self, service: Service) -> Result<(), ControlError>;

    async fn pause(&self, request: &PauseRequest) -> Result<(), ControlError>;

    async fn resume(&self, request: &ResumeRequest) -> Result<(), ControlError>;
}

/// Timeout and retry budget for a single external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub call_timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            call_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op` up to `policy.attempts` times, each bounded by `policy.call_timeout`,
/// sleeping `backoff * attempt` between tries (linear backoff). Not-configured
/// errors are returned immediately.
pub async fn with_retry<T, F, Fut>(name: &str, policy: &RetryPolicy, mut op: F) -> Result<T, ControlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(ControlError::Timeout {
                op: name.to_string(),
                secs: policy.call_timeout.as_secs(),
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_not_configured() => return Err(e),
            Err(e) => {
                debug!(op = %name, attempt, error = %e, "external call failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ControlError::Timeout {
        op: name.to_string(),
        secs: policy.call_timeout.as_secs(),
    }))
}
