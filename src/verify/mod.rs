//! Verification engine: how long to watch for regression after a fix, whether
//! a new issue is that regression, and whether restarted services are ready.

use std::time::Duration;

use tokio::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::{Service, ServiceControl, ServiceHealth};
use crate::detect::classifier::extract_resource_id;
use crate::detect::{Issue, IssueSignature, Severity};

const ECONOMY_KEYWORDS: &[&str] = &["pot", "chip", "bet", "award", "calculation", "payout"];
const CONNECTIVITY_KEYWORDS: &[&str] = &["connection", "network", "socket", "disconnect"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub base_critical_secs: u64,
    pub base_high_secs: u64,
    pub base_medium_secs: u64,
    pub base_other_secs: u64,
    /// Added once per distinct required restart.
    pub per_restart_secs: u64,
    /// Added for game-economy issues so a full game cycle can elapse.
    pub economy_bonus_secs: u64,
    pub connectivity_bonus_secs: u64,
    /// Cap on waiting for restarted services before the window starts anyway.
    pub service_ready_timeout_secs: u64,
    pub service_poll_interval_secs: u64,
    /// Budget for the whole restart sequence. Restarts still running when it
    /// runs out are cancelled. The state machine arms the window on its own
    /// after `restart_grace_secs + service_ready_timeout_secs`.
    pub restart_grace_secs: u64,
    /// Timeout of a single restart command.
    pub restart_timeout_secs: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            base_critical_secs: 90,
            base_high_secs: 60,
            base_medium_secs: 45,
            base_other_secs: 30,
            per_restart_secs: 15,
            economy_bonus_secs: 30,
            connectivity_bonus_secs: 20,
            service_ready_timeout_secs: 60,
            service_poll_interval_secs: 2,
            restart_grace_secs: 60,
            restart_timeout_secs: 20,
        }
    }
}

impl VerificationSettings {
    /// Time after fix acceptance by which the window is armed no matter what.
    /// Restarts and the readiness wait are each bounded so the readiness
    /// report lands no later than this.
    pub fn arm_deadline_secs(&self) -> u64 {
        self.restart_grace_secs + self.service_ready_timeout_secs
    }

    pub fn restart_budget(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs)
    }

    pub fn restart_call_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs.clamp(1, self.restart_grace_secs.max(1)))
    }
}

/// Verification period with default settings.
pub fn compute_period(severity: Severity, required_restarts: &[Service], issue_type: &str) -> u64 {
    compute_period_with(&VerificationSettings::default(), severity, required_restarts, issue_type)
}

pub fn compute_period_with(
    settings: &VerificationSettings,
    severity: Severity,
    required_restarts: &[Service],
    issue_type: &str,
) -> u64 {
    let mut secs = match severity {
        Severity::Critical => settings.base_critical_secs,
        Severity::High => settings.base_high_secs,
        Severity::Medium => settings.base_medium_secs,
        Severity::Low => settings.base_other_secs,
    };

    let distinct = Service::restart_order(required_restarts).len() as u64;
    secs += settings.per_restart_secs * distinct;

    let kind = issue_type.to_ascii_lowercase();
    if ECONOMY_KEYWORDS.iter().any(|k| kind.contains(k)) {
        secs += settings.economy_bonus_secs;
    }
    if CONNECTIVITY_KEYWORDS.iter().any(|k| kind.contains(k)) {
        secs += settings.connectivity_bonus_secs;
    }
    secs
}

/// Exact signature match. When the pattern carries a resource id the issue must
/// carry the same one, falling back to parsing it out of the raw message.
pub fn matches(issue: &Issue, pattern: &IssueSignature) -> bool {
    if issue.issue_type != pattern.issue_type || issue.source != pattern.source {
        return false;
    }
    match &pattern.resource_id {
        None => true,
        Some(expected) => {
            let found = issue
                .resource_id
                .clone()
                .or_else(|| extract_resource_id(&issue.message));
            found.as_deref() == Some(expected.as_str())
        }
    }
}

/// Outcome of waiting for restarted services.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub health: Vec<(Service, ServiceHealth)>,
}

/// Poll every service once, concurrently, each bounded by `call_timeout`.
/// True only when all report healthy.
pub async fn services_ready(
    control: &dyn ServiceControl,
    services: &[Service],
    call_timeout: Duration,
) -> Readiness {
    let checks = services.iter().map(|&service| async move {
        let health = match tokio::time::timeout(call_timeout, control.health(service)).await {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => ServiceHealth::unhealthy(e.to_string()),
            Err(_) => ServiceHealth::unhealthy(format!("health check timed out after {:?}", call_timeout)),
        };
        (service, health)
    });

    let health = join_all(checks).await;
    let ready = health.iter().all(|(_, h)| h.healthy);
    Readiness { ready, health }
}

/// Poll until every service is healthy or the ready cap passes. Health calls
/// are shortened near the cap so the whole wait never outlasts it. Callers
/// start verification either way and rely on regression matching to catch
/// failures.
pub async fn wait_for_services(
    control: &dyn ServiceControl,
    services: &[Service],
    settings: &VerificationSettings,
    call_timeout: Duration,
) -> Readiness {
    let cap = Duration::from_secs(settings.service_ready_timeout_secs);
    let poll = Duration::from_secs(settings.service_poll_interval_secs.max(1));
    let started = Instant::now();
    let deadline = started + cap;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let readiness = services_ready(control, services, call_timeout.min(remaining)).await;
        if readiness.ready {
            debug!(elapsed = ?started.elapsed(), "services ready");
            return readiness;
        }
        if Instant::now() + poll >= deadline {
            warn!(?services, cap_secs = cap.as_secs(), "services not healthy before cap, starting verification anyway");
            return readiness;
        }
        tokio::time::sleep(poll).await;
    }
}
