//! Config-driven collaborator implementation: HTTP health checks, restart
//! commands, and the client pause/resume bridge.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ControlError, PauseRequest, ResumeRequest, Service, ServiceControl, ServiceHealth};
use crate::config::{ClientBridgeConfig, ServicesConfig};

/// Optional body of a health endpoint response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    healthy: Option<bool>,
    status: Option<String>,
    players_online: Option<u64>,
    active_simulations: Option<u64>,
}

/// Talks to the local game stack using the configured URLs and commands.
pub struct LocalControl {
    client: Client,
    services: ServicesConfig,
    bridge: ClientBridgeConfig,
}

impl LocalControl {
    pub fn new(
        services: ServicesConfig,
        bridge: ClientBridgeConfig,
        call_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let client = Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            client,
            services,
            bridge,
        })
    }

    async fn post(&self, op: &str, url: &str, body: serde_json::Value) -> Result<(), ControlError> {
        let resp = self.client.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ControlError::Status {
                op: op.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServiceControl for LocalControl {
    async fn health(&self, service: Service) -> Result<ServiceHealth, ControlError> {
        let Some(url) = self.services.endpoint(service).health_url.as_deref() else {
            let mut health = ServiceHealth::healthy();
            health.detail = Some("no health check configured".to_string());
            return Ok(health);
        };

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Ok(ServiceHealth::unhealthy(format!("{} unreachable: {}", service, e)));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if !status.is_success() {
            return Ok(ServiceHealth::unhealthy(format!("{} returned {}", url, status)));
        }

        // A body is optional; a non-JSON 2xx still counts as healthy.
        let body: HealthBody = resp.json().await.unwrap_or_default();
        let healthy = body.healthy.unwrap_or_else(|| {
            body.status
                .as_deref()
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "up"))
                .unwrap_or(true)
        });

        Ok(ServiceHealth {
            healthy,
            players_online: body.players_online,
            active_simulations: body.active_simulations,
            detail: body.status,
            checked_at: Utc::now(),
        })
    }

    async fn restart(&self, service: Service) -> Result<(), ControlError> {
        let command = &self.services.endpoint(service).restart_command;
        let Some((program, args)) = command.split_first() else {
            return Err(ControlError::NotConfigured(format!("restart command for {}", service)));
        };

        info!(%service, %program, "restarting service");
        let status = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(ControlError::CommandFailed {
                service,
                code: status.code(),
            });
        }
        debug!(%service, "restart command finished");
        Ok(())
    }

    async fn pause(&self, request: &PauseRequest) -> Result<(), ControlError> {
        let Some(url) = self.bridge.pause_url.as_deref() else {
            return Err(ControlError::NotConfigured("client bridge pause_url".to_string()));
        };
        let body = json!({
            "broadcast": request.resource_id.is_none(),
            "request": request,
        });
        self.post("pause", url, body).await
    }

    async fn resume(&self, request: &ResumeRequest) -> Result<(), ControlError> {
        let Some(url) = self.bridge.resume_url.as_deref() else {
            return Err(ControlError::NotConfigured("client bridge resume_url".to_string()));
        };
        let body = json!({
            "broadcast": request.resource_id.is_none(),
            "request": request,
        });
        self.post("resume", url, body).await
    }
}
