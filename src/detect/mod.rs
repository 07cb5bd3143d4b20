//! Issue detection: the issue model, log-line classification and correlation.

pub mod classifier;
pub mod correlate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::classifier::Classifier;

/// Upper bound on the stored message length (in characters).
pub const MAX_MESSAGE_LEN: usize = 500;

/// Severity levels for detected issues.
///
/// Declared lowest first so that `Ord` ranks `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Only critical and high issues may pause the client.
    pub fn pauses_client(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Where an issue originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Server,
    #[serde(alias = "unity")]
    Client,
    Database,
    Network,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Server => "server",
            Source::Client => "client",
            Source::Database => "database",
            Source::Network => "network",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Function + file pair parsed from structured context or a stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackLocation {
    pub function: String,
    pub file: String,
}

/// One detected anomaly. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub source: Source,
    pub message: String,
    pub resource_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub stack_location: Option<StackLocation>,
}

impl Issue {
    /// Build an issue, truncating the message to [`MAX_MESSAGE_LEN`] characters.
    pub fn new(
        issue_type: impl Into<String>,
        severity: Severity,
        source: Source,
        message: &str,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            issue_type: issue_type.into(),
            severity,
            source,
            message: truncate_message(message),
            resource_id: None,
            detected_at,
            stack_location: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_stack_location(mut self, function: &str, file: &str) -> Self {
        self.stack_location = Some(StackLocation {
            function: function.to_string(),
            file: file.to_string(),
        });
        self
    }

    /// The reduced signature used for pause commands and regression matching.
    pub fn signature(&self) -> IssueSignature {
        IssueSignature {
            issue_type: self.issue_type.clone(),
            source: self.source,
            resource_id: self.resource_id.clone(),
        }
    }
}

/// `type` + `source` + optional `resourceId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSignature {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub source: Source,
    pub resource_id: Option<String>,
}

impl std::fmt::Display for IssueSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.resource_id {
            Some(id) => write!(f, "{}/{}@{}", self.source, self.issue_type, id),
            None => write!(f, "{}/{}", self.source, self.issue_type),
        }
    }
}

fn truncate_message(message: &str) -> String {
    let trimmed = message.trim_end();
    match trimmed.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::High.pauses_client());
        assert!(!Severity::Medium.pauses_client());
    }

    #[test]
    fn test_message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_LEN + 20);
        let issue = Issue::new("general", Severity::Low, Source::Server, &long, Utc::now());
        assert_eq!(issue.message.chars().count(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_source_accepts_unity_alias() {
        let source: Source = serde_json::from_str("\"unity\"").unwrap();
        assert_eq!(source, Source::Client);
        assert_eq!(serde_json::to_string(&Source::Client).unwrap(), "\"client\"");
    }

    #[test]
    fn test_signature_display() {
        let issue = Issue::new("pot_mismatch", Severity::Critical, Source::Server, "x", Utc::now())
            .with_resource_id("table-7");
        assert_eq!(issue.signature().to_string(), "server/pot_mismatch@table-7");
    }
}
