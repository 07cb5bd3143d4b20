//! Pattern classifier: maps a raw log line to an [`Issue`] or nothing.
//!
//! Classification runs in two stages. The exclusion list is evaluated first and
//! any hit means "never an issue" (our own log output, trace noise, lines that
//! report a successful automated fix). The rule table is then evaluated in
//! severity order, critical first, and the first matching rule wins.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use super::{Issue, Severity, Source, StackLocation};

/// A "never an issue" predicate.
pub struct Exclusion {
    pub name: &'static str,
    pattern: Regex,
}

/// One row of the classification table. `issue_type` is the stable identifier
/// reported on the issue, never the pattern text.
pub struct Rule {
    pub issue_type: &'static str,
    pub severity: Severity,
    pattern: Regex,
}

impl Rule {
    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

fn exclusion(name: &'static str, pattern: &str) -> Exclusion {
    Exclusion {
        name,
        pattern: Regex::new(pattern).expect("valid exclusion pattern"),
    }
}

fn rule(issue_type: &'static str, severity: Severity, pattern: &str) -> Rule {
    Rule {
        issue_type,
        severity,
        pattern: Regex::new(pattern).expect("valid rule pattern"),
    }
}

static EXCLUSIONS: LazyLock<Vec<Exclusion>> = LazyLock::new(|| {
    vec![
        exclusion("self_log", r"(?i)\[(monitor|tablewatch|issue[\s_-]?detector)\]"),
        exclusion(
            "fix_success",
            r"(?i)\bfix(ed)?[\s_-]+success(ful)?\b|\bauto[\s_-]?fix(ed)?\s+(applied|succeeded|success)|\bself[\s_-]?heal(ed|ing)?\s+(succeeded|complete)",
        ),
        exclusion(
            "trace_noise",
            r"(?i)^\s*\[?\s*(trace|debug|verbose)\b|^\s*\[(heartbeat|keep-?alive)\]|\b(heartbeat|keep-?alive)\s+(ok|sent|received|ack(nowledged)?)\b|\[status\]|health\s*check\s+(ok|passed)",
        ),
    ]
});

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // critical
        rule(
            "pot_mismatch",
            Severity::Critical,
            r"(?i)\bpot\b.{0,40}\b(mismatch|discrepancy|does\s+not\s+match|inconsistent)",
        ),
        rule(
            "chips_lost",
            Severity::Critical,
            r"(?i)\bchips?\b.{0,40}\b(lost|missing|disappeared|conservation\s+(violated|failed))",
        ),
        rule(
            "server_crash",
            Severity::Critical,
            r"(?i)\b(unhandled\s+(exception|promise\s+rejection|rejection)|uncaught\s+exception|fatal\s+error|segmentation\s+fault|process\s+crashed)",
        ),
        rule(
            "database_connection_lost",
            Severity::Critical,
            r"(?i)\b(database|db|postgres(ql)?|mysql|mongo(db)?)\b.{0,40}\b(connection\s+(lost|refused|closed|terminated)|disconnected|unreachable)",
        ),
        // high
        rule(
            "award_calculation_error",
            Severity::High,
            r"(?i)\b(award|payout|side[\s_-]?pot|winnings)\b.{0,40}\b(error|incorrect|failed|invalid|wrong)",
        ),
        rule(
            "bet_validation_failed",
            Severity::High,
            r"(?i)\b(invalid|illegal|rejected)\s+bet\b|\bbet\b.{0,20}\bvalidation\s+(failed|error)",
        ),
        rule(
            "state_desync",
            Severity::High,
            r"(?i)\b(game|table|client)\s+state\b.{0,30}\b(desync|out\s+of\s+sync|diverged|mismatch)",
        ),
        rule(
            "socket_disconnect",
            Severity::High,
            r"(?i)\b(socket|websocket)\b.{0,40}\b(error|disconnect(ed)?|closed\s+unexpectedly|hang\s+up)",
        ),
        rule(
            "timer_stuck",
            Severity::High,
            r"(?i)\btimer\b.{0,30}\b(stuck|froze|frozen|did\s+not\s+fire|not\s+firing|negative)",
        ),
        rule(
            "player_lost",
            Severity::High,
            r"(?i)\bplayer\b.{0,30}\b(lost|dropped|missing)\b",
        ),
        // medium
        rule(
            "timeout",
            Severity::Medium,
            r"(?i)\btim(ed|e)[\s_-]?out\b|\btimeout\b",
        ),
        rule(
            "validation_error",
            Severity::Medium,
            r"(?i)\bvalidation\b.{0,20}\b(error|failed|failure)",
        ),
        rule(
            "null_reference",
            Severity::Medium,
            r"(?i)null\s*reference|cannot\s+read\s+propert(y|ies)\s+of\s+(undefined|null)|\bis\s+not\s+a\s+function\b|\bundefined\s+is\s+not\b",
        ),
        rule(
            "player_action_rejected",
            Severity::Medium,
            r"(?i)\bplayer\s+action\b.{0,20}\b(rejected|failed|ignored)",
        ),
        // low
        rule("slow_query", Severity::Low, r"(?i)\bslow\s+query\b"),
        rule("retry", Severity::Low, r"(?i)\bretry(ing)?\b.{0,20}\battempt\b"),
        rule("deprecation", Severity::Low, r"(?i)\bdeprecat(ed|ion)\b"),
        rule("general", Severity::Low, r"(?i)\b(error|exception|failed|failure)\b"),
    ]
});

static CLIENT_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(unity|client)\]|unityengine|\bunity\b|\.cs:\d+")
        .expect("valid client marker pattern")
});

static DATABASE_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\[(db|database)\]|\b(database|postgres(ql)?|mysql|sqlite|mongo(db)?|prisma|sequelize|knex|pg)\b",
    )
    .expect("valid database marker pattern")
});

static NETWORK_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(socket|websocket|network|econnreset|econnrefused|etimedout|ehostunreach|epipe)\b",
    )
    .expect("valid network marker pattern")
});

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:table|session|game|hand)[_-]?id["']?\s*[:=]\s*["']?([A-Za-z0-9_.-]+)"#,
    )
    .expect("valid resource id pattern")
});

static RESOURCE_ID_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:table|session)\s+#?([A-Za-z0-9_-]*\d[A-Za-z0-9_-]*)")
        .expect("valid resource id fallback pattern")
});

static STRUCTURED_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)"?function"?\s*[:=]\s*"?([\w.$<>]+)"?[^\n]{0,80}?"?file"?\s*[:=]\s*"?([\w./\\-]+)"#,
    )
    .expect("valid structured location pattern")
});

static JS_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat\s+([\w.$<>]+)\s+\(([^():\s]+)").expect("valid js frame pattern")
});

static CS_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat\s+([\w.$<>]+)\s*\([^)]*\)\s*(?:\[[^\]]*\]\s*)?in\s+([^:\s]+)")
        .expect("valid c# frame pattern")
});

/// Stateless classifier over the static exclusion and rule tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a line observed now.
    pub fn classify(&self, line: &str) -> Option<Issue> {
        self.classify_at(line, Utc::now())
    }

    /// Classify a line, stamping the resulting issue with `at`.
    pub fn classify_at(&self, line: &str, at: DateTime<Utc>) -> Option<Issue> {
        if line.trim().is_empty() || self.exclusion_for(line).is_some() {
            return None;
        }
        let rule = self.rule_for(line)?;

        let mut issue = Issue::new(rule.issue_type, rule.severity, infer_source(line), line, at);
        issue.resource_id = extract_resource_id(line);
        issue.stack_location = extract_stack_location(line);
        Some(issue)
    }

    /// Name of the exclusion that filters this line out, if any.
    pub fn exclusion_for(&self, line: &str) -> Option<&'static str> {
        EXCLUSIONS
            .iter()
            .find(|e| e.pattern.is_match(line))
            .map(|e| e.name)
    }

    /// First matching rule in priority order.
    pub fn rule_for(&self, line: &str) -> Option<&'static Rule> {
        RULES.iter().find(|r| r.is_match(line))
    }
}

/// Infer the issue source from marker substrings. Client markers win over
/// database markers, which win over network vocabulary; default is server.
pub fn infer_source(line: &str) -> Source {
    if CLIENT_MARKERS.is_match(line) {
        Source::Client
    } else if DATABASE_MARKERS.is_match(line) {
        Source::Database
    } else if NETWORK_MARKERS.is_match(line) {
        Source::Network
    } else {
        Source::Server
    }
}

/// Extract a correlation key (table/session/game/hand id) from the line.
pub fn extract_resource_id(line: &str) -> Option<String> {
    RESOURCE_ID
        .captures(line)
        .or_else(|| RESOURCE_ID_FALLBACK.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
        .filter(|id| !id.is_empty())
}

/// Parse a function + file pair from structured context, or from the first
/// JavaScript / C# stack frame found on the line.
pub fn extract_stack_location(line: &str) -> Option<StackLocation> {
    [&*STRUCTURED_LOCATION, &*CS_FRAME, &*JS_FRAME]
        .iter()
        .find_map(|re| re.captures(line))
        .and_then(|c| {
            Some(StackLocation {
                function: c.get(1)?.as_str().to_string(),
                file: c.get(2)?.as_str().to_string(),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pot_mismatch_is_critical_server_issue() {
        let issue = Classifier::new()
            .classify("ERROR: Pot mismatch detected tableId=table-7 expected=300 actual=250")
            .unwrap();
        assert_eq!(issue.issue_type, "pot_mismatch");
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.source, Source::Server);
        assert_eq!(issue.resource_id.as_deref(), Some("table-7"));
    }

    #[test]
    fn test_fix_success_lines_are_never_issues() {
        let c = Classifier::new();
        for line in [
            "[FIX SUCCESS] Pot mismatch resolved tableId=table-7",
            "FIX SUCCESS: chips lost on table 4 restored",
            "auto-fix applied: fatal error in award payout handler",
        ] {
            assert!(c.classify(line).is_none(), "{line}");
        }
    }

    #[test]
    fn test_own_logs_and_trace_noise_are_filtered() {
        let c = Classifier::new();
        assert_eq!(c.exclusion_for("[MONITOR] pot mismatch detected"), Some("self_log"));
        assert_eq!(c.exclusion_for("[DEBUG] pot mismatch check"), Some("trace_noise"));
        assert_eq!(c.exclusion_for("heartbeat ack from table 3 error=0"), Some("trace_noise"));
        assert_eq!(c.exclusion_for("[Heartbeat] seat 4 lost=0"), Some("trace_noise"));
        assert!(c.classify("[TRACE] timeout waiting for nothing").is_none());
    }

    #[test]
    fn test_errors_mentioning_heartbeat_still_classify() {
        let c = Classifier::new();
        let cases = [
            ("FATAL ERROR: pot mismatch during heartbeat reconcile tableId=t-4", "pot_mismatch"),
            ("ERROR websocket disconnected after heartbeat timeout tableId=t-4", "socket_disconnect"),
            ("Unhandled exception in keepalive handler: chips lost tableId=t-4", "chips_lost"),
        ];
        for (line, expected) in cases {
            let issue = c.classify(line).unwrap_or_else(|| panic!("dropped: {line}"));
            assert_eq!(issue.issue_type, expected, "{line}");
            assert_eq!(issue.resource_id.as_deref(), Some("t-4"));
        }
    }

    #[test]
    fn test_highest_severity_rule_wins() {
        // matches pot_mismatch (critical), timeout (medium) and general (low)
        let issue = Classifier::new()
            .classify("error: timeout while settling, pot mismatch on table 9")
            .unwrap();
        assert_eq!(issue.issue_type, "pot_mismatch");
        assert_eq!(issue.resource_id.as_deref(), Some("9"));
    }

    #[test]
    fn test_same_severity_earliest_rule_wins() {
        let rule = Classifier::new()
            .rule_for("invalid bet from player, socket error")
            .unwrap();
        assert_eq!(rule.issue_type, "bet_validation_failed");
    }

    #[test]
    fn test_source_inference() {
        assert_eq!(infer_source("[Unity] NullReferenceException in seat view"), Source::Client);
        assert_eq!(infer_source("postgres connection refused"), Source::Database);
        assert_eq!(infer_source("websocket closed unexpectedly ECONNRESET"), Source::Network);
        assert_eq!(infer_source("Error computing payout"), Source::Server);
        // client markers win over network vocabulary
        assert_eq!(infer_source("[CLIENT] socket error"), Source::Client);
    }

    #[test]
    fn test_type_is_rule_identifier() {
        let issue = Classifier::new()
            .classify("[Unity] NullReferenceException: Object reference not set")
            .unwrap();
        assert_eq!(issue.issue_type, "null_reference");
        assert_eq!(issue.severity, Severity::Medium);
        assert_eq!(issue.source, Source::Client);
    }

    #[test]
    fn test_unmatched_and_blank_lines() {
        let c = Classifier::new();
        assert!(c.classify("").is_none());
        assert!(c.classify("   ").is_none());
        assert!(c.classify("Player 4 joined table 2").is_none());
    }

    #[test]
    fn test_resource_id_extraction() {
        assert_eq!(
            extract_resource_id(r#"{"msg":"bad","tableId":"t-42"}"#).as_deref(),
            Some("t-42")
        );
        assert_eq!(extract_resource_id("session_id=abc123, retry").as_deref(), Some("abc123"));
        assert_eq!(extract_resource_id("table 12 stalled").as_deref(), Some("12"));
        assert_eq!(extract_resource_id("no ids here"), None);
    }

    #[test]
    fn test_stack_location_extraction() {
        let js = extract_stack_location("TypeError: x is not a function at calculatePot (/srv/game/pot.js:42:13)")
            .unwrap();
        assert_eq!(js.function, "calculatePot");
        assert_eq!(js.file, "/srv/game/pot.js");

        let structured =
            extract_stack_location(r#"pot error {"function":"settleHand","file":"hand.ts"}"#).unwrap();
        assert_eq!(structured.function, "settleHand");
        assert_eq!(structured.file, "hand.ts");

        let cs = extract_stack_location(
            "at PotView.Refresh () [0x00012] in Assets/Scripts/PotView.cs:88",
        )
        .unwrap();
        assert_eq!(cs.function, "PotView.Refresh");
        assert_eq!(cs.file, "Assets/Scripts/PotView.cs");
    }
}
