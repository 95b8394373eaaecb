//! Zero-trust permission gate for tool calls.
//!
//! Every call is threat-scanned first, then checked against the caller's
//! role allow-list. Each decision lands in an audit log that can be
//! queried by session or agent.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, Mutex};

use crate::orchestration::tools::{ToolCall, ToolName};
use crate::{llog_debug, llog_warn};

/// Capability set a caller acts under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Orchestrator-level inspection only.
    Supervisor,
    /// Read-only research on behalf of a lane.
    Worker,
    Verifier,
    /// Executes an authorized plan; the only role allowed to mutate.
    Operator,
}

impl Role {
    pub fn allowed_tools(self) -> &'static [ToolName] {
        use ToolName::*;
        match self {
            Role::Supervisor => &[ReadFile, ListDirectory, Search],
            Role::Worker => &[ReadFile, ListDirectory, Search, WebSearch, WebFetch],
            Role::Verifier => &[
                ReadFile,
                ListDirectory,
                Search,
                WebSearch,
                WebFetch,
                LintCheck,
            ],
            Role::Operator => &ToolName::ALL,
        }
    }

    pub fn may_use(self, tool: ToolName) -> bool {
        self.allowed_tools().contains(&tool)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Supervisor => "supervisor",
            Role::Worker => "worker",
            Role::Verifier => "verifier",
            Role::Operator => "operator",
        };
        write!(f, "{}", s)
    }
}

/// Named content patterns that reject a call outright.
static THREAT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "destructive_shell",
            r"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+(/|~|\*|\$HOME)|\bmkfs(\.\w+)?\b|\bdd\s+if=/dev/|>\s*/dev/sd[a-z]",
        ),
        (
            "remote_script",
            r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
        ),
        ("fork_bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
        (
            "credential_path",
            r#"\.ssh/id_[a-z0-9]+|\.aws/credentials|/etc/shadow|\.netrc\b|(^|[/\s"'=])\.env\b"#,
        ),
        ("path_traversal", r"(\.\.[/\\]){2,}"),
        (
            "prompt_injection",
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions|disregard\s+(the\s+)?system\s+prompt",
        ),
        (
            "cloud_key",
            r"\bAKIA[0-9A-Z]{16}\b|\bsk-[A-Za-z0-9]{32,}|\bghp_[A-Za-z0-9]{36}\b",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).unwrap()))
    .collect()
});

/// Names of the threat patterns found in `text`.
pub fn scan_threats(text: &str) -> Vec<&'static str> {
    THREAT_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
        .collect()
}

/// Outcome of one authorization check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionDecision {
    pub approved: bool,
    pub reason: String,
    pub threats: Vec<String>,
}

/// One audited decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub role: Role,
    /// Tool name as requested; may be outside the known vocabulary.
    pub tool: String,
    pub approved: bool,
    pub reason: String,
    pub threats: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PermissionGate {
    audit: Mutex<Vec<PermissionRecord>>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize_tool_call(
        &self,
        session_id: &str,
        agent_id: &str,
        role: Role,
        call: &ToolCall,
    ) -> PermissionDecision {
        let serialized = serde_json::to_string(call).unwrap_or_default();
        let threats: Vec<String> = scan_threats(&serialized)
            .into_iter()
            .map(String::from)
            .collect();

        let decision = if !threats.is_empty() {
            PermissionDecision {
                approved: false,
                reason: format!("threat detected: {}", threats.join(", ")),
                threats,
            }
        } else if !role.may_use(call.tool) {
            PermissionDecision {
                approved: false,
                reason: format!("role {} may not call {}", role, call.tool),
                threats,
            }
        } else {
            PermissionDecision {
                approved: true,
                reason: format!("{} allowed for {}", call.tool, role),
                threats,
            }
        };

        if decision.approved {
            llog_debug!("permit {} {} {}", agent_id, role, call.tool);
        } else {
            llog_warn!("deny {} {} {}: {}", agent_id, role, call.tool, decision.reason);
        }

        self.record(PermissionRecord {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            tool: call.tool.to_string(),
            approved: decision.approved,
            reason: decision.reason.clone(),
            threats: decision.threats.clone(),
        });
        decision
    }

    /// Audit a call refused before authorization, such as an unknown tool
    /// or arguments that fail the schema.
    pub fn record_rejection(
        &self,
        session_id: &str,
        agent_id: &str,
        role: Role,
        tool: &str,
        reason: &str,
    ) {
        llog_warn!("reject {} {} {}: {}", agent_id, role, tool, reason);
        self.record(PermissionRecord {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            role,
            tool: tool.to_string(),
            approved: false,
            reason: reason.to_string(),
            threats: Vec::new(),
        });
    }

    fn record(&self, entry: PermissionRecord) {
        if let Ok(mut audit) = self.audit.lock() {
            audit.push(entry);
        }
    }

    fn query(&self, pred: impl Fn(&PermissionRecord) -> bool) -> Vec<PermissionRecord> {
        self.audit
            .lock()
            .map(|audit| audit.iter().filter(|r| pred(r)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn audit_log(&self) -> Vec<PermissionRecord> {
        self.query(|_| true)
    }

    pub fn audit_for_session(&self, session_id: &str) -> Vec<PermissionRecord> {
        self.query(|r| r.session_id == session_id)
    }

    pub fn audit_for_agent(&self, agent_id: &str) -> Vec<PermissionRecord> {
        self.query(|r| r.agent_id == agent_id)
    }

    pub fn denials(&self) -> Vec<PermissionRecord> {
        self.query(|r| !r.approved)
    }
}
