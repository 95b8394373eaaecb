//! Tool-execution boundary.
//!
//! The core never interprets tool semantics. It knows the fixed vocabulary
//! in [`ToolName`], validates argument shapes, and hands calls to a
//! [`ToolExecutor`]. [`ToolRunner`] is the only path lanes use to reach the
//! executor: schema check, permission gate, cache, execution with retries,
//! then cache invalidation after mutations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::guard::cache::TtlCache;
use crate::guard::permission::{PermissionGate, Role};
use crate::util::{retry_with_backoff, RetryConfig};
use crate::{llog_debug, Error, Result};

/// Fixed tool vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteFile,
    EditFile,
    DeleteFile,
    ListDirectory,
    Search,
    RunCommand,
    WebSearch,
    WebFetch,
    LintCheck,
}

impl ToolName {
    pub const ALL: [ToolName; 10] = [
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::EditFile,
        ToolName::DeleteFile,
        ToolName::ListDirectory,
        ToolName::Search,
        ToolName::RunCommand,
        ToolName::WebSearch,
        ToolName::WebFetch,
        ToolName::LintCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::EditFile => "edit_file",
            ToolName::DeleteFile => "delete_file",
            ToolName::ListDirectory => "list_directory",
            ToolName::Search => "search",
            ToolName::RunCommand => "run_command",
            ToolName::WebSearch => "web_search",
            ToolName::WebFetch => "web_fetch",
            ToolName::LintCheck => "lint_check",
        }
    }

    /// Tools that change the workspace.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            ToolName::WriteFile | ToolName::EditFile | ToolName::DeleteFile | ToolName::RunCommand
        )
    }

    /// Idempotent reads whose results may be memoized.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            ToolName::ReadFile | ToolName::ListDirectory | ToolName::Search
        )
    }

    /// Argument schema: `(field, type, required)`.
    pub fn schema(self) -> &'static [(&'static str, ArgType, bool)] {
        use ArgType::*;
        match self {
            ToolName::ReadFile => &[("path", Str, true)],
            ToolName::WriteFile => &[("path", Str, true), ("content", Str, true)],
            ToolName::EditFile => &[
                ("path", Str, true),
                ("old_text", Str, true),
                ("new_text", Str, true),
            ],
            ToolName::DeleteFile => &[("path", Str, true)],
            ToolName::ListDirectory => &[("path", Str, true), ("recursive", Bool, false)],
            ToolName::Search => &[
                ("query", Str, true),
                ("path", Str, false),
                ("max_results", Num, false),
            ],
            ToolName::RunCommand => &[
                ("command", Str, true),
                ("cwd", Str, false),
                ("timeout_secs", Num, false),
            ],
            ToolName::WebSearch => &[("query", Str, true), ("max_results", Num, false)],
            ToolName::WebFetch => &[("url", Str, true)],
            ToolName::LintCheck => &[("path", Str, false)],
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::SchemaViolation {
                tool: s.to_string(),
                detail: "unknown tool".to_string(),
            })
    }
}

/// JSON type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Num,
    Bool,
}

impl ArgType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ArgType::Str => value.is_string(),
            ArgType::Num => value.is_number(),
            ArgType::Bool => value.is_boolean(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ArgType::Str => "string",
            ArgType::Num => "number",
            ArgType::Bool => "boolean",
        }
    }
}

/// A request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: ToolName,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: ToolName, args: Value) -> Self {
        Self { tool, args }
    }

    /// The path argument, when the call has one.
    pub fn path(&self) -> Option<&str> {
        self.args.get("path").and_then(Value::as_str)
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.tool, self.args)
    }

    /// Check `args` against the tool's schema.
    pub fn validate(&self) -> Result<()> {
        let violation = |detail: String| Error::SchemaViolation {
            tool: self.tool.to_string(),
            detail,
        };
        let obj = self
            .args
            .as_object()
            .ok_or_else(|| violation("arguments must be an object".to_string()))?;

        for &(field, kind, required) in self.tool.schema() {
            match obj.get(field) {
                Some(value) if !kind.matches(value) => {
                    return Err(violation(format!("'{}' must be a {}", field, kind.name())));
                }
                None if required => {
                    return Err(violation(format!("missing required field '{}'", field)));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Tool call as models emit it: the name is not yet checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    pub tool: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
}

impl RawToolCall {
    pub fn resolve(&self) -> Result<ToolCall> {
        Ok(ToolCall::new(self.tool.parse()?, self.args.clone()))
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// A tool call together with what came of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub tool: String,
    pub args: Value,
    pub outcome: ToolOutcome,
    #[serde(default)]
    pub cached: bool,
    /// Refused before reaching the executor.
    #[serde(default)]
    pub denied: bool,
}

impl ToolRecord {
    fn new(call: &ToolCall, outcome: ToolOutcome, cached: bool) -> Self {
        Self {
            tool: call.tool.to_string(),
            args: call.args.clone(),
            outcome,
            cached,
            denied: false,
        }
    }

    fn denied(tool: &str, args: &Value, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            args: args.clone(),
            outcome: ToolOutcome::failure(reason),
            cached: false,
            denied: true,
        }
    }
}

/// Executes tool calls against a real environment.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome>;
}

/// Records calls and reports success without touching anything.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    calls: Mutex<Vec<ToolCall>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolExecutor for DryRunExecutor {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        Ok(ToolOutcome::ok(format!("dry-run {} {}", call.tool, call.args)))
    }
}

/// Who is asking for a tool call.
#[derive(Debug, Clone)]
pub struct Caller<'a> {
    pub session_id: &'a str,
    pub agent_id: &'a str,
    pub role: Role,
}

/// Composes schema validation, permissions, caching and execution.
pub struct ToolRunner {
    executor: Arc<dyn ToolExecutor>,
    gate: Arc<PermissionGate>,
    cache: Arc<TtlCache>,
    retry: RetryConfig,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        gate: Arc<PermissionGate>,
        cache: Arc<TtlCache>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            gate,
            cache,
            retry,
            timeout,
        }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    /// Run one call. Never errors: every rejection becomes a failed outcome.
    pub async fn run(&self, caller: &Caller<'_>, call: &ToolCall) -> ToolRecord {
        if let Err(e) = call.validate() {
            return self.reject(caller, call.tool.as_str(), &call.args, &e);
        }

        let decision =
            self.gate
                .authorize_tool_call(caller.session_id, caller.agent_id, caller.role, call);
        if !decision.approved {
            return ToolRecord::denied(call.tool.as_str(), &call.args, decision.reason);
        }

        let key = call.cache_key();
        if call.tool.is_cacheable() {
            if let Some(hit) = self.cache.get(&key) {
                llog_debug!("cache hit for {}", key);
                return ToolRecord::new(call, ToolOutcome::ok(hit), true);
            }
        }

        let outcome =
            match retry_with_backoff(&self.retry, self.timeout, || self.executor.execute(call))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => ToolOutcome::failure(e.to_string()),
            };

        if outcome.success {
            if call.tool.is_cacheable() {
                if let Err(e) = self.cache.set(&key, &outcome.output) {
                    llog_debug!("not caching {}: {}", call.tool, e);
                }
            }
            if call.tool.is_mutating() {
                match call.path() {
                    Some(path) => {
                        self.cache.invalidate(path);
                    }
                    // A shell command may touch anything.
                    None => self.cache.clear(),
                }
            }
        }

        ToolRecord::new(call, outcome, false)
    }

    /// Resolve and run a model-emitted call.
    pub async fn run_raw(&self, caller: &Caller<'_>, raw: &RawToolCall) -> ToolRecord {
        match raw.resolve() {
            Ok(call) => self.run(caller, &call).await,
            Err(e) => self.reject(caller, &raw.tool, &raw.args, &e),
        }
    }

    fn reject(&self, caller: &Caller<'_>, tool: &str, args: &Value, error: &Error) -> ToolRecord {
        let reason = error.to_string();
        self.gate
            .record_rejection(caller.session_id, caller.agent_id, caller.role, tool, &reason);
        ToolRecord::denied(tool, args, reason)
    }
}
