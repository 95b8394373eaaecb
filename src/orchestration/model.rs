//! Model-invocation boundary.
//!
//! [`ModelClient`] is the text-completion seam. [`ModelGateway`] wraps a
//! client with per-attempt timeouts, bounded retries, budget accounting and
//! run-wide cancellation; lanes only ever call models through it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::guard::{BudgetTracker, UsageReceipt};
use crate::util::{estimate_tokens, retry_with_backoff, RetryConfig};
use crate::{llog_error, llog_trace, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw completion text plus provider-reported usage, when available.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    /// Reported usage, or a chars/4 estimate over prompt and reply.
    pub fn usage_or_estimate(&self, messages: &[ChatMessage]) -> TokenUsage {
        self.usage.unwrap_or_else(|| TokenUsage {
            input_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
            output_tokens: estimate_tokens(&self.content),
        })
    }
}

/// A text-completion backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<ModelReply>;
}

/// Call `client` with a per-attempt timeout and exponential backoff.
pub async fn invoke_with_retry(
    client: &dyn ModelClient,
    model: &str,
    messages: &[ChatMessage],
    retry: &RetryConfig,
    timeout: Duration,
) -> Result<ModelReply> {
    retry_with_backoff(retry, timeout, || client.invoke(model, messages)).await
}

/// A metered reply: the text and the usage committed for it.
#[derive(Debug, Clone)]
pub struct MeteredReply {
    pub content: String,
    pub receipt: UsageReceipt,
}

/// Budget-aware, cancellable access to a [`ModelClient`].
#[derive(Clone)]
pub struct ModelGateway {
    client: Arc<dyn ModelClient>,
    budget: Arc<BudgetTracker>,
    retry: RetryConfig,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ModelGateway {
    pub fn new(
        client: Arc<dyn ModelClient>,
        budget: Arc<BudgetTracker>,
        retry: RetryConfig,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            budget,
            retry,
            timeout,
            cancel,
        }
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Invoke `model`, then commit its usage.
    ///
    /// # Errors
    /// - `Cancelled` once the run has been cancelled
    /// - `BudgetExhausted` when the prompt alone, or the committed usage,
    ///   would break a cap; the run is cancelled before returning
    /// - the client's error once retries are spent
    pub async fn call(&self, model: &str, messages: &[ChatMessage]) -> Result<MeteredReply> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("run cancelled".to_string()));
        }

        let prompt_tokens: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        self.budget
            .ensure_affordable(model, prompt_tokens)
            .map_err(|e| self.exhausted(e))?;

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(Error::Cancelled("run cancelled".to_string()));
            }
            reply = invoke_with_retry(self.client.as_ref(), model, messages, &self.retry, self.timeout) => reply?,
        };
        llog_trace!("model {} replied: {}", model, crate::util::truncate(&reply.content, 500));

        let usage = reply.usage_or_estimate(messages);
        let receipt = self
            .budget
            .record_usage(model, usage.input_tokens as i64, usage.output_tokens as i64)
            .map_err(|e| self.exhausted(e))?;

        Ok(MeteredReply {
            content: reply.content,
            receipt,
        })
    }

    fn exhausted(&self, err: Error) -> Error {
        if err.is_budget_exhausted() {
            llog_error!("{}; cancelling run", err);
            self.cancel.cancel();
        }
        err
    }
}

/// Shape of `claude -p --output-format json` output.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Model client backed by an external headless CLI (`claude -p` style).
#[derive(Debug, Clone)]
pub struct CommandModel {
    binary: PathBuf,
    extra_args: Vec<String>,
    cwd: PathBuf,
}

impl CommandModel {
    /// Resolve `command` (binary plus optional arguments) on `PATH`.
    ///
    /// # Errors
    /// `BinaryNotFound` if the binary cannot be located.
    pub fn new(command: &str, cwd: &Path) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::Validation("empty model command".to_string()))?;
        let binary = which::which(name).map_err(|_| Error::BinaryNotFound(name.to_string()))?;
        Ok(Self::with_binary(binary, parts.map(String::from).collect(), cwd))
    }

    pub fn with_binary(binary: PathBuf, extra_args: Vec<String>, cwd: &Path) -> Self {
        Self {
            binary,
            extra_args,
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Flatten a conversation into one prompt for a single-shot CLI.
    pub fn render_prompt(messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .map(|m| match m.role {
                ChatRole::System => format!("[system]\n{}", m.content),
                ChatRole::User => m.content.clone(),
                ChatRole::Assistant => format!("[assistant]\n{}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Parse CLI stdout: the JSON envelope when present, else raw text.
    pub fn parse_output(model: &str, stdout: &str) -> Result<ModelReply> {
        let Ok(raw) = serde_json::from_str::<RawResponse>(stdout.trim()) else {
            return Ok(ModelReply::text(stdout.trim()));
        };

        if raw.is_error || raw.subtype.as_deref() == Some("error") {
            return Err(Error::ModelCall {
                model: model.to_string(),
                message: raw
                    .error
                    .or(raw.result)
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        Ok(ModelReply {
            content: raw.result.unwrap_or_default(),
            usage: raw.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        })
    }
}

#[async_trait]
impl ModelClient for CommandModel {
    async fn invoke(&self, model: &str, messages: &[ChatMessage]) -> Result<ModelReply> {
        let output = Command::new(&self.binary)
            .args(&self.extra_args)
            .arg("-p")
            .arg(Self::render_prompt(messages))
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(model)
            .current_dir(&self.cwd)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ModelCall {
                model: model.to_string(),
                message: if stderr.trim().is_empty() {
                    format!("exit code {}", output.status.code().unwrap_or(-1))
                } else {
                    stderr.trim().to_string()
                },
            });
        }
        Self::parse_output(model, &stdout)
    }
}
