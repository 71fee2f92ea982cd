//! Local command-line adapter (C1, local kind).
//!
//! Spawns the external assistant as a child process, passing scalar flags
//! on the command line and structured payloads on stdin. Payloads are
//! filtered before being sent; the child is given a wall-clock deadline
//! and killed on expiry.

use crate::error::GatewayError;
use crate::types::{BackendDescriptor, BackendOutput, ChatRequest};
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const MAX_PAYLOAD_BYTES: usize = 10 * 1024;
const MAX_JSON_DEPTH: usize = 10;

pub struct LocalAdapter {
    descriptor: BackendDescriptor,
}

impl LocalAdapter {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub async fn execute(
        &self,
        request: &ChatRequest,
        credential_config_dir: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<BackendOutput, GatewayError> {
        let query = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if query.trim().is_empty() {
            return Err(GatewayError::Validation("empty query".to_string()));
        }

        let payload = json!({
            "query": query,
            "tools": request.tools,
            "context_files": request.context_files,
        });
        let payload_str = serde_json::to_string(&payload)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        validate_payload(&payload_str)?;

        let executable = self
            .descriptor
            .executable
            .as_deref()
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("local adapter missing executable")))?;

        let mut cmd = Command::new(executable);
        cmd.arg("--permission-mode").arg("default");
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(wd) = &request.working_directory {
            cmd.arg("--working-directory").arg(wd);
        }
        let config_dir = credential_config_dir
            .filter(|d| !d.is_empty())
            .or_else(|| self.descriptor.config_dir.as_deref().filter(|d| !d.is_empty()));
        if let Some(config_dir) = config_dir {
            cmd.arg("--config-dir").arg(config_dir);
        }
        if let Some(budget) = request.max_budget_usd {
            cmd.arg("--max-budget-usd").arg(budget.to_string());
        }
        if let Some(session_id) = &request.session_id {
            cmd.arg("--session-id").arg(session_id);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to spawn local backend: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload_str.as_bytes())
                .await
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        }

        let timeout_secs = if self.descriptor.timeout_secs > 0 { self.descriptor.timeout_secs } else { 120 };
        let deadline = Duration::from_secs(timeout_secs);

        let output = tokio::select! {
            res = tokio::time::timeout(deadline, child.wait_with_output()) => {
                match res {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(GatewayError::Internal(anyhow::anyhow!(e))),
                    Err(_) => return Err(GatewayError::Timeout),
                }
            }
            _ = cancel.cancelled() => {
                return Err(GatewayError::Timeout);
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        match serde_json::from_str::<BackendOutput>(&stdout) {
            Ok(mut parsed) => {
                if parsed.duration_ms == 0 {
                    parsed.duration_ms = duration_ms;
                }
                Ok(parsed)
            }
            Err(_) => Ok(BackendOutput {
                result: stdout,
                session_id: request.session_id.clone(),
                duration_ms,
                total_cost_usd: 0.0,
                usage: Default::default(),
                uuid: None,
                is_error: !output.status.success(),
                model_usage: None,
            }),
        }
    }

    /// Local adapters are always considered available; readiness is
    /// governed by the process pool's admission control, not a health
    /// probe (the external executable has no "list models" equivalent).
    pub async fn is_available(&self) -> bool {
        true
    }
}

/// Multi-layer filter for JSON payloads sent on the child's stdin, per
/// spec §4.1: size cap, control-character rejection, nesting-depth cap,
/// shell-metacharacter rejection.
fn validate_payload(payload: &str) -> Result<(), GatewayError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(GatewayError::Validation("payload exceeds size limit".to_string()));
    }
    if payload.bytes().any(|b| b == 0) || payload.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return Err(GatewayError::Validation("payload contains control characters".to_string()));
    }
    if json_depth(payload) > MAX_JSON_DEPTH {
        return Err(GatewayError::Validation("payload nesting too deep".to_string()));
    }
    for pattern in ["`", "$(", "&&", "||", ";", ">", "<"] {
        if payload.contains(pattern) {
            return Err(GatewayError::Validation(format!(
                "payload contains disallowed shell metacharacter: {pattern}"
            )));
        }
    }
    Ok(())
}

/// Scan brace/bracket balance to estimate nesting depth without a full parse.
fn json_depth(payload: &str) -> usize {
    let mut depth = 0usize;
    let mut max_depth = 0usize;
    for ch in payload.chars() {
        match ch {
            '{' | '[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max_depth
}
