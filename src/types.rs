//! Shared data types for the gateway.
//!
//! Mirrors the request/response shapes consumers speak (OpenAI-compatible
//! chat completions) and the internal entities the core components
//! persist: backend descriptors, credentials, client sessions, usage
//! records, blocks, and log records.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use validator::Validate;

/// Role of a single chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single turn in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// The validated chat-completion request accepted at the boundary.
///
/// Validation beyond what `validator` expresses (message-list shape, path
/// rules, size caps) is performed by [`crate::lifecycle::validate_request`]
/// since it needs cross-field and config-dependent checks.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    pub working_directory: Option<String>,
    pub max_budget_usd: Option<f64>,
    /// Extra working-directory roots the backend may read from, subject to
    /// the same path rules as `context_files`.
    #[serde(default)]
    pub add_dirs: Vec<String>,
    /// Named MCP server configurations to make available to the backend.
    #[serde(default)]
    pub mcp_config: Vec<String>,
    /// Provider-side beta feature flags to forward.
    #[serde(default)]
    pub betas: Vec<String>,
    /// Tool allowlist, narrowing `tools` further when non-empty.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tool denylist, applied after `allowed_tools`.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Explicit backend selection, set from the `/v1/{backend_name}/...` path
    /// segment by the HTTP layer; never present in the request body itself.
    #[serde(skip)]
    pub backend: Option<String>,
}

/// Top-level field names the wire format accepts. Used to reject unknown
/// fields in strict mode (spec.md:255) before the lenient `serde` derive
/// above would otherwise just drop them.
const KNOWN_REQUEST_FIELDS: &[&str] = &[
    "messages",
    "model",
    "temperature",
    "max_tokens",
    "stream",
    "session_id",
    "tools",
    "context_files",
    "working_directory",
    "max_budget_usd",
    "add_dirs",
    "mcp_config",
    "betas",
    "allowed_tools",
    "disallowed_tools",
];

impl ChatRequest {
    /// `tools_required` per spec §4.4 step 2.
    pub fn tools_required(&self) -> bool {
        !self.tools.is_empty() || self.working_directory.is_some() || !self.context_files.is_empty()
    }

    /// Rough character count across every message, used by cost estimation.
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    /// Checks a request body's raw JSON object for fields outside
    /// [`KNOWN_REQUEST_FIELDS`], the way strict mode requires. A no-op when
    /// the body isn't a JSON object (ordinary deserialization will reject
    /// that shape on its own).
    pub fn reject_unknown_fields(raw: &serde_json::Value) -> Result<(), String> {
        if let Some(obj) = raw.as_object() {
            for key in obj.keys() {
                if !KNOWN_REQUEST_FIELDS.contains(&key.as_str()) {
                    return Err(format!("unknown field: {key}"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub role: MessageRole,
    pub content: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ChatUsage,
    pub session_id: Option<String>,
    /// Set when this response was served after a fallback of any kind.
    #[serde(default)]
    pub degraded: bool,
}

/// Kind of backend a descriptor configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

/// Immutable backend configuration, constructed once from [`crate::config::Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub cost_per_unit: f64,
    pub supports_tools: bool,

    // local-kind fields
    pub config_dir: Option<String>,
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub timeout_secs: u64,
    pub executable: Option<String>,

    // remote-kind fields
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub credential_env_name: Option<String>,
    pub provider_tag: Option<String>,
    /// True when the provider has no `system` role and a leading system
    /// message must be merged as a prefixed first user message (spec §4.1).
    #[serde(default)]
    pub merge_system_as_user: bool,
}

/// Structured record produced by the local child process on exit, or
/// synthesised by the remote adapter from a provider response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendOutput {
    pub result: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    pub usage: UsageFields,
    pub uuid: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub model_usage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageFields {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl UsageFields {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Credential status derived from usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Available,
    Approaching,
    Limited,
    Cooldown,
}

/// A billable identity under which local-backend invocations run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub email: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub config_dir: String,
    pub weekly_budget: f64,
    pub weekly_used: f64,
    pub current_block_id: Option<String>,
    pub current_block_cost: f64,
    pub block_start: Option<chrono::DateTime<chrono::Utc>>,
    pub block_end: Option<chrono::DateTime<chrono::Utc>>,
    pub assigned_clients: HashSet<String>,
    pub max_clients: u32,
    pub health_score: f64,
    pub status: CredentialStatus,
    pub burn_rate_usd_per_hour: f64,
    pub tokens_per_minute: f64,
    pub last_usage_update_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub last_request_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Status of the binding between a caller and a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSession {
    pub id: String,
    pub subscription_id: String,
    pub allocated_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub status: SessionStatus,
    pub session_cost: f64,
    pub session_tokens: u64,
    pub request_count: u64,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// An immutable record of one unit of local-backend usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub subscription_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub block_id: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub session_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub request_uuid: Option<String>,
}

/// Derived view over the credential's currently-open block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: String,
    pub cost_so_far: f64,
    pub cost_per_hour: f64,
    pub projected_cost: f64,
    pub remaining_minutes: f64,
}

/// One entry in the append-only request log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub backend_name: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub degraded: bool,
    pub error: Option<String>,
    pub request_summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_required_true_for_working_directory() {
        let req = ChatRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: "hi".into() }],
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            session_id: None,
            tools: vec![],
            context_files: vec![],
            working_directory: Some("/tmp".into()),
            max_budget_usd: None,
            add_dirs: vec![],
            mcp_config: vec![],
            betas: vec![],
            allowed_tools: vec![],
            disallowed_tools: vec![],
            backend: None,
        };
        assert!(req.tools_required());
    }

    #[test]
    fn tools_required_false_for_plain_chat() {
        let req = ChatRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: "hi".into() }],
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            session_id: None,
            tools: vec![],
            context_files: vec![],
            working_directory: None,
            max_budget_usd: None,
            add_dirs: vec![],
            mcp_config: vec![],
            betas: vec![],
            allowed_tools: vec![],
            disallowed_tools: vec![],
            backend: None,
        };
        assert!(!req.tools_required());
    }

    #[test]
    fn usage_fields_total_sums_all_four() {
        let u = UsageFields {
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_tokens: 3,
            cache_read_tokens: 4,
        };
        assert_eq!(u.total(), 10);
    }
}
