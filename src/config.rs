//! Configuration loading.
//!
//! Mirrors the teacher's environment-variable loading style: small parsing
//! helpers (`env_or`, `bool_env`, `parse_csv`) plus a top-level `Config`
//! struct assembled once in `Config::from_env()`. Backend descriptors,
//! credentials and notification rules are list-shaped, so they are read as
//! JSON from a single env var each rather than as one var per field.

use crate::types::{BackendDescriptor, BackendKind};
use serde::{Deserialize, Serialize};
use std::env;

pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

fn env_f64(key: &str, fallback: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

fn env_usize(key: &str, fallback: usize) -> usize {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

/// Configured fields for a credential, read from storage/merged at startup
/// per spec §4.6. Runtime fields (`weekly_used`, `health_score`, ...) are
/// not configured — they live only in the persisted `Credential` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    pub email: String,
    #[serde(rename = "type", default = "default_credential_type")]
    pub kind: String,
    pub config_dir: String,
    pub weekly_budget: f64,
    pub max_clients: u32,
}

fn default_credential_type() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationRuleType {
    UsageThreshold,
    Failover,
    Rotation,
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Log,
    Webhook,
    ExternalErrorSink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    #[serde(rename = "type")]
    pub kind: NotificationRuleType,
    pub threshold: Option<f64>,
    pub channels: Vec<NotificationChannel>,
    pub enabled: bool,
}

/// Thresholds the subscription manager and allocation balancer use to
/// judge a credential's eligibility (spec §4.6, §4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafeguardThresholds {
    pub health_check_weekly_ratio: f64,
    pub allocation_weekly_ratio: f64,
    pub status_limited_ratio: f64,
    pub status_approaching_ratio: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RebalanceConfig {
    pub interval_secs: u64,
    pub cost_gap_threshold: f64,
    pub max_clients_per_cycle: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolDefaults {
    pub queue_item_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeadlineConfig {
    pub remote_execute_secs: u64,
    pub remote_availability_secs: u64,
    pub local_default_secs: u64,
    pub registry_availability_secs: u64,
    pub webhook_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageConfig {
    pub max_entries: usize,
    pub eviction_batch_percent: f64,
    pub subscription_cache_size: usize,
    pub session_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub strict: bool,
    pub max_context_files: usize,
    pub max_tool_list: usize,
    pub max_add_dirs: usize,
    pub max_mcp_config: usize,
    pub max_betas: usize,
    pub max_content_length_bytes: u64,
}

/// Top-level gateway configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_address: String,
    pub json_limit: usize,
    pub allowed_origins: Vec<String>,

    pub backends: Vec<BackendDescriptor>,
    pub credentials: Vec<CredentialConfig>,
    pub notification_rules: Vec<NotificationRule>,
    /// Target URL for the `webhook` notification channel. No channel fires
    /// if unset, regardless of rule configuration.
    pub webhook_url: Option<String>,

    pub fallback_enabled: bool,
    pub safeguards: SafeguardThresholds,
    pub rebalance: RebalanceConfig,
    pub pool_defaults: PoolDefaults,
    pub deadlines: DeadlineConfig,
    pub storage: StorageConfig,
    pub validation: ValidationConfig,

    pub stale_session_idle_ms: i64,
    pub stale_ticker_interval_secs: u64,

    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: usize,
    pub log_store_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let allowed_origins_str = env::var("ALLOWED_ORIGINS").ok();

        Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            json_limit: env_usize("JSON_LIMIT", 1024 * 1024),
            allowed_origins: parse_csv(allowed_origins_str.as_deref()),

            backends: load_backends(),
            credentials: load_credentials(),
            notification_rules: load_notification_rules(),
            webhook_url: env::var("NOTIFICATION_WEBHOOK_URL").ok(),

            fallback_enabled: bool_env("FALLBACK_ENABLED", true),
            safeguards: SafeguardThresholds {
                health_check_weekly_ratio: env_f64("HEALTH_CHECK_WEEKLY_RATIO", 0.95),
                allocation_weekly_ratio: env_f64("ALLOCATION_WEEKLY_RATIO", 0.85),
                status_limited_ratio: env_f64("STATUS_LIMITED_RATIO", 0.95),
                status_approaching_ratio: env_f64("STATUS_APPROACHING_RATIO", 0.8),
            },
            rebalance: RebalanceConfig {
                interval_secs: env_u64("REBALANCE_INTERVAL_SECS", 300),
                cost_gap_threshold: env_f64("REBALANCE_COST_GAP_THRESHOLD", 5.0),
                max_clients_per_cycle: env_u64("REBALANCE_MAX_CLIENTS_PER_CYCLE", 3) as u32,
            },
            pool_defaults: PoolDefaults {
                queue_item_timeout_secs: env_u64("POOL_QUEUE_ITEM_TIMEOUT_SECS", 30),
                sweep_interval_secs: env_u64("POOL_SWEEP_INTERVAL_SECS", 5),
                shutdown_grace_secs: env_u64("POOL_SHUTDOWN_GRACE_SECS", 30),
            },
            deadlines: DeadlineConfig {
                remote_execute_secs: env_u64("REMOTE_EXECUTE_TIMEOUT_SECS", 60),
                remote_availability_secs: env_u64("REMOTE_AVAILABILITY_TIMEOUT_SECS", 10),
                local_default_secs: env_u64("LOCAL_DEFAULT_TIMEOUT_SECS", 120),
                registry_availability_secs: env_u64("REGISTRY_AVAILABILITY_TIMEOUT_SECS", 5),
                webhook_secs: env_u64("WEBHOOK_TIMEOUT_SECS", 10),
            },
            storage: StorageConfig {
                max_entries: env_usize("STORAGE_MAX_ENTRIES", 100_000),
                eviction_batch_percent: env_f64("STORAGE_EVICTION_BATCH_PERCENT", 0.10),
                subscription_cache_size: env_usize("SUBSCRIPTION_CACHE_SIZE", 100),
                session_cache_size: env_usize("SESSION_CACHE_SIZE", 1000),
            },
            validation: ValidationConfig {
                strict: bool_env("STRICT_VALIDATION", true),
                max_context_files: env_usize("MAX_CONTEXT_FILES", 100),
                max_tool_list: env_usize("MAX_TOOL_LIST", 50),
                max_add_dirs: env_usize("MAX_ADD_DIRS", 20),
                max_mcp_config: env_usize("MAX_MCP_CONFIG", 20),
                max_betas: env_usize("MAX_BETAS", 10),
                max_content_length_bytes: env_u64("MAX_CONTENT_LENGTH_BYTES", 1024 * 1024),
            },

            stale_session_idle_ms: env_u64("STALE_SESSION_IDLE_MS", 15 * 60 * 1000) as i64,
            stale_ticker_interval_secs: env_u64("STALE_TICKER_INTERVAL_SECS", 60),

            rate_limit_window_secs: env_u64("RATE_LIMIT_WINDOW_SECS", 60),
            rate_limit_max_requests: env_usize("RATE_LIMIT_MAX_REQUESTS", 60),
            log_store_capacity: env_usize("LOG_STORE_CAPACITY", 10_000),
        }
    }
}

fn load_backends() -> Vec<BackendDescriptor> {
    match env::var("BACKENDS_JSON") {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to parse BACKENDS_JSON, using defaults");
            default_backends()
        }),
        Err(_) => default_backends(),
    }
}

fn default_backends() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor {
            name: "assistant-cli".to_string(),
            kind: BackendKind::Local,
            cost_per_unit: 0.0,
            supports_tools: true,
            config_dir: Some(env_or("LOCAL_CONFIG_DIR", "")),
            max_concurrent: env_usize("LOCAL_MAX_CONCURRENT", 2),
            queue_depth: env_usize("LOCAL_QUEUE_DEPTH", 4),
            timeout_secs: env_u64("LOCAL_TIMEOUT_SECS", 120),
            executable: Some(env_or("LOCAL_EXECUTABLE", "assistant")),
            base_url: None,
            model: None,
            credential_env_name: None,
            provider_tag: None,
            merge_system_as_user: false,
        },
        BackendDescriptor {
            name: "openai-compatible".to_string(),
            kind: BackendKind::Remote,
            cost_per_unit: env_f64("REMOTE_COST_PER_UNIT", 0.002),
            supports_tools: false,
            config_dir: None,
            max_concurrent: 0,
            queue_depth: 0,
            timeout_secs: 0,
            executable: None,
            base_url: Some(env_or("REMOTE_BASE_URL", "https://api.openai.com/v1")),
            model: Some(env_or("REMOTE_MODEL", "gpt-4o-mini")),
            credential_env_name: Some(env_or("REMOTE_CREDENTIAL_ENV_NAME", "OPENAI_API_KEY")),
            provider_tag: Some("openai".to_string()),
            merge_system_as_user: bool_env("REMOTE_MERGE_SYSTEM_AS_USER", false),
        },
    ]
}

fn load_credentials() -> Vec<CredentialConfig> {
    match env::var("CREDENTIALS_JSON") {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to parse CREDENTIALS_JSON, using none");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

fn load_notification_rules() -> Vec<NotificationRule> {
    match env::var("NOTIFICATIONS_JSON") {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to parse NOTIFICATIONS_JSON, using defaults");
            default_notification_rules()
        }),
        Err(_) => default_notification_rules(),
    }
}

fn default_notification_rules() -> Vec<NotificationRule> {
    vec![
        NotificationRule {
            kind: NotificationRuleType::UsageThreshold,
            threshold: Some(0.8),
            channels: vec![NotificationChannel::Log],
            enabled: true,
        },
        NotificationRule {
            kind: NotificationRuleType::UsageThreshold,
            threshold: Some(0.95),
            channels: vec![NotificationChannel::Log, NotificationChannel::Webhook],
            enabled: true,
        },
    ]
}
