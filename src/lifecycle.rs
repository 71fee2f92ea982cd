//! Request lifecycle (C12): validate, correlate, route, allocate, execute,
//! record usage, log, respond.
//!
//! Grounded on `skynet-agent`'s `pipeline/process.rs` for the overall
//! validate-build-run-persist shape (build a decision, run it, fire
//! bookkeeping off to the side) and on `tollbooth`'s streaming route for
//! the SSE chunk-and-forward shape in [`stream_chat_completion`].

use crate::balancer::{AllocationBalancer, Selection};
use crate::config::ValidationConfig;
use crate::error::GatewayError;
use crate::health;
use crate::log_store::LogStore;
use crate::notify::NotificationManager;
use crate::registry::Registry;
use crate::router::{self, Decision, ExecutionResult};
use crate::session::SessionStore;
use crate::subscription::SubscriptionManager;
use crate::types::{BackendKind, ChatChoice, ChatRequest, ChatResponse, ChatUsage, LogRecord, MessageRole};
use crate::usage::UsageTracker;
use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Everything [`handle`] and [`stream`] need, gathered once at startup and
/// shared behind an `Arc` (the teacher's `AppState` shape, split so the
/// HTTP layer doesn't have to know about every component individually).
pub struct Lifecycle {
    pub registry: Arc<Registry>,
    pub balancer: Arc<AllocationBalancer>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub sessions: Arc<SessionStore>,
    pub usage: Arc<UsageTracker>,
    pub notify: Arc<NotificationManager>,
    pub log_store: Arc<LogStore>,
    pub validation: ValidationConfig,
}

/// Cross-field and config-dependent checks the `validator` derive on
/// [`ChatRequest`] can't express: message-list shape, session id shape,
/// path rules, and size caps.
pub fn validate_request(request: &ChatRequest, config: &ValidationConfig) -> Result<(), GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::Validation("messages must not be empty".to_string()));
    }
    if !request.messages.iter().any(|m| m.role == MessageRole::User) {
        return Err(GatewayError::Validation("messages must include at least one user turn".to_string()));
    }

    if let Some(session_id) = &request.session_id {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(GatewayError::Validation("session_id must be ASCII alphanumerics and hyphens".to_string()));
        }
    }

    if request.context_files.len() > config.max_context_files {
        return Err(GatewayError::Validation("context_files exceeds the configured limit".to_string()));
    }
    if request.tools.len() > config.max_tool_list {
        return Err(GatewayError::Validation("tools exceeds the configured limit".to_string()));
    }
    if request.allowed_tools.len() > config.max_tool_list {
        return Err(GatewayError::Validation("allowed_tools exceeds the configured limit".to_string()));
    }
    if request.disallowed_tools.len() > config.max_tool_list {
        return Err(GatewayError::Validation("disallowed_tools exceeds the configured limit".to_string()));
    }
    if request.add_dirs.len() > config.max_add_dirs {
        return Err(GatewayError::Validation("add_dirs exceeds the configured limit".to_string()));
    }
    if request.mcp_config.len() > config.max_mcp_config {
        return Err(GatewayError::Validation("mcp_config exceeds the configured limit".to_string()));
    }
    if request.betas.len() > config.max_betas {
        return Err(GatewayError::Validation("betas exceeds the configured limit".to_string()));
    }
    for path in request.context_files.iter().chain(request.add_dirs.iter()).chain(request.working_directory.iter()) {
        validate_path(path)?;
    }

    Ok(())
}

/// Rejects `..` traversal segments and absolute paths rooted outside any
/// sandbox (a bare `/...`), per spec §4.1's path rules. No symlink
/// canonicalization is attempted (DESIGN.md, Open Question).
fn validate_path(path: &str) -> Result<(), GatewayError> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(GatewayError::Validation(format!("path traverses outside its root: {path}")));
    }
    if path.starts_with('/') {
        return Err(GatewayError::Validation(format!("absolute paths are not permitted: {path}")));
    }
    Ok(())
}

impl Lifecycle {
    /// Correlates a session, routes, allocates a credential when the
    /// chosen backend is local, executes, records usage and logs the
    /// result. Usage recording is fire-and-forget: a failure there must
    /// never fail a request that otherwise succeeded.
    pub async fn handle(
        &self,
        mut request: ChatRequest,
        client_ip: Option<String>,
        user_agent: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        validate_request(&request, &self.validation)?;

        let client_id = request.session_id.clone();
        let decision = router::route(&self.registry, &request).await;

        let (credential_config_dir, subscription_id, minted_client_id) =
            self.allocate_if_local(&decision, &client_id, client_ip, user_agent).await?;

        let mut degraded = matches!(&decision, Decision::Reject(_));
        let exec = router::execute(&self.registry, decision, &request, credential_config_dir.as_deref(), cancel).await;

        let exec = match exec {
            Ok(exec) => exec,
            Err(e) => {
                if let Some(sub_id) = &subscription_id {
                    self.balancer.deallocate(minted_client_id.as_deref().unwrap_or(sub_id)).await;
                }
                self.log_error(&request, &e).await;
                return Err(e);
            }
        };
        degraded |= exec.degraded;

        let effective_client_id = minted_client_id.or(client_id).or(exec.output.session_id.clone());

        if let Some(sub_id) = &subscription_id {
            self.record_usage(sub_id, &exec, effective_client_id.clone());
        }

        request.session_id = exec.output.session_id.clone().or(effective_client_id);
        Ok(self.to_response(&request, exec, degraded))
    }

    /// Builds an SSE stream wrapping [`handle`]: content arrives as one
    /// final record from the backend, so "streaming" is cosmetic
    /// chunking of that record rather than a live relay (spec §6). The
    /// `[DONE]` sentinel is always emitted, even when the underlying
    /// call fails partway.
    pub fn stream(
        self: Arc<Self>,
        request: ChatRequest,
        client_ip: Option<String>,
        user_agent: Option<String>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Event, Infallible>> {
        let (tx, rx) = mpsc::channel::<Event>(32);

        tokio::spawn(async move {
            match self.handle(request, client_ip, user_agent, cancel).await {
                Ok(response) => {
                    let content = response.choices.first().map(|c| c.content.as_str()).unwrap_or("");
                    for chunk in chunk_content(content, 20) {
                        let event = serde_json::json!({
                            "id": response.id,
                            "choices": [{"index": 0, "delta": {"content": chunk}, "finish_reason": null}],
                        });
                        if tx.send(Event::default().data(event.to_string())).await.is_err() {
                            return;
                        }
                    }
                    let final_event = serde_json::json!({
                        "id": response.id,
                        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                        "session_id": response.session_id,
                    });
                    let _ = tx.send(Event::default().data(final_event.to_string())).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "streaming request failed, emitting terminator only");
                }
            }
            let _ = tx.send(Event::default().data("[DONE]")).await;
        });

        ReceiverStream::new(rx).map(Ok)
    }

    async fn allocate_if_local(
        &self,
        decision: &Decision,
        client_id: &Option<String>,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(Option<String>, Option<String>, Option<String>), GatewayError> {
        let entry = match decision {
            Decision::Direct { entry, .. } | Decision::Pooled { entry, .. } => entry,
            Decision::Reject(_) => return Ok((None, None, None)),
        };
        if entry.backend.kind() != BackendKind::Local {
            return Ok((None, None, None));
        }

        if let Some(id) = client_id {
            if let Some(session) = self.sessions.get(id).await {
                let config_dir = self.subscriptions.get(&session.subscription_id).await.map(|c| c.config_dir);
                return Ok((config_dir, Some(session.subscription_id), None));
            }
        }

        let minted = client_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let result = self.balancer.allocate(&minted).await?;
        match result.selection {
            Selection::Credential { id, config_dir } => {
                if let Some(session) = &result.session {
                    if session.client_ip.is_none() && (client_ip.is_some() || user_agent.is_some()) {
                        let _ = self
                            .sessions
                            .update(&minted, |mut s| {
                                s.client_ip = client_ip.clone();
                                s.user_agent = user_agent.clone();
                                s
                            })
                            .await;
                    }
                }
                Ok((Some(config_dir), Some(id), Some(minted)))
            }
            Selection::Fallback { reason } => {
                tracing::warn!(%reason, "allocation fell back, continuing without a bound credential");
                Ok((None, None, None))
            }
        }
    }

    fn record_usage(&self, subscription_id: &str, exec: &ExecutionResult, session_id: Option<String>) {
        let subscription_id = subscription_id.to_string();
        let output = exec.output.clone();
        let usage = self.usage.clone();
        let subscriptions = self.subscriptions.clone();
        let sessions = self.sessions.clone();
        let notify = self.notify.clone();

        tokio::spawn(async move {
            match usage.record(&subscription_id, &output, session_id.clone()).await {
                Ok(record) => {
                    if let Some(client_id) = &session_id {
                        let _ = sessions
                            .update(client_id, |mut s| {
                                s.session_cost += record.cost_usd;
                                s.session_tokens += record.total_tokens;
                                s.request_count += 1;
                                s
                            })
                            .await;
                    }
                    if let Some(credential) = subscriptions.get(&subscription_id).await {
                        notify.check(&credential).await;
                        let snapshot = health::HealthSnapshot {
                            weekly_used: credential.weekly_used,
                            weekly_budget: credential.weekly_budget,
                            current_block_cost: credential.current_block_cost,
                            assigned_clients_count: credential.assigned_clients.len(),
                            burn_rate_usd_per_hour: credential.burn_rate_usd_per_hour,
                        };
                        let score = health::score(&snapshot);
                        let _ = subscriptions
                            .update(&subscription_id, move |mut c| {
                                c.health_score = score;
                                c
                            })
                            .await;
                    }
                }
                Err(e) => tracing::error!(error = %e, subscription_id, "usage recording failed"),
            }
        });
    }

    async fn log_error(&self, request: &ChatRequest, error: &GatewayError) {
        self.log_store
            .append(LogRecord {
                id: uuid::Uuid::new_v4().to_string(),
                ts: chrono::Utc::now(),
                backend_name: request.backend.clone().unwrap_or_default(),
                session_id: request.session_id.clone(),
                duration_ms: 0,
                cost_usd: 0.0,
                input_tokens: 0,
                output_tokens: 0,
                degraded: false,
                error: Some(error.client_message()),
                request_summary: summarize(request),
            })
            .await;
    }

    fn to_response(&self, request: &ChatRequest, exec: ExecutionResult, degraded: bool) -> ChatResponse {
        let output = exec.output;
        let response = ChatResponse {
            id: output.uuid.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: chrono::Utc::now(),
            model: request.model.clone().unwrap_or_else(|| exec.backend_name.clone()),
            choices: vec![ChatChoice {
                index: 0,
                role: MessageRole::Assistant,
                content: output.result.clone(),
                finish_reason: if output.is_error { "error".to_string() } else { "stop".to_string() },
            }],
            usage: ChatUsage {
                prompt_tokens: output.usage.input_tokens as u32,
                completion_tokens: output.usage.output_tokens as u32,
                total_tokens: output.usage.total() as u32,
            },
            session_id: output.session_id.clone().or_else(|| request.session_id.clone()),
            degraded,
        };

        let log_store = self.log_store.clone();
        let record = LogRecord {
            id: response.id.clone(),
            ts: response.created_at,
            backend_name: exec.backend_name,
            session_id: response.session_id.clone(),
            duration_ms: output.duration_ms,
            cost_usd: output.total_cost_usd,
            input_tokens: output.usage.input_tokens,
            output_tokens: output.usage.output_tokens,
            degraded,
            error: None,
            request_summary: summarize(request),
        };
        tokio::spawn(async move { log_store.append(record).await });

        response
    }
}

fn summarize(request: &ChatRequest) -> String {
    let last_user = request.messages.iter().rev().find(|m| m.role == MessageRole::User).map(|m| m.content.as_str()).unwrap_or("");
    last_user.chars().take(120).collect()
}

fn chunk_content(content: &str, chunk_len: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    content.chars().collect::<Vec<_>>().chunks(chunk_len).map(|c| c.iter().collect()).collect()
}
