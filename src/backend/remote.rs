//! Remote HTTP adapter (C1, remote kind).
//!
//! Wraps a provider endpoint: translates the chat request into the
//! provider's schema, issues a single POST under a hard wall-clock
//! deadline, and maps failures in the precedence spec §4.1 requires.
//! Grounded on the teacher's `search_service.rs` (`reqwest::Client` +
//! `tokio::time::timeout` around a provider POST).

use crate::error::{truncate_body, GatewayError};
use crate::types::{BackendDescriptor, BackendOutput, ChatMessage, ChatRequest, MessageRole, UsageFields};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RemoteAdapter {
    descriptor: BackendDescriptor,
    client: reqwest::Client,
}

impl RemoteAdapter {
    pub fn new(descriptor: BackendDescriptor, client: reqwest::Client) -> Self {
        Self { descriptor, client }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn credential(&self) -> String {
        self.descriptor
            .credential_env_name
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default()
    }

    fn endpoint(&self) -> String {
        let base = self.descriptor.base_url.as_deref().unwrap_or_default();
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages = remap_messages(&request.messages, self.descriptor.merge_system_as_user);
        let mut body = json!({
            "model": request.model.clone().or_else(|| self.descriptor.model.clone()),
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    pub async fn execute(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BackendOutput, GatewayError> {
        let start = std::time::Instant::now();
        let body = self.build_body(request);

        // The deadline and the cancellation race cover send, status check and
        // body read as one unit, per spec §4.1: a provider that accepts the
        // request but stalls the body stream must not hang past the deadline.
        let call = async {
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(self.credential())
                .json(&body)
                .send()
                .await
                .map_err(|e| GatewayError::Upstream { status: 0, body: truncate_body(&e.to_string(), 500) })?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream { status, body: truncate_body(&text, 500) });
            }

            response.text().await.map_err(|e| GatewayError::Protocol(e.to_string()))
        };

        let text = tokio::select! {
            res = tokio::time::timeout(Duration::from_secs(60), call) => res.map_err(|_| GatewayError::Timeout)??,
            _ = cancel.cancelled() => return Err(GatewayError::Timeout),
        };

        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| GatewayError::Protocol(e.to_string()))?;

        let content = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| GatewayError::Protocol("missing choices[0].message.content".to_string()))?;

        let usage = parsed.get("usage");
        let input_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(BackendOutput {
            result: content.to_string(),
            session_id: None,
            duration_ms: start.elapsed().as_millis() as u64,
            total_cost_usd: 0.0,
            usage: UsageFields {
                input_tokens,
                output_tokens,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
            },
            uuid: None,
            is_error: false,
            model_usage: None,
        })
    }

    /// HTTP 200 on a lightweight "list models" call only. A 400 means the
    /// request was malformed, not that the provider is unhealthy, and per
    /// spec §4.1 it must NOT count as available.
    pub async fn is_available(&self) -> bool {
        let base = self.descriptor.base_url.as_deref().unwrap_or_default();
        let url = format!("{}/models", base.trim_end_matches('/'));
        let send = self.client.get(url).bearer_auth(self.credential()).send();
        match tokio::time::timeout(Duration::from_secs(10), send).await {
            Ok(Ok(response)) => response.status().as_u16() == 200,
            _ => false,
        }
    }
}

/// Merge a leading system message into the first user message when the
/// provider has no system role, per spec §4.1.
fn remap_messages(messages: &[ChatMessage], merge_system_as_user: bool) -> Vec<serde_json::Value> {
    if !merge_system_as_user || messages.first().map(|m| m.role) != Some(MessageRole::System) {
        return messages
            .iter()
            .map(|m| json!({ "role": role_str(m.role), "content": m.content }))
            .collect();
    }

    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.iter();
    let system = iter.next().unwrap();
    let mut merged_first_user = false;
    for msg in iter {
        if !merged_first_user && msg.role == MessageRole::User {
            out.push(json!({
                "role": "user",
                "content": format!("{}\n\n{}", system.content, msg.content),
            }));
            merged_first_user = true;
        } else {
            out.push(json!({ "role": role_str(msg.role), "content": msg.content }));
        }
    }
    out
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}
