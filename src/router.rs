//! Router (C4): per-request policy deciding which backend serves a request.
//!
//! Grounded on the pack's `claw-router/src/router.rs` — cost-sort then
//! cascade-on-overflow is the same shape as that file's tier escalation,
//! adapted to this spec's classify/filter/cost-sort/cascade algorithm.

use crate::error::GatewayError;
use crate::registry::{RegisteredBackend, Registry};
use crate::types::ChatRequest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub enum Decision {
    Direct { entry: Arc<RegisteredBackend>, degraded: bool },
    Pooled { entry: Arc<RegisteredBackend>, degraded: bool },
    Reject(String),
}

/// `route(request) -> decision`, spec §4.4.
pub async fn route(registry: &Registry, request: &ChatRequest) -> Decision {
    if let Some(name) = &request.backend {
        if let Some(entry) = registry.get(name) {
            if entry.backend.is_available().await {
                return into_decision(entry, false);
            }
            return auto_select(registry, request, None, true).await;
        }
    }
    auto_select(registry, request, None, false).await
}

fn into_decision(entry: Arc<RegisteredBackend>, degraded: bool) -> Decision {
    if entry.pool.is_some() {
        Decision::Pooled { entry, degraded }
    } else {
        Decision::Direct { entry, degraded }
    }
}

async fn auto_select(
    registry: &Registry,
    request: &ChatRequest,
    exclude: Option<&str>,
    mut degraded: bool,
) -> Decision {
    let tools_required = request.tools_required();

    let mut available = registry.list_available().await;
    if let Some(name) = exclude {
        available.retain(|e| e.backend.name() != name);
    }
    if tools_required {
        available.retain(|e| e.backend.supports_tools());
    }

    let mut candidates = Vec::with_capacity(available.len());
    for entry in &available {
        if let Some(pool) = &entry.pool {
            let stats = pool.stats().await;
            if stats.active >= stats.max_concurrent && stats.queued >= stats.queue_depth {
                continue;
            }
        }
        candidates.push(entry.clone());
    }

    if candidates.is_empty() && !tools_required {
        let api_only: Vec<_> = available.iter().filter(|e| e.pool.is_none()).cloned().collect();
        if !api_only.is_empty() {
            candidates = api_only;
            degraded = true;
        }
    }

    if candidates.is_empty() {
        return Decision::Reject("no backend available".to_string());
    }

    candidates.sort_by(|a, b| {
        a.backend
            .estimate_cost(request)
            .partial_cmp(&b.backend.estimate_cost(request))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    into_decision(candidates.remove(0), degraded)
}

/// Result of a completed routing execution: the backend output, the name
/// of the backend that actually served the request, and whether the
/// response was degraded.
pub struct ExecutionResult {
    pub output: crate::types::BackendOutput,
    pub backend_name: String,
    pub degraded: bool,
}

/// `execute(decision, request) -> response`, spec §4.4. Cascades exactly
/// once on `QueueFull`/`QueueTimeout`, excluding the failing adapter; any
/// other error, or a failed cascade, surfaces the original error.
pub fn execute<'a>(
    registry: &'a Registry,
    decision: Decision,
    request: &'a ChatRequest,
    credential_config_dir: Option<&'a str>,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecutionResult, GatewayError>> + Send + 'a>> {
    Box::pin(async move {
        match decision {
            Decision::Reject(_) => Err(GatewayError::NoBackendAvailable),
            Decision::Direct { entry, degraded } => {
                let output = entry.backend.execute(request, credential_config_dir, cancel).await?;
                Ok(ExecutionResult { output, backend_name: entry.backend.name().to_string(), degraded })
            }
            Decision::Pooled { entry, degraded } => {
                let pool = entry.pool.as_ref().expect("Pooled decision always carries a pool");
                let backend_name = entry.backend.name().to_string();
                let entry_for_work = entry.clone();
                let request_owned = request.clone();
                let cancel_for_work = cancel.clone();
                let config_dir_owned = credential_config_dir.map(str::to_string);

                let result = pool
                    .submit(async move {
                        entry_for_work.backend.execute(&request_owned, config_dir_owned.as_deref(), cancel_for_work).await
                    })
                    .await;

                match result {
                    Ok(output) => Ok(ExecutionResult { output, backend_name, degraded }),
                    Err(original @ (GatewayError::QueueFull | GatewayError::QueueTimeout)) => {
                        let cascaded = auto_select(registry, request, Some(&backend_name), true).await;
                        match cascaded {
                            Decision::Reject(_) => Err(original),
                            other => execute(registry, other, request, credential_config_dir, cancel).await,
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendDescriptor, BackendKind, ChatMessage, MessageRole};
    use std::time::Duration;

    fn request(tools: Vec<&str>) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: "hi".into() }],
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            session_id: None,
            tools: tools.into_iter().map(String::from).collect(),
            context_files: vec![],
            working_directory: None,
            max_budget_usd: None,
            add_dirs: vec![],
            mcp_config: vec![],
            betas: vec![],
            allowed_tools: vec![],
            disallowed_tools: vec![],
            backend: None,
        }
    }

    fn remote(name: &str, cost: f64, supports_tools: bool) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            kind: BackendKind::Remote,
            cost_per_unit: cost,
            supports_tools,
            config_dir: None,
            max_concurrent: 0,
            queue_depth: 0,
            timeout_secs: 0,
            executable: None,
            base_url: Some("http://127.0.0.1:1".to_string()),
            model: Some("m".into()),
            credential_env_name: None,
            provider_tag: None,
            merge_system_as_user: false,
        }
    }

    fn local(name: &str, max_concurrent: usize, queue_depth: usize) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            kind: BackendKind::Local,
            cost_per_unit: 0.0,
            supports_tools: true,
            config_dir: Some("".into()),
            max_concurrent,
            queue_depth,
            timeout_secs: 5,
            executable: Some("/bin/true".into()),
            base_url: None,
            model: None,
            credential_env_name: None,
            provider_tag: None,
            merge_system_as_user: false,
        }
    }

    fn registry(descriptors: Vec<BackendDescriptor>) -> Registry {
        Registry::new(
            descriptors,
            reqwest::Client::new(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn picks_cheapest_capable_backend() {
        let reg = registry(vec![remote("expensive", 5.0, false), remote("cheap", 1.0, false)]);
        let decision = route(&reg, &request(vec![])).await;
        match decision {
            Decision::Direct { entry, degraded } => {
                assert_eq!(entry.backend.name(), "cheap");
                assert!(!degraded);
            }
            _ => panic!("expected Direct"),
        }
    }

    #[tokio::test]
    async fn tools_required_filters_out_non_tool_backends() {
        let reg = registry(vec![remote("no-tools", 0.1, false), local("tools", 2, 2)]);
        let decision = route(&reg, &request(vec!["Read"])).await;
        match decision {
            Decision::Pooled { entry, .. } => assert_eq!(entry.backend.name(), "tools"),
            _ => panic!("expected Pooled"),
        }
    }

    #[tokio::test]
    async fn empty_registry_rejects() {
        let reg = registry(vec![]);
        let decision = route(&reg, &request(vec![])).await;
        assert!(matches!(decision, Decision::Reject(_)));
    }

    #[tokio::test]
    async fn full_local_pool_falls_back_to_remote_when_tools_not_required() {
        // max_concurrent=0 is impossible per spec invariant but Pool::new floors to 1;
        // use a descriptor that is immediately saturated instead: queue_depth 0 and
        // occupy the only slot by submitting directly against the underlying pool.
        let reg = registry(vec![local("local-only", 1, 0), remote("fallback", 1.0, false)]);
        let entry = reg.get("local-only").unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let entry_for_block = entry.clone();
        let blocked = tokio::spawn(async move {
            entry_for_block
                .pool
                .as_ref()
                .unwrap()
                .submit(async move {
                    let _ = rx.await;
                    Ok::<_, GatewayError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let decision = route(&reg, &request(vec![])).await;
        match decision {
            Decision::Direct { entry, degraded } => {
                assert_eq!(entry.backend.name(), "fallback");
                assert!(degraded);
            }
            other => panic!("expected degraded Direct fallback, got a different decision variant ({})", match other {
                Decision::Reject(r) => r,
                _ => "pooled".to_string(),
            }),
        }
        let _ = tx.send(());
        let _ = blocked.await;
    }
}
