//! Backend registry (C3): owns the constructed adapters for the life of
//! the process.
//!
//! Grounded on the teacher's `main.rs` `AppState`, which aggregates the
//! service instances once at startup and hands out shared references.

use crate::backend::Backend;
use crate::pool::Pool;
use crate::types::{BackendDescriptor, BackendKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A local-kind backend is paired with exactly one pool; the pool is
/// dropped when the registry is (spec §3, "Ownership and lifecycle").
pub struct RegisteredBackend {
    pub backend: Backend,
    pub pool: Option<Pool>,
}

pub struct Registry {
    backends: Vec<Arc<RegisteredBackend>>,
    by_name: HashMap<String, usize>,
    availability_timeout: Duration,
}

impl Registry {
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        http_client: reqwest::Client,
        queue_item_timeout: Duration,
        sweep_interval: Duration,
        availability_timeout: Duration,
    ) -> Self {
        let mut backends = Vec::with_capacity(descriptors.len());
        let mut by_name = HashMap::new();

        for descriptor in descriptors {
            let name = descriptor.name.clone();
            let pool = match descriptor.kind {
                BackendKind::Local => Some(Pool::new(
                    descriptor.max_concurrent.max(1),
                    descriptor.queue_depth,
                    queue_item_timeout,
                    sweep_interval,
                )),
                BackendKind::Remote => None,
            };
            let backend = Backend::from_descriptor(descriptor, http_client.clone());
            by_name.insert(name, backends.len());
            backends.push(Arc::new(RegisteredBackend { backend, pool }));
        }

        Self { backends, by_name, availability_timeout }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredBackend>> {
        self.by_name.get(name).map(|&i| self.backends[i].clone())
    }

    pub fn list_tool_capable(&self) -> Vec<Arc<RegisteredBackend>> {
        self.backends.iter().filter(|b| b.backend.supports_tools()).cloned().collect()
    }

    pub fn list_api(&self) -> Vec<Arc<RegisteredBackend>> {
        self.backends.clone()
    }

    /// Probes every adapter's availability in parallel, each under a
    /// per-adapter timeout; unreachable adapters are filtered out. Results
    /// are never cached (spec §4.3, accepted known inefficiency).
    pub async fn list_available(&self) -> Vec<Arc<RegisteredBackend>> {
        let checks = self.backends.iter().map(|entry| {
            let entry = entry.clone();
            let timeout = self.availability_timeout;
            async move {
                let available = tokio::time::timeout(timeout, entry.backend.is_available())
                    .await
                    .unwrap_or(false);
                available.then_some(entry)
            }
        });
        futures::future::join_all(checks).await.into_iter().flatten().collect()
    }

    pub fn all(&self) -> &[Arc<RegisteredBackend>] {
        &self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;

    fn local_descriptor(name: &str) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            kind: BackendKind::Local,
            cost_per_unit: 0.0,
            supports_tools: true,
            config_dir: Some("".into()),
            max_concurrent: 1,
            queue_depth: 1,
            timeout_secs: 5,
            executable: Some("/bin/true".into()),
            base_url: None,
            model: None,
            credential_env_name: None,
            provider_tag: None,
            merge_system_as_user: false,
        }
    }

    #[test]
    fn get_returns_registered_backend_by_name() {
        let registry = Registry::new(
            vec![local_descriptor("a")],
            reqwest::Client::new(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn local_backends_carry_a_pool_remote_backends_do_not() {
        let remote = BackendDescriptor { kind: BackendKind::Remote, ..local_descriptor("r") };
        let registry = Registry::new(
            vec![local_descriptor("a"), remote],
            reqwest::Client::new(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        assert!(registry.get("a").unwrap().pool.is_some());
        assert!(registry.get("r").unwrap().pool.is_none());
    }

    #[tokio::test]
    async fn list_available_filters_unreachable_local_backends() {
        // Local adapters report available unconditionally.
        let registry = Registry::new(
            vec![local_descriptor("a")],
            reqwest::Client::new(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let available = registry.list_available().await;
        assert_eq!(available.len(), 1);
    }
}
