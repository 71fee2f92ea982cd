//! Backend adapter (C1): a uniform contract over heterogeneous providers.
//!
//! There are exactly two kinds, matching spec §9's "closed variant"
//! design note — a small enum rather than a trait object, since adapters
//! never need to be extended at runtime and each kind carries genuinely
//! different fields.

pub mod local;
pub mod remote;

use crate::error::GatewayError;
use crate::types::{BackendDescriptor, BackendKind, BackendOutput, ChatRequest};
use local::LocalAdapter;
use remote::RemoteAdapter;
use tokio_util::sync::CancellationToken;

pub enum Backend {
    Local(LocalAdapter),
    Remote(RemoteAdapter),
}

impl Backend {
    pub fn from_descriptor(descriptor: BackendDescriptor, http_client: reqwest::Client) -> Self {
        match descriptor.kind {
            BackendKind::Local => Backend::Local(LocalAdapter::new(descriptor)),
            BackendKind::Remote => Backend::Remote(RemoteAdapter::new(descriptor, http_client)),
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        match self {
            Backend::Local(a) => a.descriptor(),
            Backend::Remote(a) => a.descriptor(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    pub fn kind(&self) -> BackendKind {
        self.descriptor().kind
    }

    pub fn supports_tools(&self) -> bool {
        self.descriptor().supports_tools
    }

    /// `credential_config_dir` overrides the descriptor's static config
    /// directory for local-kind backends when the allocation balancer
    /// (C10) has bound the request to a specific credential; ignored by
    /// remote-kind backends.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        credential_config_dir: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<BackendOutput, GatewayError> {
        match self {
            Backend::Local(a) => a.execute(request, credential_config_dir, cancel).await,
            Backend::Remote(a) => a.execute(request, cancel).await,
        }
    }

    pub async fn is_available(&self) -> bool {
        match self {
            Backend::Local(a) => a.is_available().await,
            Backend::Remote(a) => a.is_available().await,
        }
    }

    /// `cost_per_unit x ceil(total_chars/4) / 1000`, per spec §4.1. Token
    /// counting is a character approximation by design (spec §9).
    pub fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        let chars = request.total_chars() as f64;
        let units = (chars / 4.0).ceil();
        self.descriptor().cost_per_unit * units / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageRole};

    fn sample_request(content: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: content.to_string() }],
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
        }
    }

    fn remote_descriptor(cost_per_unit: f64) -> BackendDescriptor {
        BackendDescriptor {
            name: "r".into(),
            kind: BackendKind::Remote,
            cost_per_unit,
            supports_tools: false,
            config_dir: None,
            max_concurrent: 0,
            queue_depth: 0,
            timeout_secs: 0,
            executable: None,
            base_url: Some("http://example.invalid".into()),
            model: Some("m".into()),
            credential_env_name: None,
            provider_tag: None,
            merge_system_as_user: false,
        }
    }

    #[test]
    fn estimate_cost_uses_char_approximation() {
        let backend = Backend::from_descriptor(remote_descriptor(1.0), reqwest::Client::new());
        // 8 chars -> ceil(8/4)=2 units -> 2/1000 = 0.002
        let cost = backend.estimate_cost(&sample_request("12345678"));
        assert!((cost - 0.002).abs() < 1e-9);
    }
}
