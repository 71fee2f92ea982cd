//! Error taxonomy for the gateway core.
//!
//! Every fallible core operation returns `Result<T, GatewayError>`. The
//! HTTP layer maps each variant to a status code per spec; client-visible
//! messages are bounded and never echo user input verbatim.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout")]
    Timeout,

    #[error("queue full")]
    QueueFull,

    #[error("queue item timed out waiting for a slot")]
    QueueTimeout,

    #[error("pool closed")]
    PoolClosed,

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no credential available")]
    Exhausted,

    #[error("no backend available")]
    NoBackendAvailable,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status code per spec.md §7.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Timeout | GatewayError::QueueTimeout => 504,
            GatewayError::QueueFull | GatewayError::PoolClosed => 503,
            GatewayError::Upstream { .. } => 502,
            GatewayError::Protocol(_) => 502,
            GatewayError::Exhausted => 503,
            GatewayError::NoBackendAvailable => 503,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Bounded, client-safe message. Internal errors never leak detail.
    pub fn client_message(&self) -> String {
        const MAX: usize = 2000;
        let msg = match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        if msg.len() > MAX {
            msg.chars().take(MAX).collect()
        } else {
            msg
        }
    }
}

/// Truncate a provider response body to a bounded size for diagnostics,
/// per spec §4.1 (500-char-truncated body on `UpstreamError`).
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        body.to_string()
    } else {
        body.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(GatewayError::Validation("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Timeout.status_code(), 504);
        assert_eq!(GatewayError::QueueFull.status_code(), 503);
        assert_eq!(GatewayError::Upstream { status: 500, body: "x".into() }.status_code(), 502);
        assert_eq!(GatewayError::Protocol("x".into()).status_code(), 502);
        assert_eq!(GatewayError::Exhausted.status_code(), 503);
        assert_eq!(GatewayError::Internal(anyhow::anyhow!("boom")).status_code(), 500);
    }

    #[test]
    fn truncate_body_caps_length() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_body(&long, 500).len(), 500);
        assert_eq!(truncate_body("short", 500), "short");
    }
}
