//! Notification manager (C11): threshold/event emitter to log and webhook
//! sinks.
//!
//! Webhook dispatch borrows the teacher's timeout-around-reqwest idiom
//! (`backend/remote.rs`'s `tokio::select!` over a timeout) rather than a
//! new pattern. No retry, no per-rule deduplication — a credential whose
//! usage ratio keeps climbing past the same threshold fires again on every
//! `check` call (spec §4.11, named gap).

use crate::config::{NotificationChannel, NotificationRule, NotificationRuleType};
use crate::types::Credential;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct NotificationManager {
    rules: Vec<NotificationRule>,
    webhook_url: Option<String>,
    webhook_timeout: Duration,
    client: reqwest::Client,
}

impl NotificationManager {
    pub fn new(rules: Vec<NotificationRule>, webhook_url: Option<String>, webhook_timeout: Duration, client: reqwest::Client) -> Self {
        Self { rules, webhook_url, webhook_timeout, client }
    }

    /// For each enabled `usage_threshold` rule whose `threshold` is at or
    /// below the credential's weekly-usage ratio, dispatch to its channels.
    pub async fn check(&self, credential: &Credential) {
        if credential.weekly_budget <= 0.0 {
            return;
        }
        let ratio = credential.weekly_used / credential.weekly_budget;

        for rule in &self.rules {
            if !rule.enabled || rule.kind != NotificationRuleType::UsageThreshold {
                continue;
            }
            let Some(threshold) = rule.threshold else { continue };
            if threshold <= ratio {
                let message = format!(
                    "credential {} weekly usage ratio {:.3} crossed threshold {:.3}",
                    credential.id, ratio, threshold
                );
                self.dispatch(rule, &message).await;
            }
        }
    }

    pub async fn notify_failover(&self, from: &str, to: &str) {
        let message = format!("failover: {from} -> {to}");
        self.fire_unconditionally(NotificationRuleType::Failover, &message).await;
    }

    pub async fn notify_rotation(&self, from: &str, to: &str) {
        let message = format!("rotation: {from} -> {to}");
        self.fire_unconditionally(NotificationRuleType::Rotation, &message).await;
    }

    async fn fire_unconditionally(&self, kind: NotificationRuleType, message: &str) {
        for rule in self.rules.iter().filter(|r| r.enabled && r.kind == kind) {
            self.dispatch(rule, message).await;
        }
    }

    async fn dispatch(&self, rule: &NotificationRule, message: &str) {
        for channel in &rule.channels {
            match channel {
                NotificationChannel::Log => tracing::warn!(%message, "notification"),
                NotificationChannel::ExternalErrorSink => tracing::error!(%message, "notification"),
                NotificationChannel::Webhook => self.dispatch_webhook(message).await,
            }
        }
    }

    async fn dispatch_webhook(&self, message: &str) {
        let Some(url) = &self.webhook_url else {
            tracing::warn!(%message, "webhook channel enabled but no webhook_url configured");
            return;
        };

        let cancel = CancellationToken::new();
        let body = serde_json::json!({ "message": message });
        let send = self.client.post(url).json(&body).send();

        let result = tokio::select! {
            res = tokio::time::timeout(self.webhook_timeout, send) => res,
            _ = cancel.cancelled() => return,
        };

        match result {
            Ok(Ok(resp)) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), "webhook dispatch returned non-2xx, swallowed");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "webhook dispatch failed, swallowed"),
            Err(_) => tracing::warn!("webhook dispatch timed out, swallowed"),
            Ok(Ok(_)) => {}
        }
    }
}

/// Human-readable "N minutes/hours/days" estimate of time to exhaustion,
/// or `None` when `burn_rate == 0` (spec §4.11).
pub fn predicted_exhaustion(remaining_budget: f64, burn_rate_usd_per_hour: f64) -> Option<String> {
    if burn_rate_usd_per_hour == 0.0 {
        return None;
    }
    let hours = remaining_budget / burn_rate_usd_per_hour;
    if hours < 0.0 {
        return Some("0 minutes".to_string());
    }
    if hours < 1.0 {
        Some(format!("{:.0} minutes", hours * 60.0))
    } else if hours < 24.0 {
        Some(format!("{:.1} hours", hours))
    } else {
        Some(format!("{:.1} days", hours / 24.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialStatus;
    use std::collections::HashSet;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential(weekly_used: f64, weekly_budget: f64) -> Credential {
        Credential {
            id: "a".into(),
            email: "a@example.com".into(),
            kind: "standard".into(),
            config_dir: "/tmp".into(),
            weekly_budget,
            weekly_used,
            current_block_id: None,
            current_block_cost: 0.0,
            block_start: None,
            block_end: None,
            assigned_clients: HashSet::new(),
            max_clients: 5,
            health_score: 100.0,
            status: CredentialStatus::Available,
            burn_rate_usd_per_hour: 0.0,
            tokens_per_minute: 0.0,
            last_usage_update_ts: None,
            last_request_ts: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn rule(threshold: f64, channels: Vec<NotificationChannel>) -> NotificationRule {
        NotificationRule { kind: NotificationRuleType::UsageThreshold, threshold: Some(threshold), channels, enabled: true }
    }

    #[tokio::test]
    async fn check_dispatches_webhook_when_threshold_crossed() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let manager = NotificationManager::new(
            vec![rule(0.8, vec![NotificationChannel::Webhook])],
            Some(format!("{}/hook", server.uri())),
            Duration::from_secs(5),
            reqwest::Client::new(),
        );
        manager.check(&credential(85.0, 100.0)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn check_does_not_dispatch_below_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let manager = NotificationManager::new(
            vec![rule(0.8, vec![NotificationChannel::Webhook])],
            Some(format!("{}/hook", server.uri())),
            Duration::from_secs(5),
            reqwest::Client::new(),
        );
        manager.check(&credential(10.0, 100.0)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn webhook_failure_is_swallowed_not_propagated() {
        let manager = NotificationManager::new(
            vec![rule(0.8, vec![NotificationChannel::Webhook])],
            Some("http://127.0.0.1:1/unreachable".to_string()),
            Duration::from_millis(200),
            reqwest::Client::new(),
        );
        manager.check(&credential(90.0, 100.0)).await;
    }

    #[tokio::test]
    async fn disabled_rule_never_dispatches() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let mut r = rule(0.8, vec![NotificationChannel::Webhook]);
        r.enabled = false;
        let manager =
            NotificationManager::new(vec![r], Some(format!("{}/hook", server.uri())), Duration::from_secs(5), reqwest::Client::new());
        manager.check(&credential(95.0, 100.0)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[test]
    fn predicted_exhaustion_is_unknown_when_burn_rate_zero() {
        assert_eq!(predicted_exhaustion(10.0, 0.0), None);
    }

    #[test]
    fn predicted_exhaustion_renders_minutes_for_sub_hour_estimates() {
        let estimate = predicted_exhaustion(1.0, 4.0).unwrap();
        assert!(estimate.contains("minutes"));
    }

    #[test]
    fn predicted_exhaustion_renders_days_for_long_estimates() {
        let estimate = predicted_exhaustion(100.0, 1.0).unwrap();
        assert!(estimate.contains("days"));
    }
}
