//! Usage tracker (C8): records per-request usage, attributes it to the
//! active 5-hour block, and maintains weekly/burn-rate derived fields on
//! the credential.
//!
//! The sole writer of usage records and of a credential's `weekly_used`,
//! `burn_rate_usd_per_hour`, `tokens_per_minute`, `current_block_*`, and
//! `status` fields (spec §4.8/§5). Derived queries are linear scans over a
//! subscription's usage records — acceptable at the scales this system
//! targets (spec §4.8, known limitation).

use crate::config::SafeguardThresholds;
use crate::storage::Storage;
use crate::subscription::SubscriptionManager;
use crate::types::{BackendOutput, BlockInfo, CredentialStatus, UsageRecord};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::sync::Arc;

const BLOCK_HOURS: i64 = 5;
const BLOCK_BOUNDARIES: [u32; 5] = [0, 5, 10, 15, 20];

/// The UTC timestamp of the most recent `{00,05,10,15,20}:00:00` boundary
/// at or before `t`.
fn block_boundary(t: DateTime<Utc>) -> DateTime<Utc> {
    let hour = BLOCK_BOUNDARIES.iter().rev().find(|&&h| h <= t.hour()).copied().unwrap_or(0);
    t.date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("hour is one of the fixed boundaries")
        .and_utc()
}

fn block_id(t: DateTime<Utc>) -> String {
    block_boundary(t).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub struct UsageTracker {
    storage: Arc<Storage>,
    subscriptions: Arc<SubscriptionManager>,
    thresholds: SafeguardThresholds,
}

impl UsageTracker {
    pub fn new(storage: Arc<Storage>, subscriptions: Arc<SubscriptionManager>, thresholds: SafeguardThresholds) -> Self {
        Self { storage, subscriptions, thresholds }
    }

    /// Builds a usage record from the backend's output, persists it,
    /// indexes it by day, and applies it to the credential.
    pub async fn record(
        &self,
        subscription_id: &str,
        output: &BackendOutput,
        session_id: Option<String>,
    ) -> anyhow::Result<UsageRecord> {
        let now = Utc::now();
        let boundary = block_boundary(now);
        let this_block_id = block_id(now);

        let record = UsageRecord {
            subscription_id: subscription_id.to_string(),
            timestamp: now,
            block_id: this_block_id.clone(),
            cost_usd: output.total_cost_usd,
            input_tokens: output.usage.input_tokens,
            output_tokens: output.usage.output_tokens,
            cache_creation_tokens: output.usage.cache_creation_tokens,
            cache_read_tokens: output.usage.cache_read_tokens,
            total_tokens: output.usage.total(),
            session_id,
            duration_ms: Some(output.duration_ms),
            request_uuid: output.uuid.clone(),
        };

        let record_key = format!(
            "usage:{subscription_id}:{}:{}",
            now.format("%Y%m%dT%H%M%S%.9f"),
            uuid::Uuid::new_v4()
        );
        self.storage.set(&record_key, &record).await?;
        let day = now.format("%Y%m%d").to_string();
        self.storage.add_to_index(&format!("index:usage_by_day:{day}"), &record_key).await;

        let weekly_used = self.sum_cost_since(subscription_id, now - Duration::days(7)).await;
        let burn_rate = self.sum_cost_since(subscription_id, now - Duration::hours(1)).await;
        let tokens_5m = self.sum_tokens_since(subscription_id, now - Duration::minutes(5)).await;
        let tokens_per_minute = tokens_5m as f64 / 5.0;
        let cost_usd = record.cost_usd;
        let thresholds = self.thresholds;

        self.subscriptions
            .update(subscription_id, move |mut c| {
                if c.current_block_id.as_deref() != Some(this_block_id.as_str()) {
                    c.current_block_id = Some(this_block_id);
                    c.current_block_cost = cost_usd;
                    c.block_start = Some(boundary);
                    c.block_end = Some(boundary + Duration::hours(BLOCK_HOURS));
                } else {
                    c.current_block_cost += cost_usd;
                }
                c.weekly_used = weekly_used;
                c.burn_rate_usd_per_hour = burn_rate;
                c.tokens_per_minute = tokens_per_minute;
                c.last_usage_update_ts = Some(now);
                c.last_request_ts = Some(now);

                let share = if c.weekly_budget > 0.0 { c.weekly_used / c.weekly_budget } else { 0.0 };
                c.status = if share >= thresholds.status_limited_ratio {
                    CredentialStatus::Limited
                } else if share >= thresholds.status_approaching_ratio {
                    CredentialStatus::Approaching
                } else {
                    CredentialStatus::Available
                };
                c
            })
            .await?;

        Ok(record)
    }

    async fn records_for(&self, subscription_id: &str) -> Vec<UsageRecord> {
        let keys = self.storage.list(&format!("usage:{subscription_id}:")).await;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(r) = self.storage.get::<UsageRecord>(&k).await {
                out.push(r);
            }
        }
        out
    }

    async fn sum_cost_since(&self, subscription_id: &str, since: DateTime<Utc>) -> f64 {
        self.records_for(subscription_id)
            .await
            .into_iter()
            .filter(|r| r.timestamp >= since)
            .map(|r| r.cost_usd)
            .sum()
    }

    async fn sum_tokens_since(&self, subscription_id: &str, since: DateTime<Utc>) -> u64 {
        self.records_for(subscription_id)
            .await
            .into_iter()
            .filter(|r| r.timestamp >= since)
            .map(|r| r.total_tokens)
            .sum()
    }

    pub async fn weekly_usage(&self, subscription_id: &str) -> f64 {
        self.sum_cost_since(subscription_id, Utc::now() - Duration::days(7)).await
    }

    pub async fn burn_rate(&self, subscription_id: &str) -> f64 {
        self.sum_cost_since(subscription_id, Utc::now() - Duration::hours(1)).await
    }

    /// Projects the currently-open block's trajectory, or `None` if no
    /// block is open.
    pub async fn active_block(&self, subscription_id: &str) -> Option<BlockInfo> {
        let credential = self.subscriptions.get(subscription_id).await?;
        let block_id = credential.current_block_id.clone()?;
        let block_start = credential.block_start?;
        let elapsed_minutes = (Utc::now() - block_start).num_seconds() as f64 / 60.0;
        let elapsed_minutes = elapsed_minutes.max(1e-9);
        let cost_so_far = credential.current_block_cost;
        let cost_per_hour = 60.0 * cost_so_far / elapsed_minutes;
        let remaining_minutes = 300.0 - elapsed_minutes;
        let projected_cost = cost_so_far + cost_per_hour * remaining_minutes / 60.0;
        Some(BlockInfo { block_id, cost_so_far, cost_per_hour, projected_cost, remaining_minutes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, SafeguardThresholds};
    use crate::types::UsageFields;
    use chrono::TimeZone;

    fn thresholds() -> SafeguardThresholds {
        SafeguardThresholds {
            health_check_weekly_ratio: 0.95,
            allocation_weekly_ratio: 0.85,
            status_limited_ratio: 0.95,
            status_approaching_ratio: 0.8,
        }
    }

    fn output(cost: f64, input: u64, output_tok: u64) -> BackendOutput {
        BackendOutput {
            result: "ok".into(),
            session_id: None,
            duration_ms: 100,
            total_cost_usd: cost,
            usage: UsageFields { input_tokens: input, output_tokens: output_tok, cache_creation_tokens: 0, cache_read_tokens: 0 },
            uuid: None,
            is_error: false,
            model_usage: None,
        }
    }

    async fn tracker() -> (UsageTracker, Arc<SubscriptionManager>) {
        let storage = Arc::new(Storage::new(10_000, 0.1));
        let subs = Arc::new(SubscriptionManager::new(storage.clone(), 10, thresholds()));
        subs.initialize(&[CredentialConfig {
            id: "a".into(),
            email: "a@example.com".into(),
            kind: "standard".into(),
            config_dir: "/tmp".into(),
            weekly_budget: 100.0,
            max_clients: 5,
        }])
        .await
        .unwrap();
        (UsageTracker::new(storage, subs.clone(), thresholds()), subs)
    }

    #[test]
    fn block_id_deterministic_within_same_window() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 1, 4, 59, 59).unwrap();
        assert_eq!(block_id(t1), block_id(t2));
    }

    #[test]
    fn block_boundary_at_04_59_59_is_midnight() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 4, 59, 59).unwrap();
        assert_eq!(block_id(t), "2026-03-01T00:00:00.000Z");
    }

    #[test]
    fn block_boundary_at_05_00_00_is_itself() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(block_id(t), "2026-03-01T05:00:00.000Z");
    }

    #[tokio::test]
    async fn record_starts_a_fresh_block_on_first_usage() {
        let (tracker, subs) = tracker().await;
        tracker.record("a", &output(1.5, 100, 50), None).await.unwrap();
        let c = subs.get("a").await.unwrap();
        assert_eq!(c.current_block_cost, 1.5);
        assert!(c.current_block_id.is_some());
    }

    #[tokio::test]
    async fn record_accumulates_within_the_same_block() {
        let (tracker, subs) = tracker().await;
        tracker.record("a", &output(1.0, 10, 10), None).await.unwrap();
        tracker.record("a", &output(2.0, 10, 10), None).await.unwrap();
        let c = subs.get("a").await.unwrap();
        assert_eq!(c.current_block_cost, 3.0);
    }

    #[tokio::test]
    async fn record_recomputes_weekly_used_and_status() {
        let (tracker, subs) = tracker().await;
        tracker.record("a", &output(90.0, 1000, 1000), None).await.unwrap();
        let c = subs.get("a").await.unwrap();
        assert_eq!(c.weekly_used, 90.0);
        assert_eq!(c.status, CredentialStatus::Limited);
    }

    #[tokio::test]
    async fn active_block_projects_cost_trajectory() {
        let (tracker, _subs) = tracker().await;
        tracker.record("a", &output(5.0, 100, 100), None).await.unwrap();
        let info = tracker.active_block("a").await.unwrap();
        assert_eq!(info.cost_so_far, 5.0);
        assert!(info.remaining_minutes <= 300.0);
        assert!(info.projected_cost >= info.cost_so_far);
    }

    #[tokio::test]
    async fn active_block_is_none_without_usage() {
        let (tracker, _subs) = tracker().await;
        assert!(tracker.active_block("a").await.is_none());
    }

    #[tokio::test]
    async fn record_honors_configured_status_thresholds() {
        let storage = Arc::new(Storage::new(10_000, 0.1));
        let subs = Arc::new(SubscriptionManager::new(
            storage.clone(),
            10,
            SafeguardThresholds {
                health_check_weekly_ratio: 0.95,
                allocation_weekly_ratio: 0.85,
                status_limited_ratio: 0.5,
                status_approaching_ratio: 0.3,
            },
        ));
        subs.initialize(&[CredentialConfig {
            id: "a".into(),
            email: "a@example.com".into(),
            kind: "standard".into(),
            config_dir: "/tmp".into(),
            weekly_budget: 100.0,
            max_clients: 5,
        }])
        .await
        .unwrap();
        let tracker = UsageTracker::new(
            storage,
            subs.clone(),
            SafeguardThresholds {
                health_check_weekly_ratio: 0.95,
                allocation_weekly_ratio: 0.85,
                status_limited_ratio: 0.5,
                status_approaching_ratio: 0.3,
            },
        );

        // 40% of weekly budget: Limited under the default 0.95 ratio would
        // never trigger, but does here under the tighter 0.5 configured one.
        tracker.record("a", &output(40.0, 10, 10), None).await.unwrap();
        let c = subs.get("a").await.unwrap();
        assert_eq!(c.status, CredentialStatus::Approaching);

        tracker.record("a", &output(20.0, 10, 10), None).await.unwrap();
        let c = subs.get("a").await.unwrap();
        assert_eq!(c.status, CredentialStatus::Limited);
    }
}
