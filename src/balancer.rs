//! Allocation balancer (C10): picks a credential for a new session and
//! periodically rebalances idle sessions from the hottest credential to
//! the coldest.
//!
//! The `assigned_clients` read-modify-write is not transactional with the
//! session-store write (spec §5): the rebalancer treats `assigned_clients`
//! as advisory and reconciles via the session store when exact state is
//! needed, same pattern as `subscription.rs`'s cache-is-an-accelerator
//! design.

use crate::config::RebalanceConfig;
use crate::error::GatewayError;
use crate::health::{self, HealthSnapshot};
use crate::session::SessionStore;
use crate::subscription::SubscriptionManager;
use crate::types::{ClientSession, Credential, CredentialStatus, SessionStatus};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Selection {
    Credential { id: String, config_dir: String },
    Fallback { reason: String },
}

pub struct AllocationResult {
    pub selection: Selection,
    pub session: Option<ClientSession>,
}

#[derive(Debug, Default)]
pub struct RebalanceResult {
    pub moved: usize,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl RebalanceResult {
    fn no_op() -> Self {
        Self::default()
    }
}

fn snapshot(c: &Credential) -> HealthSnapshot {
    HealthSnapshot {
        weekly_used: c.weekly_used,
        weekly_budget: c.weekly_budget,
        current_block_cost: c.current_block_cost,
        assigned_clients_count: c.assigned_clients.len(),
        burn_rate_usd_per_hour: c.burn_rate_usd_per_hour,
    }
}

pub struct AllocationBalancer {
    subscriptions: Arc<SubscriptionManager>,
    sessions: Arc<SessionStore>,
    allocation_weekly_ratio: f64,
    fallback_enabled: bool,
    rebalance_config: RebalanceConfig,
}

impl AllocationBalancer {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        sessions: Arc<SessionStore>,
        allocation_weekly_ratio: f64,
        fallback_enabled: bool,
        rebalance_config: RebalanceConfig,
    ) -> Self {
        Self { subscriptions, sessions, allocation_weekly_ratio, fallback_enabled, rebalance_config }
    }

    /// Drops credentials failing the safeguards, then picks the highest
    /// health score among survivors. Ties preserve the order returned by
    /// the subscription manager.
    pub async fn select(&self) -> Result<Selection, GatewayError> {
        let mut candidates: Vec<Credential> = self
            .subscriptions
            .get_all()
            .await
            .into_iter()
            .filter(|c| !matches!(c.status, CredentialStatus::Limited | CredentialStatus::Cooldown))
            .filter(|c| c.weekly_budget <= 0.0 || c.weekly_used / c.weekly_budget < self.allocation_weekly_ratio)
            .filter(|c| (c.assigned_clients.len() as u32) < c.max_clients)
            .collect();

        if candidates.is_empty() {
            return if self.fallback_enabled {
                Ok(Selection::Fallback { reason: "no credential satisfies the safeguards".to_string() })
            } else {
                Err(GatewayError::Exhausted)
            };
        }

        candidates.sort_by(|a, b| {
            health::score(&snapshot(b))
                .partial_cmp(&health::score(&snapshot(a)))
                .unwrap_or(Ordering::Equal)
        });

        let chosen = candidates.remove(0);
        Ok(Selection::Credential { id: chosen.id, config_dir: chosen.config_dir })
    }

    /// Calls `select`; on a credential result, creates a bound session and
    /// records the binding on the credential.
    pub async fn allocate(&self, client_id: &str) -> Result<AllocationResult, GatewayError> {
        let selection = self.select().await?;
        match &selection {
            Selection::Credential { id, .. } => {
                let session = self.sessions.create(client_id, id, None, None).await?;
                self.subscriptions
                    .update(id, |mut c| {
                        c.assigned_clients.insert(client_id.to_string());
                        c
                    })
                    .await?;
                Ok(AllocationResult { selection, session: Some(session) })
            }
            Selection::Fallback { .. } => Ok(AllocationResult { selection, session: None }),
        }
    }

    /// Moves idle sessions from the hottest credential's current block to
    /// the coldest when the cost gap exceeds the configured threshold.
    /// Each move is independently fallible; failures are logged and
    /// skipped, never aborting the batch.
    pub async fn rebalance(&self) -> RebalanceResult {
        let mut open_block: Vec<Credential> =
            self.subscriptions.get_all().await.into_iter().filter(|c| c.current_block_id.is_some()).collect();

        if open_block.len() < 2 {
            return RebalanceResult::no_op();
        }

        open_block.sort_by(|a, b| a.current_block_cost.partial_cmp(&b.current_block_cost).unwrap_or(Ordering::Equal));
        let least = open_block.first().unwrap().clone();
        let most = open_block.last().unwrap().clone();

        if most.current_block_cost - least.current_block_cost < self.rebalance_config.cost_gap_threshold {
            return RebalanceResult::no_op();
        }

        let idle_sessions: Vec<ClientSession> = self
            .sessions
            .get_by_subscription(&most.id)
            .await
            .into_iter()
            .filter(|s| s.status == SessionStatus::Idle)
            .collect();

        let room = least.max_clients.saturating_sub(least.assigned_clients.len() as u32) as usize;
        let to_move = idle_sessions.len().min(room).min(self.rebalance_config.max_clients_per_cycle as usize);

        if to_move == 0 {
            return RebalanceResult::no_op();
        }

        let mut moved = 0;
        for session in idle_sessions.into_iter().take(to_move) {
            let client_id = session.id.clone();
            if let Err(e) = self.sessions.reassign(&client_id, &least.id).await {
                tracing::warn!(client_id = %client_id, error = %e, "rebalance: session reassign failed");
                continue;
            }
            let removed = self.subscriptions.update(&most.id, |mut c| {
                c.assigned_clients.remove(&client_id);
                c
            });
            let added = self.subscriptions.update(&least.id, |mut c| {
                c.assigned_clients.insert(client_id.clone());
                c
            });
            if removed.await.is_err() || added.await.is_err() {
                tracing::warn!(client_id = %client_id, "rebalance: credential index update failed");
                continue;
            }
            moved += 1;
        }

        RebalanceResult { moved, from: Some(most.id), to: Some(least.id) }
    }

    /// Idempotent: deallocating an already-absent client is a no-op.
    pub async fn deallocate(&self, client_id: &str) {
        if let Some(session) = self.sessions.get(client_id).await {
            self.sessions.delete(client_id).await;
            let _ = self
                .subscriptions
                .update(&session.subscription_id, |mut c| {
                    c.assigned_clients.remove(client_id);
                    c
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, SafeguardThresholds};
    use crate::storage::Storage;

    fn rebalance_config() -> RebalanceConfig {
        RebalanceConfig { interval_secs: 300, cost_gap_threshold: 5.0, max_clients_per_cycle: 3 }
    }

    fn safeguards() -> SafeguardThresholds {
        SafeguardThresholds {
            health_check_weekly_ratio: 0.95,
            allocation_weekly_ratio: 0.85,
            status_limited_ratio: 0.95,
            status_approaching_ratio: 0.8,
        }
    }

    fn cred_config(id: &str) -> CredentialConfig {
        CredentialConfig { id: id.to_string(), email: format!("{id}@x.com"), kind: "standard".into(), config_dir: "/tmp".into(), weekly_budget: 100.0, max_clients: 5 }
    }

    async fn harness() -> (AllocationBalancer, Arc<SubscriptionManager>, Arc<SessionStore>) {
        let storage = Arc::new(Storage::new(10_000, 0.1));
        let subs = Arc::new(SubscriptionManager::new(storage.clone(), 10, safeguards()));
        let sessions = Arc::new(SessionStore::new(storage, 10));
        subs.initialize(&[cred_config("a"), cred_config("b")]).await.unwrap();
        let balancer = AllocationBalancer::new(subs.clone(), sessions.clone(), 0.85, true, rebalance_config());
        (balancer, subs, sessions)
    }

    #[tokio::test]
    async fn select_picks_the_only_healthy_credential() {
        let (balancer, subs, _sessions) = harness().await;
        subs.update("b", |mut c| {
            c.status = CredentialStatus::Limited;
            c
        })
        .await
        .unwrap();
        let selection = balancer.select().await.unwrap();
        assert!(matches!(selection, Selection::Credential { id, .. } if id == "a"));
    }

    #[tokio::test]
    async fn select_falls_back_when_nothing_qualifies_and_fallback_enabled() {
        let (balancer, subs, _sessions) = harness().await;
        subs.update("a", |mut c| {
            c.status = CredentialStatus::Limited;
            c
        })
        .await
        .unwrap();
        subs.update("b", |mut c| {
            c.status = CredentialStatus::Cooldown;
            c
        })
        .await
        .unwrap();
        let selection = balancer.select().await.unwrap();
        assert!(matches!(selection, Selection::Fallback { .. }));
    }

    #[tokio::test]
    async fn select_raises_exhausted_when_fallback_disabled() {
        let storage = Arc::new(Storage::new(10_000, 0.1));
        let subs = Arc::new(SubscriptionManager::new(storage.clone(), 10, safeguards()));
        let sessions = Arc::new(SessionStore::new(storage, 10));
        subs.initialize(&[cred_config("a")]).await.unwrap();
        subs.update("a", |mut c| {
            c.status = CredentialStatus::Limited;
            c
        })
        .await
        .unwrap();
        let balancer = AllocationBalancer::new(subs, sessions, 0.85, false, rebalance_config());
        assert!(matches!(balancer.select().await, Err(GatewayError::Exhausted)));
    }

    #[tokio::test]
    async fn allocate_creates_session_and_records_binding() {
        let (balancer, subs, _sessions) = harness().await;
        let result = balancer.allocate("client-1").await.unwrap();
        let session = result.session.expect("credential selection carries a session");
        assert_eq!(session.id, "client-1");
        let credential = subs.get(&session.subscription_id).await.unwrap();
        assert!(credential.assigned_clients.contains("client-1"));
    }

    #[tokio::test]
    async fn deallocate_is_idempotent_and_restores_assigned_clients() {
        let (balancer, subs, _sessions) = harness().await;
        let result = balancer.allocate("client-1").await.unwrap();
        let sub_id = result.session.unwrap().subscription_id;
        balancer.deallocate("client-1").await;
        let credential = subs.get(&sub_id).await.unwrap();
        assert!(!credential.assigned_clients.contains("client-1"));
        balancer.deallocate("client-1").await; // no-op, does not error or panic
    }

    #[tokio::test]
    async fn rebalance_moves_idle_sessions_from_hottest_to_coldest() {
        let (balancer, subs, sessions) = harness().await;
        subs.update("a", |mut c| {
            c.current_block_id = Some("block-a".into());
            c.current_block_cost = 30.0;
            c
        })
        .await
        .unwrap();
        subs.update("b", |mut c| {
            c.current_block_id = Some("block-b".into());
            c.current_block_cost = 5.0;
            c
        })
        .await
        .unwrap();

        sessions.create("idle-1", "a", None, None).await.unwrap();
        sessions.update("idle-1", |mut s| {
            s.status = SessionStatus::Idle;
            s
        })
        .await
        .unwrap();
        sessions.create("active-1", "a", None, None).await.unwrap();
        sessions.update("active-1", |mut s| {
            s.status = SessionStatus::Active;
            s
        })
        .await
        .unwrap();
        subs.update("a", |mut c| {
            c.assigned_clients.insert("idle-1".into());
            c.assigned_clients.insert("active-1".into());
            c
        })
        .await
        .unwrap();

        let result = balancer.rebalance().await;
        assert_eq!(result.moved, 1);
        assert_eq!(result.from.as_deref(), Some("a"));
        assert_eq!(result.to.as_deref(), Some("b"));

        assert_eq!(sessions.get("idle-1").await.unwrap().subscription_id, "b");
        assert_eq!(sessions.get("active-1").await.unwrap().subscription_id, "a");

        let a = subs.get("a").await.unwrap();
        assert!(!a.assigned_clients.contains("idle-1"));
        assert!(a.assigned_clients.contains("active-1"));
        let b = subs.get("b").await.unwrap();
        assert!(b.assigned_clients.contains("idle-1"));
    }

    #[tokio::test]
    async fn rebalance_is_a_no_op_below_the_cost_gap_threshold() {
        let (balancer, subs, _sessions) = harness().await;
        subs.update("a", |mut c| {
            c.current_block_id = Some("block-a".into());
            c.current_block_cost = 3.0;
            c
        })
        .await
        .unwrap();
        subs.update("b", |mut c| {
            c.current_block_id = Some("block-b".into());
            c.current_block_cost = 1.0;
            c
        })
        .await
        .unwrap();
        let result = balancer.rebalance().await;
        assert_eq!(result.moved, 0);
    }
}
