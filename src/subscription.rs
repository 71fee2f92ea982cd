//! Subscription manager (C6): CRUD + cache over credential records.
//!
//! Shaped after the teacher's `convex_service.rs` (`Clone`-able service
//! wrapping config plus an in-memory fallback), but with real persistence
//! over `storage.rs` instead of stub methods.

use crate::config::{CredentialConfig, SafeguardThresholds};
use crate::storage::Storage;
use crate::types::{Credential, CredentialStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

fn key(id: &str) -> String {
    format!("subscription:{id}")
}

struct Cache {
    entries: HashMap<String, Credential>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn insert(&mut self, credential: Credential) {
        let id = credential.id.clone();
        if !self.entries.contains_key(&id) {
            self.order.push_back(id.clone());
            if self.order.len() > self.capacity {
                if let Some(evict) = self.order.pop_front() {
                    self.entries.remove(&evict);
                }
            }
        }
        self.entries.insert(id, credential);
    }

    fn get(&self, id: &str) -> Option<Credential> {
        self.entries.get(id).cloned()
    }

    fn invalidate(&mut self, id: &str) {
        self.entries.remove(id);
    }
}

pub struct SubscriptionManager {
    storage: Arc<Storage>,
    cache: RwLock<Cache>,
    safeguards: SafeguardThresholds,
}

impl SubscriptionManager {
    pub fn new(storage: Arc<Storage>, cache_capacity: usize, safeguards: SafeguardThresholds) -> Self {
        Self { storage, cache: RwLock::new(Cache::new(cache_capacity)), safeguards }
    }

    /// Reads configured credentials and, for each, creates a fresh runtime
    /// record or merges configured fields into an existing one, per
    /// spec §4.6. Rejects a `weekly_budget <= 0` credential.
    pub async fn initialize(&self, configured: &[CredentialConfig]) -> anyhow::Result<()> {
        for cfg in configured {
            if cfg.weekly_budget <= 0.0 {
                anyhow::bail!("credential {} has non-positive weekly_budget", cfg.id);
            }
            let now = chrono::Utc::now();
            match self.storage.get::<Credential>(&key(&cfg.id)).await {
                Some(mut existing) => {
                    existing.email = cfg.email.clone();
                    existing.config_dir = cfg.config_dir.clone();
                    existing.weekly_budget = cfg.weekly_budget;
                    existing.max_clients = cfg.max_clients;
                    self.storage.set(&key(&cfg.id), &existing).await?;
                }
                None => {
                    let fresh = Credential {
                        id: cfg.id.clone(),
                        email: cfg.email.clone(),
                        kind: cfg.kind.clone(),
                        config_dir: cfg.config_dir.clone(),
                        weekly_budget: cfg.weekly_budget,
                        weekly_used: 0.0,
                        current_block_id: None,
                        current_block_cost: 0.0,
                        block_start: None,
                        block_end: None,
                        assigned_clients: HashSet::new(),
                        max_clients: cfg.max_clients,
                        health_score: 100.0,
                        status: CredentialStatus::Available,
                        burn_rate_usd_per_hour: 0.0,
                        tokens_per_minute: 0.0,
                        last_usage_update_ts: None,
                        last_request_ts: None,
                        created_at: now,
                    };
                    self.storage.set(&key(&cfg.id), &fresh).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        if let Some(cached) = self.cache.read().await.get(id) {
            return Some(cached);
        }
        let loaded: Option<Credential> = self.storage.get(&key(id)).await;
        if let Some(c) = &loaded {
            self.cache.write().await.insert(c.clone());
        }
        loaded
    }

    pub async fn get_all(&self) -> Vec<Credential> {
        let keys = self.storage.list("subscription:").await;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(c) = self.storage.get::<Credential>(&k).await {
                out.push(c);
            }
        }
        out
    }

    /// Read-modify-write with validation: `delta` receives the current
    /// record and returns the updated one.
    pub async fn update<F>(&self, id: &str, delta: F) -> anyhow::Result<Credential>
    where
        F: FnOnce(Credential) -> Credential,
    {
        let current = self
            .get(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("credential {id} not found"))?;
        let updated = delta(current);
        self.storage.set(&key(id), &updated).await?;
        self.cache.write().await.insert(updated.clone());
        Ok(updated)
    }

    pub async fn invalidate_cache(&self, id: &str) {
        self.cache.write().await.invalidate(id);
    }

    /// `false` if status is limited/cooldown, weekly share exceeds the
    /// health-check threshold, or the credential is at capacity.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let all = self.get_all().await;
        all.into_iter()
            .map(|c| {
                let healthy = !matches!(c.status, CredentialStatus::Limited | CredentialStatus::Cooldown)
                    && (c.weekly_used / c.weekly_budget) < self.safeguards.health_check_weekly_ratio
                    && (c.assigned_clients.len() as u32) < c.max_clients;
                (c.id.clone(), healthy)
            })
            .collect()
    }
}
