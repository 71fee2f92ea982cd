//! Session store (C7): CRUD + cache over client sessions, per-credential
//! index, idle/stale marking, reassignment.
//!
//! Same shape as `subscription.rs`, generalized for the client-session
//! entity; the creation path's two non-atomic writes and the read path's
//! tolerance for a missing-from-index entry follow spec §4.7/§3.

use crate::storage::Storage;
use crate::types::{ClientSession, SessionStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

fn key(client_id: &str) -> String {
    format!("session:{client_id}")
}

fn index_key(subscription_id: &str) -> String {
    format!("index:sessions_by_subscription:{subscription_id}")
}

struct Cache {
    entries: HashMap<String, ClientSession>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn insert(&mut self, session: ClientSession) {
        let id = session.id.clone();
        if !self.entries.contains_key(&id) {
            self.order.push_back(id.clone());
            if self.order.len() > self.capacity {
                if let Some(evict) = self.order.pop_front() {
                    self.entries.remove(&evict);
                }
            }
        }
        self.entries.insert(id, session);
    }

    fn get(&self, id: &str) -> Option<ClientSession> {
        self.entries.get(id).cloned()
    }

    fn invalidate(&mut self, id: &str) {
        self.entries.remove(id);
    }
}

pub struct SessionStore {
    storage: Arc<Storage>,
    cache: RwLock<Cache>,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>, cache_capacity: usize) -> Self {
        Self { storage, cache: RwLock::new(Cache::new(cache_capacity)) }
    }

    /// Creating a session for an existing `client_id` is an error.
    pub async fn create(
        &self,
        client_id: &str,
        subscription_id: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> anyhow::Result<ClientSession> {
        if self.get(client_id).await.is_some() {
            anyhow::bail!("session {client_id} already exists");
        }
        let now = chrono::Utc::now();
        let session = ClientSession {
            id: client_id.to_string(),
            subscription_id: subscription_id.to_string(),
            allocated_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            session_cost: 0.0,
            session_tokens: 0,
            request_count: 0,
            client_ip,
            user_agent,
        };
        // Two non-atomic writes: session record, then index. A crash
        // between them leaves a missing-from-index entry, tolerated by
        // the read path (spec §4.7, §3).
        self.storage.set(&key(client_id), &session).await?;
        self.storage.add_to_index(&index_key(subscription_id), client_id).await;
        self.cache.write().await.insert(session.clone());
        Ok(session)
    }

    pub async fn get(&self, client_id: &str) -> Option<ClientSession> {
        if let Some(cached) = self.cache.read().await.get(client_id) {
            return Some(cached);
        }
        let loaded: Option<ClientSession> = self.storage.get(&key(client_id)).await;
        if let Some(s) = &loaded {
            self.cache.write().await.insert(s.clone());
        }
        loaded
    }

    /// Always bumps `last_activity`.
    pub async fn update<F>(&self, client_id: &str, delta: F) -> anyhow::Result<ClientSession>
    where
        F: FnOnce(ClientSession) -> ClientSession,
    {
        let current = self.get(client_id).await.ok_or_else(|| anyhow::anyhow!("session {client_id} not found"))?;
        let mut updated = delta(current);
        updated.last_activity = chrono::Utc::now();
        self.storage.set(&key(client_id), &updated).await?;
        self.cache.write().await.insert(updated.clone());
        Ok(updated)
    }

    pub async fn delete(&self, client_id: &str) {
        if let Some(session) = self.get(client_id).await {
            self.storage.remove_from_index(&index_key(&session.subscription_id), client_id).await;
        }
        self.storage.delete(&key(client_id)).await;
        self.cache.write().await.invalidate(client_id);
    }

    /// Reads the index, loads each session, silently skips missing
    /// entries (eventual consistency, spec §4.7/§3).
    pub async fn get_by_subscription(&self, subscription_id: &str) -> Vec<ClientSession> {
        let ids = self.storage.get_index(&index_key(subscription_id)).await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get(&id).await {
                out.push(session);
            }
        }
        out
    }

    /// Any idle session whose `last_activity` is older than `idle_ms`
    /// becomes stale. Returns the count transitioned.
    pub async fn mark_stale(&self, idle_ms: i64) -> anyhow::Result<usize> {
        let keys = self.storage.list("session:").await;
        let now = chrono::Utc::now();
        let mut count = 0;
        for k in keys {
            if let Some(session) = self.storage.get::<ClientSession>(&k).await {
                if session.status == SessionStatus::Idle {
                    let idle_for = (now - session.last_activity).num_milliseconds();
                    if idle_for > idle_ms {
                        let client_id = session.id.clone();
                        self.update(&client_id, |mut s| {
                            s.status = SessionStatus::Stale;
                            s
                        })
                        .await?;
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Removes from the old index, adds to the new, resets counters.
    pub async fn reassign(&self, client_id: &str, new_subscription_id: &str) -> anyhow::Result<ClientSession> {
        let current = self.get(client_id).await.ok_or_else(|| anyhow::anyhow!("session {client_id} not found"))?;
        self.storage.remove_from_index(&index_key(&current.subscription_id), client_id).await;
        self.storage.add_to_index(&index_key(new_subscription_id), client_id).await;

        let now = chrono::Utc::now();
        let updated = ClientSession {
            subscription_id: new_subscription_id.to_string(),
            session_cost: 0.0,
            session_tokens: 0,
            request_count: 0,
            allocated_at: now,
            last_activity: now,
            ..current
        };
        self.storage.set(&key(client_id), &updated).await?;
        self.cache.write().await.insert(updated.clone());
        Ok(updated)
    }
}
