//! Append-only request log (ambient stack).
//!
//! Same thin-service-over-shared-state shape as `convex_service.rs`, made
//! real: a bounded in-memory ring rather than a stub, with every append
//! also emitted through `tracing` so the log survives process restarts in
//! whatever collector the deployment wires up, even though the ring
//! itself does not persist.

use crate::types::LogRecord;
use std::collections::VecDeque;
use tokio::sync::RwLock;

pub struct LogStore {
    capacity: usize,
    entries: RwLock<VecDeque<LogRecord>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    pub async fn append(&self, record: LogRecord) {
        tracing::info!(
            id = %record.id,
            backend = %record.backend_name,
            session_id = ?record.session_id,
            cost_usd = record.cost_usd,
            duration_ms = record.duration_ms,
            degraded = record.degraded,
            error = ?record.error,
            "request logged"
        );

        let mut guard = self.entries.write().await;
        guard.push_back(record);
        if guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    /// The `n` most recently appended records, newest last.
    pub async fn recent(&self, n: usize) -> Vec<LogRecord> {
        let guard = self.entries.read().await;
        let skip = guard.len().saturating_sub(n);
        guard.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            ts: Utc::now(),
            backend_name: "local".to_string(),
            session_id: None,
            duration_ms: 10,
            cost_usd: 0.01,
            input_tokens: 1,
            output_tokens: 1,
            degraded: false,
            error: None,
            request_summary: "hi".to_string(),
        }
    }

    #[tokio::test]
    async fn append_then_recent_round_trips() {
        let store = LogStore::new(10);
        store.append(record("a")).await;
        store.append(record("b")).await;
        let recent = store.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, "b");
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let store = LogStore::new(2);
        store.append(record("a")).await;
        store.append(record("b")).await;
        store.append(record("c")).await;
        let recent = store.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "b");
        assert_eq!(recent[1].id, "c");
    }

    #[tokio::test]
    async fn recent_caps_to_requested_count() {
        let store = LogStore::new(10);
        for id in ["a", "b", "c"] {
            store.append(record(id)).await;
        }
        let recent = store.recent(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "c");
    }
}
