//! Process pool (C2): bounded-concurrency executor for the local backend.
//!
//! One pool per local adapter. No direct teacher analog; built fresh from
//! spec §4.2/§5, with the concurrent-admission test shape grounded on the
//! pack's `budget_concurrency.rs`.

use crate::error::GatewayError;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

trait QueueTask: Send {
    fn enqueue_time(&self) -> Instant;
    fn fail_timeout(self: Box<Self>);
    fn fail_closed(self: Box<Self>);
    fn dispatch(self: Box<Self>, inner: Arc<PoolInner>);
}

struct TypedQueueItem<O> {
    enqueue_time: Instant,
    work: Pin<Box<dyn Future<Output = Result<O, GatewayError>> + Send>>,
    tx: oneshot::Sender<Result<O, GatewayError>>,
}

impl<O: Send + 'static> QueueTask for TypedQueueItem<O> {
    fn enqueue_time(&self) -> Instant {
        self.enqueue_time
    }

    fn fail_timeout(self: Box<Self>) {
        let _ = self.tx.send(Err(GatewayError::QueueTimeout));
    }

    fn fail_closed(self: Box<Self>) {
        let _ = self.tx.send(Err(GatewayError::PoolClosed));
    }

    fn dispatch(self: Box<Self>, inner: Arc<PoolInner>) {
        tokio::spawn(async move {
            let result = self.work.await;
            let _ = self.tx.send(result);
            inner.on_complete().await;
        });
    }
}

struct PoolState {
    active: usize,
    queue: VecDeque<Box<dyn QueueTask>>,
    processed: u64,
    queued_total: u64,
    failed: u64,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_concurrent: usize,
    queue_depth: usize,
    queue_item_timeout: Duration,
    draining: AtomicBool,
}

impl PoolInner {
    async fn on_complete(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.active = state.active.saturating_sub(1);
            state.processed += 1;
        }
        self.drain().await;
    }

    /// Pops and dispatches queued items under a re-entrancy guard so only
    /// one drainer runs at a time (spec §4.2).
    async fn drain(self: &Arc<Self>) {
        if self.draining.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.shutdown || state.active >= self.max_concurrent {
                    None
                } else {
                    state.queue.pop_front().inspect(|_| state.active += 1)
                }
            };
            match next {
                Some(item) => item.dispatch(self.clone()),
                None => break,
            }
        }
        self.draining.store(false, Ordering::Release);
    }

    async fn sweep(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let timeout = self.queue_item_timeout;
        let mut kept = VecDeque::with_capacity(state.queue.len());
        while let Some(item) = state.queue.pop_front() {
            if now.duration_since(item.enqueue_time()) > timeout {
                state.failed += 1;
                item.fail_timeout();
            } else {
                kept.push_back(item);
            }
        }
        state.queue = kept;
    }
}

/// Observability snapshot, per spec §4.2.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub processed: u64,
    pub queued_total: u64,
    pub failed: u64,
    pub utilization: f64,
}

pub struct Pool {
    inner: Arc<PoolInner>,
    sweep_cancel: CancellationToken,
}

impl Pool {
    pub fn new(max_concurrent: usize, queue_depth: usize, queue_item_timeout: Duration, sweep_interval: Duration) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                active: 0,
                queue: VecDeque::new(),
                processed: 0,
                queued_total: 0,
                failed: 0,
                shutdown: false,
            }),
            max_concurrent,
            queue_depth,
            queue_item_timeout,
            draining: AtomicBool::new(false),
        });

        let sweep_cancel = CancellationToken::new();
        let sweep_inner = inner.clone();
        let sweep_token = sweep_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep_inner.sweep().await,
                    _ = sweep_token.cancelled() => break,
                }
            }
        });

        Self { inner, sweep_cancel }
    }

    /// Admission per spec §4.2: run immediately under capacity, else
    /// queue, else fail with `QueueFull`.
    pub async fn submit<F, O>(&self, work: F) -> Result<O, GatewayError>
    where
        F: Future<Output = Result<O, GatewayError>> + Send + 'static,
        O: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(GatewayError::PoolClosed);
        }

        if state.active < self.inner.max_concurrent {
            state.active += 1;
            drop(state);
            let item: Box<dyn QueueTask> = Box::new(TypedQueueItem { enqueue_time: Instant::now(), work: Box::pin(work), tx });
            item.dispatch(self.inner.clone());
        } else if state.queue.len() < self.inner.queue_depth {
            state.queued_total += 1;
            let item: Box<dyn QueueTask> = Box::new(TypedQueueItem { enqueue_time: Instant::now(), work: Box::pin(work), tx });
            state.queue.push_back(item);
            drop(state);
        } else {
            return Err(GatewayError::QueueFull);
        }

        rx.await.unwrap_or(Err(GatewayError::PoolClosed))
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let utilization = if self.inner.max_concurrent > 0 {
            state.active as f64 / self.inner.max_concurrent as f64
        } else {
            0.0
        };
        PoolStats {
            active: state.active,
            queued: state.queue.len(),
            max_concurrent: self.inner.max_concurrent,
            queue_depth: self.inner.queue_depth,
            processed: state.processed,
            queued_total: state.queued_total,
            failed: state.failed,
            utilization,
        }
    }

    /// Sets the shutdown flag, fails all queued items, then waits (bounded)
    /// for `active` to reach zero, then stops the sweep ticker.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutdown = true;
            while let Some(item) = state.queue.pop_front() {
                state.failed += 1;
                item.fail_closed();
            }
        }
        let deadline = Instant::now() + grace;
        loop {
            let active = self.inner.state.lock().await.active;
            if active == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.sweep_cancel.cancel();
    }
}
