//! Process supervision: background tickers and graceful shutdown.
//!
//! The shutdown wait itself is the teacher's `shutdown_signal()`
//! (`ctrl_c` / SIGTERM via `tokio::select!`); this module adds the two
//! periodic tickers spec §5 calls for and the bounded-grace drain that
//! runs once a shutdown signal fires.

use crate::balancer::AllocationBalancer;
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Runs the stale-session marker and the rebalancer on their own
/// intervals until `shutdown` is cancelled. At most one rebalance runs
/// at a time; a tick that lands while the previous rebalance is still
/// in flight is dropped rather than queued.
pub async fn run_background_tickers(
    sessions: Arc<SessionStore>,
    balancer: Arc<AllocationBalancer>,
    stale_interval: Duration,
    stale_idle_ms: i64,
    rebalance_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut stale_ticker = tokio::time::interval(stale_interval);
    let mut rebalance_ticker = tokio::time::interval(rebalance_interval);
    let rebalancing = Arc::new(tokio::sync::Mutex::new(()));

    loop {
        tokio::select! {
            _ = stale_ticker.tick() => {
                match sessions.mark_stale(stale_idle_ms).await {
                    Ok(count) if count > 0 => tracing::info!(count, "marked sessions stale"),
                    Ok(_) => {}
                    Err(error) => tracing::error!(%error, "stale-session sweep failed"),
                }
            }
            _ = rebalance_ticker.tick() => {
                match rebalancing.clone().try_lock_owned() {
                    Ok(guard) => {
                        let balancer = balancer.clone();
                        tokio::spawn(async move {
                            let result = balancer.rebalance().await;
                            if result.moved > 0 {
                                tracing::info!(moved = result.moved, from = ?result.from, to = ?result.to, "rebalance");
                            }
                            drop(guard);
                        });
                    }
                    Err(_) => tracing::debug!("rebalance tick dropped, previous cycle still in flight"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Resolves when ctrl-C or (on unix) SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Runs once a shutdown signal fires: flags every local pool for
/// shutdown and waits a bounded grace period for in-flight work to
/// drain, then closes storage. Pools are drained concurrently; one
/// pool's grace wait never blocks another's.
pub async fn graceful_shutdown(registry: &Registry, storage: &Storage, grace: Duration) {
    tracing::info!("shutdown signal received, draining pools");

    let waits = registry.all().iter().filter_map(|entry| entry.pool.as_ref()).map(|pool| pool.shutdown(grace));
    futures::future::join_all(waits).await;

    storage.close().await;
    tracing::info!("shutdown complete");
}

/// Installs a panic hook that logs the panic through `tracing` instead
/// of only writing to stderr, per spec §5's "catch uncaught failures and
/// log them" requirement. Rust isolates a panicking `tokio::spawn` task
/// from the rest of the process already; this hook is the last-resort
/// visibility layer on top of that isolation.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "uncaught panic");
        default_hook(info);
    }));
}
