use anyhow::Result;
use rust_ai::balancer::AllocationBalancer;
use rust_ai::config::Config;
use rust_ai::http::{create_router, AppState};
use rust_ai::lifecycle::Lifecycle;
use rust_ai::log_store::LogStore;
use rust_ai::notify::NotificationManager;
use rust_ai::rate_limit::RateLimiter;
use rust_ai::registry::Registry;
use rust_ai::session::SessionStore;
use rust_ai::storage::Storage;
use rust_ai::subscription::SubscriptionManager;
use rust_ai::supervisor;
use rust_ai::usage::UsageTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    supervisor::install_panic_hook();

    let config = Config::from_env();
    let http_client = reqwest::Client::new();

    let storage = Arc::new(Storage::new(config.storage.max_entries, config.storage.eviction_batch_percent));

    let subscriptions = Arc::new(SubscriptionManager::new(storage.clone(), config.storage.subscription_cache_size, config.safeguards));
    subscriptions.initialize(&config.credentials).await?;

    let sessions = Arc::new(SessionStore::new(storage.clone(), config.storage.session_cache_size));
    let usage = Arc::new(UsageTracker::new(storage.clone(), subscriptions.clone(), config.safeguards));

    let registry = Arc::new(Registry::new(
        config.backends.clone(),
        http_client.clone(),
        Duration::from_secs(config.pool_defaults.queue_item_timeout_secs),
        Duration::from_secs(config.pool_defaults.sweep_interval_secs),
        Duration::from_secs(config.deadlines.registry_availability_secs),
    ));

    let balancer = Arc::new(AllocationBalancer::new(
        subscriptions.clone(),
        sessions.clone(),
        config.safeguards.allocation_weekly_ratio,
        config.fallback_enabled,
        config.rebalance,
    ));

    let notify = Arc::new(NotificationManager::new(
        config.notification_rules.clone(),
        config.webhook_url.clone(),
        Duration::from_secs(config.deadlines.webhook_secs),
        http_client.clone(),
    ));

    let log_store = Arc::new(LogStore::new(config.log_store_capacity));
    let rate_limiter = Arc::new(RateLimiter::new(Duration::from_secs(config.rate_limit_window_secs), config.rate_limit_max_requests));

    let lifecycle = Arc::new(Lifecycle {
        registry: registry.clone(),
        balancer: balancer.clone(),
        subscriptions: subscriptions.clone(),
        sessions: sessions.clone(),
        usage,
        notify,
        log_store: log_store.clone(),
        validation: config.validation.clone(),
    });

    let shutdown_token = CancellationToken::new();
    let tickers = tokio::spawn(supervisor::run_background_tickers(
        sessions,
        balancer,
        Duration::from_secs(config.stale_ticker_interval_secs),
        config.stale_session_idle_ms,
        Duration::from_secs(config.rebalance.interval_secs),
        shutdown_token.clone(),
    ));

    let config = Arc::new(config);
    let state = AppState { lifecycle, registry: registry.clone(), log_store, rate_limiter, config: config.clone() };
    let app = create_router(state);

    let addr: std::net::SocketAddr = config.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(supervisor::shutdown_signal())
        .await?;

    shutdown_token.cancel();
    let _ = tickers.await;
    supervisor::graceful_shutdown(&registry, &storage, Duration::from_secs(config.pool_defaults.shutdown_grace_secs)).await;

    Ok(())
}
