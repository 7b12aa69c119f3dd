//! TradeFleet - Multi-tenant autonomous trading agents
//! Mission: Supervise per-agent decision loops against real venues while
//! keeping every credential sealed

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradefleet_backend::{
    api::{build_router, AppState},
    auth::JwtHandler,
    config::Config,
    crypto::{StorageVault, TransportVault},
    market::MarketSnapshotter,
    reconcile::Reconciler,
    registry::AdapterRegistry,
    scheduler::AgentScheduler,
    selector::CandidateSelector,
    store::Store,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradefleet_backend=info,tradefleet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;
    info!(db = %cfg.db_path, addr = %cfg.bind_addr, "starting tradefleet");

    let storage_vault = StorageVault::new(&cfg.data_key);
    let transport = Arc::new(
        TransportVault::from_pem_file(&cfg.rsa_key_path)
            .context("load RSA private key for transport envelopes")?,
    );
    let store = Store::open(&cfg.db_path, storage_vault)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("TradeFleet/0.1")
        .build()
        .context("build http client")?;

    let registry = Arc::new(AdapterRegistry::new(
        http.clone(),
        Duration::from_secs(cfg.adapter_cache_ttl_secs),
    ));
    let selector = Arc::new(CandidateSelector::new(
        http.clone(),
        cfg.ai500_api_base.clone(),
        cfg.oi_api_base.clone(),
    ));
    let snapshotter = Arc::new(MarketSnapshotter::new(http.clone(), &cfg.market_api_base));

    let scheduler = Arc::new(AgentScheduler::new(
        store.clone(),
        registry.clone(),
        selector,
        snapshotter,
        http.clone(),
        cfg.decision_retention,
    ));
    let resumed = scheduler.resume_running_agents().await?;
    info!(resumed, "running agents resumed from store");

    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry,
        Duration::from_secs(cfg.fill_sync_secs),
        Duration::from_secs(cfg.position_sync_secs),
    ));
    tokio::spawn(reconciler.clone().run_fill_sync(shutdown.child_token()));
    tokio::spawn(reconciler.clone().run_position_sync(shutdown.child_token()));

    let jwt = Arc::new(JwtHandler::new(cfg.jwt_secret.clone()));
    let router = build_router(AppState {
        store: store.clone(),
        scheduler: scheduler.clone(),
        transport,
        jwt,
    });

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "api listening");

    let signal_cancel = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            signal_cancel.cancel();
        })
        .await?;

    // drain: workers first, then the reconcilers, then the store
    scheduler.stop_all().await;
    shutdown.cancel();
    store.flush().await?;
    info!("shutdown complete");
    Ok(())
}
