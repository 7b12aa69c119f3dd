//! End-to-end pipeline tests against the in-memory venue and a scripted
//! LLM: tick -> decision -> intents -> fills -> reconciled positions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::NamedTempFile;
use uuid::Uuid;

use tradefleet_backend::crypto::StorageVault;
use tradefleet_backend::error::CoreError;
use tradefleet_backend::exchange::MockExchange;
use tradefleet_backend::llm::{LlmClient, MockLlm};
use tradefleet_backend::market::MarketSnapshotter;
use tradefleet_backend::models::*;
use tradefleet_backend::reconcile::Reconciler;
use tradefleet_backend::registry::AdapterRegistry;
use tradefleet_backend::scheduler::{AgentScheduler, LlmFactory};
use tradefleet_backend::selector::CandidateSelector;
use tradefleet_backend::store::Store;

const DATA_SECRET: &str = "pipeline-test-data-secret";

struct Harness {
    store: Store,
    scheduler: Arc<AgentScheduler>,
    reconciler: Arc<Reconciler>,
    venue: Arc<MockExchange>,
    llm: Arc<MockLlm>,
    agent: Agent,
    _db: NamedTempFile,
}

async fn harness() -> Harness {
    let db = NamedTempFile::new().unwrap();
    let store = Store::open(
        db.path().to_str().unwrap(),
        StorageVault::new(DATA_SECRET),
    )
    .unwrap();

    let user = User {
        id: Uuid::new_v4(),
        username: "pilot".into(),
        password_hash: "x".into(),
        otp_seed: None,
        created_at: Utc::now(),
    };
    store.insert_user(&user).await.unwrap();

    let strategy = Strategy {
        id: Uuid::new_v4(),
        user_id: user.id,
        name: "majors".into(),
        is_active: true,
        coin_sources: vec![CoinSource::DefaultList],
        custom_coins: vec![],
        // no timeframes: the pipeline skips market fetches entirely
        timeframes: vec![],
        primary_timeframe: "15m".into(),
        kline_count: 50,
        candidate_limit: 12,
        btc_eth_max_leverage: 10.0,
        altcoin_max_leverage: 5.0,
        max_positions: 3,
        prompt_variant: PromptVariant::Default,
        overrides: serde_json::json!({}),
    };
    store.upsert_strategy(&strategy).await.unwrap();

    let model = ModelConfig {
        id: Uuid::new_v4(),
        user_id: user.id,
        provider: "deepseek".into(),
        enabled: true,
        api_key: "sk-test".into(),
        base_url: String::new(),
        model_name: "deepseek-chat".into(),
    };
    store.upsert_model(&model).await.unwrap();

    let exchange = ExchangeConfig {
        id: Uuid::new_v4(),
        user_id: user.id,
        venue: "mock".into(),
        enabled: true,
        testnet: true,
        api_key: "k".into(),
        secret_key: "s".into(),
        passphrase: String::new(),
    };
    store.upsert_exchange(&exchange).await.unwrap();

    let agent = store
        .upsert_agent(&Agent {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: "alpha-1".into(),
            model_id: model.id,
            exchange_id: exchange.id,
            strategy_id: strategy.id,
            initial_balance: 10_000.0,
            scan_interval_minutes: 3,
            is_cross_margin: true,
            custom_prompt: String::new(),
            override_base_prompt: false,
            is_running: false,
            last_error: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let registry = Arc::new(AdapterRegistry::new(http.clone(), Duration::from_secs(15)));
    let venue = Arc::new(MockExchange::new());
    registry.insert(agent.id, venue.clone());

    let llm = Arc::new(MockLlm::new());
    let llm_for_factory = llm.clone();
    let factory: LlmFactory = Arc::new(move |_cfg, _timeout| {
        Ok(llm_for_factory.clone() as Arc<dyn LlmClient>)
    });

    let scheduler = Arc::new(
        AgentScheduler::new(
            store.clone(),
            registry.clone(),
            Arc::new(CandidateSelector::new(http.clone(), None, None)),
            Arc::new(MarketSnapshotter::new(http.clone(), "http://127.0.0.1:1")),
            http,
            500,
        )
        .with_llm_factory(factory),
    );

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry,
        Duration::from_secs(10),
        Duration::from_secs(60),
    ));

    Harness {
        store,
        scheduler,
        reconciler,
        venue,
        llm,
        agent,
        _db: db,
    }
}

#[tokio::test]
async fn hold_tick_records_decision_without_intents() {
    let h = harness().await;
    h.llm.push_response("```json\n[{\"op\": \"HOLD\"}]\n```");

    let report = h.scheduler.run_tick(h.agent.id).await.unwrap();
    assert_eq!(report.intent_count, 0);
    assert_eq!(report.note, "OK");

    let decisions = h.store.decisions(h.agent.id, 10, true).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].system_prompt.is_empty());
    assert!(decisions[0].order_ids.is_empty());
}

#[tokio::test]
async fn unparseable_output_yields_intent_free_noop_decision() {
    let h = harness().await;
    h.llm.push_response("BTC looks strong, I would buy.");

    let report = h.scheduler.run_tick(h.agent.id).await.unwrap();
    assert_eq!(report.intent_count, 0);
    assert_eq!(report.note, "NO_OP");

    let decisions = h.store.decisions(h.agent.id, 10, true).await.unwrap();
    assert_eq!(decisions[0].actions_json, "[]");
    assert!(decisions[0].order_ids.is_empty());
}

#[tokio::test]
async fn llm_timeout_skips_tick_and_next_tick_recovers() {
    let h = harness().await;
    h.llm.push_error(CoreError::Timeout("llm hung".into()));

    let report = h.scheduler.run_tick(h.agent.id).await.unwrap();
    assert_eq!(report.note, "TIMEOUT");
    assert_eq!(report.intent_count, 0);

    let decisions = h.store.decisions(h.agent.id, 10, true).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].raw_response, "");
    assert_eq!(decisions[0].note, "TIMEOUT");

    // next tick proceeds normally
    h.llm.push_response("```json\n[]\n```");
    let report = h.scheduler.run_tick(h.agent.id).await.unwrap();
    assert_eq!(report.note, "OK");
}

#[tokio::test]
async fn validation_downgrade_executes_only_the_sane_action() {
    let h = harness().await;
    h.venue.set_price("BTCUSDT", 50_000.0);
    // altcoin cap is 5, SOLUSDT at 30x must downgrade; BTC at 3x passes
    h.llm.push_response(
        r#"```json
[
  {"op": "OPEN", "symbol": "SOLUSDT", "side": "LONG", "qty": 10, "leverage": 30},
  {"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty": 0.01, "leverage": 3}
]
```"#,
    );

    let report = h.scheduler.run_tick(h.agent.id).await.unwrap();
    assert_eq!(report.intent_count, 1);

    let decisions = h.store.decisions(h.agent.id, 1, true).await.unwrap();
    let actions: serde_json::Value =
        serde_json::from_str(&decisions[0].actions_json).unwrap();
    assert_eq!(actions[0]["op"], "HOLD");
    assert_eq!(actions[0]["downgrade_reason"], "leverage_cap");
    assert_eq!(actions[1]["op"], "OPEN");

    let intents = h.store.intents_for_agent(h.agent.id, 10).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].symbol, "BTCUSDT");
    assert_eq!(intents[0].status, OrderStatus::Filled);
}

#[tokio::test]
async fn open_then_reconcile_builds_position_from_fills() {
    let h = harness().await;
    h.venue.set_price("BTCUSDT", 50_000.0);
    h.llm.push_response(
        r#"```json
[{"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty": 0.01, "leverage": 5}]
```"#,
    );
    h.scheduler.run_tick(h.agent.id).await.unwrap();

    let ingested = h.reconciler.sync_agent_fills(&h.agent).await.unwrap();
    assert_eq!(ingested, 1);

    let pos = h
        .store
        .get_position(h.agent.id, "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!(pos.is_open);
    assert!((pos.qty - 0.01).abs() < 1e-12);
    assert!((pos.avg_entry_price - 50_000.0).abs() < 1e-9);

    // ingesting the same feed again is a no-op
    let again = h.reconciler.sync_agent_fills(&h.agent).await.unwrap();
    assert_eq!(again, 0);
    assert_eq!(h.store.fills_since(h.agent.id, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn manual_close_on_venue_is_reconciled_from_trade_feed() {
    let h = harness().await;
    h.venue.set_price("BTCUSDT", 50_000.0);
    h.llm.push_response(
        r#"```json
[{"op": "OPEN", "symbol": "BTCUSDT", "side": "LONG", "qty": 0.01, "leverage": 5}]
```"#,
    );
    h.scheduler.run_tick(h.agent.id).await.unwrap();
    h.reconciler.sync_agent_fills(&h.agent).await.unwrap();

    // the user closes directly on the exchange at a profit
    h.venue.set_price("BTCUSDT", 52_000.0);
    h.venue.external_close("BTCUSDT", PositionSide::Long);

    h.reconciler.sync_agent_positions(&h.agent).await.unwrap();

    let pos = h
        .store
        .get_position(h.agent.id, "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!(!pos.is_open);
    assert!((pos.realized_pnl_accum - 20.0).abs() < 1e-6);

    // the close came from the feed, not a synthetic fill
    let fills = h.store.fills_since(h.agent.id, 0).await.unwrap();
    assert_eq!(fills.len(), 2);
    assert!(fills
        .iter()
        .all(|f| !f.exchange_trade_id.starts_with("manual-close-")));

    // an equity snapshot landed on the same cadence
    assert!(h.store.latest_equity(h.agent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn silent_venue_close_synthesizes_a_fill() {
    let h = harness().await;
    h.venue.set_price("ETHUSDT", 2_000.0);
    h.llm.push_response(
        r#"```json
[{"op": "OPEN", "symbol": "ETHUSDT", "side": "LONG", "qty": 1.0, "leverage": 3}]
```"#,
    );
    h.scheduler.run_tick(h.agent.id).await.unwrap();
    h.reconciler.sync_agent_fills(&h.agent).await.unwrap();

    // position vanishes with no trade feed entry
    h.venue.external_close_silent("ETHUSDT", PositionSide::Long);
    h.reconciler.sync_agent_positions(&h.agent).await.unwrap();

    let pos = h
        .store
        .get_position(h.agent.id, "ETHUSDT", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert!(!pos.is_open);

    let fills = h.store.fills_since(h.agent.id, 0).await.unwrap();
    assert_eq!(fills.len(), 2);
    assert!(fills
        .iter()
        .any(|f| f.exchange_trade_id.starts_with("manual-close-")));
}

#[tokio::test]
async fn auth_failure_at_venue_stops_the_agent() {
    let h = harness().await;
    h.venue
        .fail_next(tradefleet_backend::error::ErrorKind::Auth, "key revoked");
    h.llm.push_response("```json\n[]\n```");

    let err = h.scheduler.run_tick(h.agent.id).await.unwrap_err();
    assert!(err.kind().stops_agent());
}

#[tokio::test]
async fn start_stop_lifecycle_keeps_one_worker() {
    let h = harness().await;

    h.scheduler.start(h.agent.id).await.unwrap();
    assert!(h.scheduler.worker_alive(h.agent.id));
    assert!(h.store.get_agent(h.agent.id).await.unwrap().unwrap().is_running);

    // idempotent second start
    h.scheduler.start(h.agent.id).await.unwrap();
    assert!(h.scheduler.worker_alive(h.agent.id));

    let stop_ts = Utc::now().timestamp_millis();
    h.scheduler.stop(h.agent.id).await.unwrap();
    assert!(!h.store.get_agent(h.agent.id).await.unwrap().unwrap().is_running);

    // give the cancelled worker a moment to unwind
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.scheduler.worker_alive(h.agent.id));
    assert_eq!(
        h.store
            .intents_created_after(h.agent.id, stop_ts)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn boot_resumes_agents_marked_running() {
    let h = harness().await;
    h.store
        .set_agent_running(h.agent.id, true, None)
        .await
        .unwrap();

    let resumed = h.scheduler.resume_running_agents().await.unwrap();
    assert_eq!(resumed, 1);
    assert!(h.scheduler.worker_alive(h.agent.id));

    h.scheduler.stop_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.scheduler.worker_alive(h.agent.id));
}

#[tokio::test]
async fn start_rejects_disabled_exchange() {
    let h = harness().await;
    let mut exchange = h
        .store
        .get_exchange(h.agent.user_id, h.agent.exchange_id)
        .await
        .unwrap()
        .unwrap();
    exchange.enabled = false;
    exchange.api_key = String::new();
    exchange.secret_key = String::new();
    h.store.upsert_exchange(&exchange).await.unwrap();

    let err = h.scheduler.start(h.agent.id).await.unwrap_err();
    assert_eq!(err.kind(), tradefleet_backend::error::ErrorKind::Config);
    assert!(!h.scheduler.worker_alive(h.agent.id));
}

#[tokio::test]
async fn leaderboard_ranks_by_pnl_pct() {
    let h = harness().await;
    // write two equity snapshots via the reconciler for the one agent
    h.reconciler.sync_agent_positions(&h.agent).await.unwrap();

    let board = h.scheduler.get_competition().await.unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].agent_id, h.agent.id);
    assert!((board[0].total_equity - 10_000.0).abs() < 1e-6);
    assert_eq!(h.scheduler.get_top(5).await.unwrap().len(), 1);
}
