//! Agent Scheduler
//! Mission: One supervised perceive-decide-act worker per running agent

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decision::{parse_decision, validate_actions, ValidationContext};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::executor::OrderExecutor;
use crate::llm::{completion_timeout, HttpLlmClient, LlmClient};
use crate::market::MarketSnapshotter;
use crate::models::{Agent, Decision, ModelConfig};
use crate::prompt::{build_prompts, PromptInputs};
use crate::registry::AdapterRegistry;
use crate::selector::CandidateSelector;
use crate::store::Store;

/// Builds the per-tick LLM client. Swappable so tests can script
/// responses.
pub type LlmFactory =
    Arc<dyn Fn(&ModelConfig, Duration) -> CoreResult<Arc<dyn LlmClient>> + Send + Sync>;

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// What one tick produced; returned by `run_tick` for callers that drive
/// ticks directly (tests, admin tooling).
#[derive(Debug, Clone)]
pub struct TickReport {
    pub decision_id: Uuid,
    pub intent_count: usize,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: Uuid,
    pub name: String,
    pub is_running: bool,
    pub worker_alive: bool,
    pub last_error: Option<String>,
    pub total_equity: Option<f64>,
    pub last_decision_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub agent_id: Uuid,
    pub name: String,
    pub total_equity: f64,
    pub initial_balance: f64,
    pub pnl_pct: f64,
    pub position_count: usize,
    pub ts: i64,
}

pub struct AgentScheduler {
    store: Store,
    registry: Arc<AdapterRegistry>,
    selector: Arc<CandidateSelector>,
    snapshotter: Arc<MarketSnapshotter>,
    executor: OrderExecutor,
    llm_factory: LlmFactory,
    decision_retention: usize,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
    root_cancel: CancellationToken,
}

impl AgentScheduler {
    pub fn new(
        store: Store,
        registry: Arc<AdapterRegistry>,
        selector: Arc<CandidateSelector>,
        snapshotter: Arc<MarketSnapshotter>,
        http: reqwest::Client,
        decision_retention: usize,
    ) -> Self {
        let llm_factory: LlmFactory = Arc::new(move |cfg, timeout| {
            let client = HttpLlmClient::from_model_config(http.clone(), cfg, timeout)?;
            Ok(Arc::new(client) as Arc<dyn LlmClient>)
        });
        Self {
            executor: OrderExecutor::new(store.clone()),
            store,
            registry,
            selector,
            snapshotter,
            llm_factory,
            decision_retention,
            workers: Mutex::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Replace the LLM factory. Test hook.
    pub fn with_llm_factory(mut self, factory: LlmFactory) -> Self {
        self.llm_factory = factory;
        self
    }

    pub fn worker_alive(&self, agent_id: Uuid) -> bool {
        self.workers
            .lock()
            .get(&agent_id)
            .map(|w| !w.join.is_finished())
            .unwrap_or(false)
    }

    /// Reconcile workers with one user's Store rows: spawn the missing,
    /// stop the orphaned.
    pub async fn load_user_agents(self: &Arc<Self>, user_id: Uuid) -> anyhow::Result<Vec<Agent>> {
        let agents = self.store.list_agents(user_id).await?;
        for agent in &agents {
            if agent.is_running && !self.worker_alive(agent.id) {
                if let Err(e) = self.start(agent.id).await {
                    warn!(agent = %agent.name, "could not resume agent: {e}");
                    self.store
                        .set_agent_running(agent.id, false, Some(&e.summary()))
                        .await?;
                }
            }
        }
        self.stop_orphans().await;
        Ok(agents)
    }

    /// Boot path: resume every agent marked running across all users.
    pub async fn resume_running_agents(self: &Arc<Self>) -> anyhow::Result<usize> {
        let agents = self.store.list_all_agents().await?;
        let mut resumed = 0;
        for agent in agents {
            if !agent.is_running {
                continue;
            }
            match self.start(agent.id).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(agent = %agent.name, "resume failed: {e}");
                    self.store
                        .set_agent_running(agent.id, false, Some(&e.summary()))
                        .await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Stop workers whose Store row no longer exists.
    async fn stop_orphans(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.workers.lock().keys().copied().collect();
        for id in ids {
            match self.store.get_agent(id).await {
                Ok(None) => {
                    info!(agent_id = %id, "stopping orphaned worker");
                    if let Some(handle) = self.workers.lock().remove(&id) {
                        handle.cancel.cancel();
                    }
                }
                _ => {}
            }
        }
    }

    /// Verify the agent is fully configured and spawn its worker. A
    /// second start while the worker lives is a no-op.
    pub async fn start(self: &Arc<Self>, agent_id: Uuid) -> CoreResult<()> {
        if self.worker_alive(agent_id) {
            return Ok(());
        }

        let full = self
            .store
            .full_config(agent_id)
            .await
            .map_err(|e| CoreError::Config(e.to_string()))?;
        if !full.model.enabled {
            return Err(CoreError::Config("model config is disabled".into()));
        }
        if !full.exchange.enabled {
            return Err(CoreError::Config("exchange config is disabled".into()));
        }
        // adapter construction validates the venue tag
        self.registry.get_or_build(&self.store, agent_id).await?;

        self.spawn_worker(&full.agent);
        self.store
            .set_agent_running(agent_id, true, None)
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        info!(agent = %full.agent.name, "agent started");
        Ok(())
    }

    /// Signal the worker to exit before its next tick. An in-flight tick
    /// finishes on its own deadlines.
    pub async fn stop(&self, agent_id: Uuid) -> CoreResult<()> {
        if let Some(handle) = self.workers.lock().remove(&agent_id) {
            handle.cancel.cancel();
        }
        self.store
            .set_agent_running(agent_id, false, None)
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        info!(agent_id = %agent_id, "agent stopped");
        Ok(())
    }

    /// Cancel every worker and wait (bounded) for each to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<(Uuid, WorkerHandle)> = self.workers.lock().drain().collect();
        self.root_cancel.cancel();
        for (id, handle) in handles {
            handle.cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(10), handle.join)
                .await
                .is_err()
            {
                warn!(agent_id = %id, "worker did not exit within the shutdown window");
            }
        }
        info!("all workers stopped");
    }

    fn spawn_worker(self: &Arc<Self>, agent: &Agent) {
        let cancel = self.root_cancel.child_token();
        let sched = self.clone();
        let agent_id = agent.id;
        let interval_secs = agent.scan_interval_secs();
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            sched.worker_loop(agent_id, interval_secs, worker_cancel).await;
        });
        self.workers
            .lock()
            .insert(agent_id, WorkerHandle { cancel, join });
    }

    async fn worker_loop(
        self: Arc<Self>,
        agent_id: Uuid,
        mut interval_secs: u64,
        cancel: CancellationToken,
    ) {
        info!(agent_id = %agent_id, interval_secs, "worker loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.run_tick(agent_id).await {
                Ok(report) => {
                    let _ = self.store.set_agent_last_error(agent_id, None).await;
                    info!(
                        agent_id = %agent_id,
                        intents = report.intent_count,
                        note = %report.note,
                        "tick complete"
                    );
                }
                Err(e) => {
                    let summary = e.summary();
                    warn!(agent_id = %agent_id, "tick failed: {summary}");
                    let _ = self
                        .store
                        .set_agent_last_error(agent_id, Some(&summary))
                        .await;
                    if e.kind().stops_agent() || e.kind() == ErrorKind::Fatal {
                        let _ = self
                            .store
                            .set_agent_running(agent_id, false, Some(&summary))
                            .await;
                        break;
                    }
                }
            }

            // pick up interval/row changes between ticks
            match self.store.get_agent(agent_id).await {
                Ok(Some(agent)) => {
                    interval_secs = agent.scan_interval_secs();
                    if !agent.is_running {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(agent_id = %agent_id, "agent reload failed: {e}"),
            }
        }
        self.workers.lock().remove(&agent_id);
        info!(agent_id = %agent_id, "worker loop exited");
    }

    /// One perceive-decide-act tick. Every step either commits or leaves
    /// no trace; transient failures end the tick and the next one retries
    /// by construction.
    pub async fn run_tick(&self, agent_id: Uuid) -> CoreResult<TickReport> {
        let full = self
            .store
            .full_config(agent_id)
            .await
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let agent = &full.agent;
        let strategy = &full.strategy;

        let adapter = self.registry.get_or_build(&self.store, agent_id).await?;

        // perceive: account + venue positions
        let balance = adapter.get_balance().await?;
        let venue_positions = adapter.get_positions().await?;

        let candidates = self.selector.select(strategy).await?;

        let mut market = HashMap::new();
        for cand in &candidates {
            let snapshot = self
                .snapshotter
                .snapshot(&cand.symbol, &strategy.timeframes, strategy.kline_count)
                .await?;
            market.insert(cand.symbol.clone(), snapshot);
        }

        let (system_prompt, user_prompt) = build_prompts(&PromptInputs {
            agent,
            strategy,
            equity: balance.total_equity,
            balance: &balance,
            candidates: &candidates,
            market: &market,
            open_positions: &venue_positions,
            now: chrono::Utc::now(),
        });

        // decide
        let timeout = completion_timeout(Duration::from_secs(agent.scan_interval_secs()));
        let llm = (self.llm_factory)(&full.model, timeout)?;
        let raw = match llm.complete(&system_prompt, &user_prompt).await {
            Ok(text) => text,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Timeout
                        | ErrorKind::RateLimit
                        | ErrorKind::Provider
                        | ErrorKind::TransientIo
                ) =>
            {
                // the tick ends here; record the no-op decision
                let decision_id = self
                    .record_decision(
                        agent_id,
                        &system_prompt,
                        &user_prompt,
                        "",
                        "[]",
                        vec![],
                        e.kind().as_str(),
                    )
                    .await?;
                return Ok(TickReport {
                    decision_id,
                    intent_count: 0,
                    note: e.kind().as_str().to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let parsed = parse_decision(&raw);
        let open_positions = self
            .store
            .open_positions(agent_id)
            .await
            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
        let ctx = ValidationContext {
            strategy,
            candidates: candidates.iter().map(|c| c.symbol.clone()).collect(),
            open_positions: &open_positions,
            one_way_mode: adapter.one_way_mode(),
        };
        let validated = validate_actions(parsed.actions, &ctx);

        // act
        let outcome = self
            .executor
            .execute(agent, adapter.as_ref(), &validated, balance.total_equity)
            .await
            .map_err(|e| CoreError::TransientIo(e.to_string()))?;

        let actions_json = serde_json::to_string(&validated)
            .map_err(|e| CoreError::Fatal(format!("actions encode: {e}")))?;
        let decision_id = self
            .record_decision(
                agent_id,
                &system_prompt,
                &user_prompt,
                &raw,
                &actions_json,
                outcome.intent_ids.clone(),
                &parsed.note,
            )
            .await?;

        if let Some(reason) = outcome.stop_agent {
            return Err(CoreError::Auth(reason));
        }

        Ok(TickReport {
            decision_id,
            intent_count: outcome.intent_ids.len(),
            note: parsed.note,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_decision(
        &self,
        agent_id: Uuid,
        system_prompt: &str,
        user_prompt: &str,
        raw: &str,
        actions_json: &str,
        order_ids: Vec<Uuid>,
        note: &str,
    ) -> CoreResult<Uuid> {
        let decision = Decision {
            id: Uuid::new_v4(),
            agent_id,
            ts: chrono::Utc::now().timestamp_millis(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            raw_response: raw.to_string(),
            actions_json: actions_json.to_string(),
            order_ids,
            note: note.to_string(),
        };
        self.store
            .insert_decision(&decision)
            .await
            .map_err(|e| CoreError::TransientIo(e.to_string()))?;
        let _ = self
            .store
            .prune_decisions(agent_id, self.decision_retention)
            .await;
        Ok(decision.id)
    }

    pub async fn get_status(&self, agent_id: Uuid) -> anyhow::Result<Option<AgentStatus>> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(None);
        };
        let equity = self.store.latest_equity(agent_id).await?;
        let last_decision = self.store.decisions(agent_id, 1, true).await?;
        Ok(Some(AgentStatus {
            agent_id,
            name: agent.name,
            is_running: agent.is_running,
            worker_alive: self.worker_alive(agent_id),
            last_error: agent.last_error,
            total_equity: equity.map(|e| e.total_equity),
            last_decision_ts: last_decision.first().map(|d| d.ts),
        }))
    }

    /// Leaderboard across every agent, best pnl percentage first.
    pub async fn get_competition(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let agents = self.store.list_all_agents().await?;
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut out = Vec::new();
        for agent in agents {
            if !seen.insert(agent.id) {
                continue;
            }
            let Some(snap) = self.store.latest_equity(agent.id).await? else {
                continue;
            };
            let pnl_pct = if agent.initial_balance > 0.0 {
                (snap.total_equity - agent.initial_balance) / agent.initial_balance * 100.0
            } else {
                0.0
            };
            out.push(LeaderboardEntry {
                agent_id: agent.id,
                name: agent.name,
                total_equity: snap.total_equity,
                initial_balance: agent.initial_balance,
                pnl_pct,
                position_count: snap.position_count,
                ts: snap.ts,
            });
        }
        out.sort_by(|a, b| b.pnl_pct.partial_cmp(&a.pnl_pct).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    pub async fn get_top(&self, n: usize) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let mut all = self.get_competition().await?;
        all.truncate(n);
        Ok(all)
    }
}
