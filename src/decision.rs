// ===============================
// src/decision.rs
// ===============================
//
// Decision loop, satu putaran per `tick_ms`, per symbol:
//   fallback plan -> regime (cadence sendiri) -> collect -> fuse
//   -> fold position update yang pending -> authorize -> execution request
//
// Tick yang gagal di-skip; tidak ada retry lintas tick.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agents::MarketViews;
use crate::collector::Collector;
use crate::config::{FallbackCfg, FusionCfg, RegimeCfg};
use crate::domain::{Event, ExecutionRequest, PositionUpdate, Regime, RegimeLabel};
use crate::execution::ExecutionSink;
use crate::fallback::FallbackCoordinator;
use crate::fusion::FusionEngine;
use crate::metrics::{DECISION_TICKS, REGIME};
use crate::rate_budget::RateBudgetTracker;
use crate::regime::RegimeClassifier;
use crate::risk::{Applied, RiskManager};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoAction,
    /// Stable reason code (risk rejection or `execution_failed`).
    Rejected(String),
    Executed(ExecutionRequest),
}

pub struct DecisionLoop {
    symbols: Vec<String>,
    regime_cfg: RegimeCfg,
    classifiers: HashMap<String, RegimeClassifier>,
    views: MarketViews,
    collector: Collector,
    fusion: FusionEngine,
    fallback: FallbackCoordinator,
    tracker: Arc<RateBudgetTracker>,
    risk: Arc<RiskManager>,
    sink: ExecutionSink,
    positions_rx: mpsc::Receiver<PositionUpdate>,
    events: Option<mpsc::Sender<Event>>,
}

/// Everything the loop owns or shares, wired up by `main` (or a test).
pub struct LoopParts {
    pub symbols: Vec<String>,
    pub views: MarketViews,
    pub collector: Collector,
    pub tracker: Arc<RateBudgetTracker>,
    pub risk: Arc<RiskManager>,
    pub sink: ExecutionSink,
    pub positions_rx: mpsc::Receiver<PositionUpdate>,
    pub fusion: FusionCfg,
    pub fallback: FallbackCfg,
    pub regime: RegimeCfg,
}

impl DecisionLoop {
    pub fn new(parts: LoopParts) -> Self {
        let profiles = parts.collector.profiles();
        let prio: Vec<(String, u8)> = profiles.iter().map(|p| (p.agent_id.clone(), p.priority)).collect();
        // tiap agent dipanggil sekali per symbol per tick
        let calls_per_agent = parts.symbols.len().max(1) as u32;
        let classifiers =
            parts.symbols.iter().map(|s| (s.clone(), RegimeClassifier::new(parts.regime.clone()))).collect();
        Self {
            fallback: FallbackCoordinator::new(parts.fallback, &prio, calls_per_agent),
            fusion: FusionEngine::new(parts.fusion, profiles),
            classifiers,
            regime_cfg: parts.regime,
            symbols: parts.symbols,
            views: parts.views,
            collector: parts.collector,
            tracker: parts.tracker,
            risk: parts.risk,
            sink: parts.sink,
            positions_rx: parts.positions_rx,
            events: None,
        }
    }

    /// Audit events (decisions, rejections, executions, regime changes) go to the recorder.
    pub fn with_events(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn fusion(&self) -> &FusionEngine { &self.fusion }

    pub fn collector_mut(&mut self) -> &mut Collector { &mut self.collector }

    fn emit(&self, ev: Event) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(ev) {
                debug!(?e, "event dropped");
            }
        }
    }

    /// One decision tick over every configured symbol, in configuration order.
    pub async fn tick(&mut self) -> Vec<(String, TickOutcome)> {
        DECISION_TICKS.inc();
        let mut budget = self.tracker.snapshot(Vec::new());
        let plan = self.fallback.plan(&mut budget, Instant::now());
        self.collector.set_plan(plan);

        let symbols = self.symbols.clone();
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let outcome = self.decide(&symbol).await;
            out.push((symbol, outcome));
        }
        out
    }

    async fn decide(&mut self, symbol: &str) -> TickOutcome {
        let regime = self.update_regime(symbol);

        let candidates = self.collector.collect(symbol, regime).await;
        let fused = self.fusion.evaluate(&candidates, regime);
        self.fold_position_updates();
        let Some(decision) = fused.decision else {
            debug!(%symbol, candidates = candidates.len(), rejected = fused.rejected.len(), "no action");
            return TickOutcome::NoAction;
        };
        self.emit(Event::Decision(decision.clone()));

        let agent_id = decision.winning_agent_id.clone();
        let auth = match self.risk.authorize(&decision, &agent_id) {
            Ok(a) => a,
            Err(rej) => {
                let reason = rej.reason().to_string();
                self.emit(Event::RiskRejected { symbol: symbol.to_string(), agent_id, reason: reason.clone() });
                return TickOutcome::Rejected(reason);
            }
        };

        let req = ExecutionRequest {
            reservation_id: auth.reservation_id,
            agent_id: auth.agent_id,
            symbol: auth.symbol,
            direction: auth.direction,
            notional: auth.adjusted_notional,
            leverage: auth.leverage,
            decided_at: decision.decided_at,
        };
        match self.sink.submit(&req).await {
            Ok(()) => {
                if let Err(e) = self.risk.confirm(req.reservation_id) {
                    error!(reservation = req.reservation_id, error = %e, "confirm after execution failed");
                }
                self.emit(Event::Exec(req.clone()));
                TickOutcome::Executed(req)
            }
            Err(e) => {
                if let Err(re) = self.risk.release(req.reservation_id) {
                    error!(reservation = req.reservation_id, error = %re, "release failed");
                }
                warn!(%symbol, agent = %req.agent_id, error = %e, "execution failed, reservation released");
                self.emit(Event::RiskRejected {
                    symbol: symbol.to_string(),
                    agent_id: req.agent_id,
                    reason: "execution_failed".into(),
                });
                TickOutcome::Rejected("execution_failed".into())
            }
        }
    }

    fn update_regime(&mut self, symbol: &str) -> RegimeLabel {
        let ind = self
            .views
            .history(symbol)
            .map(|h| h.indicators(self.regime_cfg.fast_window, self.regime_cfg.slow_window))
            .unwrap_or_default();
        let Some(clf) = self.classifiers.get_mut(symbol) else {
            return RegimeLabel::default();
        };
        let before = clf.current();
        let label = clf.on_tick(&ind);
        for r in Regime::all() {
            REGIME.with_label_values(&[symbol, r.as_str()]).set((r == label.regime) as i64);
        }
        if label.regime != before.regime {
            self.emit(Event::Regime { symbol: symbol.to_string(), label });
        }
        label
    }

    fn fold_position_updates(&mut self) {
        while let Ok(update) = self.positions_rx.try_recv() {
            match self.risk.apply_position_update(update) {
                Ok(Applied::Closed { agent_id, realized_pnl }) => {
                    self.fusion.record_outcome(&agent_id, realized_pnl > 0.0);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "position update ignored"),
            }
        }
    }

    pub async fn run(mut self, tick_every: Duration, max_ticks: Option<u64>) {
        let mut iv = interval(tick_every);
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(symbols = ?self.symbols, tick_ms = tick_every.as_millis() as u64, ?max_ticks, "decision loop started");
        let mut n: u64 = 0;
        loop {
            iv.tick().await;
            let outcomes = self.tick().await;
            n += 1;
            for (symbol, o) in &outcomes {
                match o {
                    TickOutcome::Executed(r) => {
                        info!(%symbol, agent = %r.agent_id, direction = r.direction.as_str(), notional = r.notional, "executed")
                    }
                    TickOutcome::Rejected(reason) => info!(%symbol, %reason, "rejected"),
                    TickOutcome::NoAction => {}
                }
            }
            if max_ticks.is_some_and(|m| n >= m) {
                info!(ticks = n, "max ticks reached, decision loop stopped");
                break;
            }
        }
    }
}
