// ===============================
// tests/decision_loop.rs
// ===============================
//
// End-to-end: scripted agents -> collector -> fusion -> risk -> log sink.
//
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Duration;

use thesis_fusion_bot::agents::{Agent, AgentError, MarketViews};
use thesis_fusion_bot::collector::Collector;
use thesis_fusion_bot::config::{CollectorCfg, FallbackCfg, FusionCfg, RegimeCfg, RiskLimits};
use thesis_fusion_bot::decision::{DecisionLoop, LoopParts, TickOutcome};
use thesis_fusion_bot::domain::{
    CandidateSource, Direction, Event, PositionUpdate, Regime, RegimeLabel, ThesisCandidate,
};
use thesis_fusion_bot::execution::ExecutionSink;
use thesis_fusion_bot::rate_budget::RateBudgetTracker;
use thesis_fusion_bot::risk::{AgentLimit, RiskManager};

struct Scripted {
    id: String,
    direction: Direction,
    confidence: f64,
    risk: f64,
    calls: Arc<AtomicU32>,
}

impl Scripted {
    fn new(id: &str, direction: Direction, confidence: f64, risk: f64) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let a = Self { id: id.into(), direction, confidence, risk, calls: calls.clone() };
        (Arc::new(a), calls)
    }
}

#[async_trait]
impl Agent for Scripted {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &[] }
    fn priority(&self) -> u8 { 50 }

    async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ThesisCandidate {
            agent_id: self.id.clone(),
            symbol: symbol.to_string(),
            direction: self.direction,
            confidence: self.confidence,
            risk_score: self.risk,
            notional_hint: 1_000.0,
            produced_at: Utc::now(),
            source: CandidateSource::Live,
            forecast: None,
        })
    }
}

struct Harness {
    dl: DecisionLoop,
    risk: Arc<RiskManager>,
    tracker: Arc<RateBudgetTracker>,
    pos_tx: mpsc::Sender<PositionUpdate>,
    events: mpsc::Receiver<Event>,
}

fn harness(agents: Vec<Arc<Scripted>>) -> Harness {
    let limits: Vec<AgentLimit> = agents
        .iter()
        .map(|a| AgentLimit { agent_id: a.id.clone(), allocation_fraction: 0.45, max_leverage: 1.0 })
        .collect();
    let (agent_tx, agent_rx) = mpsc::channel(64);
    let (risk, _portfolio_rx) = RiskManager::new(RiskLimits::default(), &limits, agent_tx).unwrap();
    let risk = Arc::new(risk);

    let tracker = Arc::new(RateBudgetTracker::new(100, Duration::from_secs(60)));
    let mut collector = Collector::new(CollectorCfg::default(), tracker.clone(), agent_rx);
    for a in agents {
        collector.register(a, 45_000.0, 1.0);
    }

    let (pos_tx, pos_rx) = mpsc::channel(16);
    let (ev_tx, events) = mpsc::channel(64);
    let dl = DecisionLoop::new(LoopParts {
        symbols: vec!["BTCUSDT".into()],
        views: MarketViews::new(),
        collector,
        tracker: tracker.clone(),
        risk: risk.clone(),
        sink: ExecutionSink::Log,
        positions_rx: pos_rx,
        fusion: FusionCfg::default(),
        fallback: FallbackCfg::default(),
        regime: RegimeCfg::default(),
    })
    .with_events(ev_tx);
    Harness { dl, risk, tracker, pos_tx, events }
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn single(outcomes: Vec<(String, TickOutcome)>) -> TickOutcome {
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, "BTCUSDT");
    outcomes.into_iter().next().map(|(_, o)| o).unwrap()
}

#[tokio::test(start_paused = true)]
async fn risky_thesis_loses_and_safe_one_is_executed() {
    let (alpha, _) = Scripted::new("alpha", Direction::Long, 0.6, 0.2);
    let (beta, _) = Scripted::new("beta", Direction::Short, 0.95, 0.9);
    let mut h = harness(vec![alpha, beta]);

    let req = match single(h.dl.tick().await) {
        TickOutcome::Executed(r) => r,
        other => panic!("expected execution, got {other:?}"),
    };
    assert_eq!(req.agent_id, "alpha");
    assert_eq!(req.direction, Direction::Long);
    assert_eq!(req.notional, 1_000.0);
    assert_eq!(req.leverage, 1.0);

    let snap = h.risk.snapshot();
    assert_eq!(snap.open_positions.len(), 1);
    assert_eq!(snap.open_positions[0].id, req.reservation_id);
    assert!((snap.total_exposure - 1_000.0).abs() < 1e-9);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(e, Event::Decision(d) if d.winning_agent_id == "alpha")));
    assert!(events.iter().any(|e| matches!(e, Event::Exec(r) if r.reservation_id == req.reservation_id)));
}

#[tokio::test(start_paused = true)]
async fn nothing_acceptable_is_no_action() {
    let (flat, _) = Scripted::new("flat", Direction::Flat, 0.7, 0.1);
    let (risky, _) = Scripted::new("risky", Direction::Long, 0.9, 0.75);
    let mut h = harness(vec![flat, risky]);
    assert_eq!(single(h.dl.tick().await), TickOutcome::NoAction);
    assert!(h.risk.snapshot().open_positions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_positions_feed_win_rate_and_capital() {
    let (alpha, _) = Scripted::new("alpha", Direction::Long, 0.6, 0.2);
    let mut h = harness(vec![alpha]);
    let TickOutcome::Executed(req) = single(h.dl.tick().await) else { panic!("no execution") };
    assert_eq!(h.dl.fusion().win_rate("alpha"), 0.5);

    h.pos_tx.send(PositionUpdate::Closed { position_id: req.reservation_id, realized_pnl: -50.0 }).await.unwrap();
    h.dl.tick().await;

    assert_eq!(h.dl.fusion().win_rate("alpha"), 0.0);
    let snap = h.risk.snapshot();
    assert!((snap.total_capital - 99_950.0).abs() < 1e-9);
    assert!(snap.open_positions.iter().all(|p| p.id != req.reservation_id));
}

#[tokio::test(start_paused = true)]
async fn drawdown_breach_halts_trading() {
    let (alpha, _) = Scripted::new("alpha", Direction::Long, 0.6, 0.2);
    let mut h = harness(vec![alpha]);
    h.pos_tx.send(PositionUpdate::Mark { unrealized_pnl: -20_000.0 }).await.unwrap();

    assert_eq!(single(h.dl.tick().await), TickOutcome::Rejected("drawdown_exceeded".into()));
    assert!(h.risk.is_halted());
    // still halted on the next tick
    assert_eq!(single(h.dl.tick().await), TickOutcome::Rejected("drawdown_exceeded".into()));

    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RiskRejected { reason, agent_id, .. } if reason == "drawdown_exceeded" && agent_id == "alpha")));
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_serves_cache_without_calls() {
    let (alpha, calls) = Scripted::new("alpha", Direction::Long, 0.6, 0.2);
    let mut h = harness(vec![alpha]);
    assert!(matches!(single(h.dl.tick().await), TickOutcome::Executed(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // past the cache TTL, inside the rate window
    tokio::time::advance(Duration::from_secs(11)).await;
    h.tracker.exhaust();

    assert!(matches!(single(h.dl.tick().await), TickOutcome::Executed(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
