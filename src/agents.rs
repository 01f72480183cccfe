// ===============================
// src/agents.rs
// ===============================
//
// Strategy agents di balik satu trait. Collector tidak tahu jenis agent;
// semua lewat `Agent::query` dan dibangun dari `AgentRegistry`.
//
// 1) OrderFlow      : baca snapshot VPIN terakhir (pull via watch), arah dari signed imbalance
// 2) Trend          : MA crossover (SMA fast vs slow)
// 3) MeanReversion  : harga vs SMA-N +/- edge
// 4) Breakout       : harga menembus high/low rolling window + buffer
// 5) Remote         : HTTP GET {base}/thesis?symbol=..&regime=..
//
// Agent lokal punya fallback: thesis yang sama dari data lokal terakhir,
// confidence diredam. Agent remote tidak punya fallback (hanya cache).
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{AgentKind, AgentSpec};
use crate::domain::{CandidateSource, Direction, Forecast, Regime, RegimeLabel, ThesisCandidate};
use crate::market::PriceHistory;
use crate::rate_budget::{RateBudgetTracker, USED_WEIGHT_HEADER};
use crate::vpin::VpinSnapshot;

/// Confidence multiplier for locally computed fallback theses.
pub const FALLBACK_DAMPING: f64 = 0.5;

// per-tick return stdev yang dianggap risk penuh
const RISK_VOL_REF: f64 = 0.01;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("upstream status {0}")]
    Status(u16),
    #[error("rate limited (status {0})")]
    RateLimited(u16),
    #[error("decode: {0}")]
    Decode(String),
    #[error("not enough data: {0}")]
    NoData(String),
    #[error("invalid thesis: {0}")]
    Invalid(String),
    #[error("no factory for agent kind {0:?}")]
    UnknownKind(String),
}

impl AgentError {
    /// Timeout, transport, dan 5xx boleh di-retry; sisanya langsung gagal.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::Transport(_) => true,
            AgentError::Status(s) => (500..600).contains(s),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout(_) => "timeout",
            AgentError::Transport(_) => "transport",
            AgentError::Status(_) => "status",
            AgentError::RateLimited(_) => "rate_limited",
            AgentError::Decode(_) => "decode",
            AgentError::NoData(_) => "no_data",
            AgentError::Invalid(_) => "invalid",
            AgentError::UnknownKind(_) => "unknown_kind",
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Regimes this agent is built for; empty = generalist.
    fn specialization(&self) -> &[Regime];

    /// Higher = needs the freshest data (throttled first under budget pressure).
    fn priority(&self) -> u8;

    async fn query(&self, symbol: &str, regime: RegimeLabel) -> Result<ThesisCandidate, AgentError>;

    fn fallback(&self, _symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
        None
    }
}

// ===== Shared market views =====

/// Read side of the per-symbol watch channels published by the market view and VPIN tasks.
#[derive(Clone, Default)]
pub struct MarketViews {
    history: HashMap<String, watch::Receiver<PriceHistory>>,
    vpin: HashMap<String, watch::Receiver<VpinSnapshot>>,
}

impl MarketViews {
    pub fn new() -> Self { Self::default() }

    pub fn add_history(&mut self, symbol: &str, rx: watch::Receiver<PriceHistory>) {
        self.history.insert(symbol.to_string(), rx);
    }

    pub fn add_vpin(&mut self, symbol: &str, rx: watch::Receiver<VpinSnapshot>) {
        self.vpin.insert(symbol.to_string(), rx);
    }

    pub fn history(&self, symbol: &str) -> Option<PriceHistory> {
        self.history.get(symbol).map(|rx| rx.borrow().clone())
    }

    pub fn vpin(&self, symbol: &str) -> Option<VpinSnapshot> {
        self.vpin.get(symbol).map(|rx| rx.borrow().clone())
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.history.get(symbol).and_then(|rx| rx.borrow().last())
    }
}

fn thesis(
    agent_id: &str,
    symbol: &str,
    direction: Direction,
    confidence: f64,
    risk_score: f64,
    notional_hint: f64,
    forecast: Option<Forecast>,
) -> ThesisCandidate {
    ThesisCandidate {
        agent_id: agent_id.to_string(),
        symbol: symbol.to_string(),
        direction,
        confidence,
        risk_score,
        notional_hint,
        produced_at: Utc::now(),
        source: CandidateSource::Live,
        forecast,
    }
}

fn damped(mut c: ThesisCandidate) -> ThesisCandidate {
    c.confidence *= FALLBACK_DAMPING;
    c.source = CandidateSource::Fallback;
    c
}

fn vol_risk(h: &PriceHistory, n: usize) -> f64 {
    h.return_stdev(n).map(|s| (s / RISK_VOL_REF).clamp(0.0, 1.0)).unwrap_or(0.5)
}

// forecast dengan interval +/- 2 sigma
fn band(price: f64, target: f64, h: &PriceHistory, n: usize) -> Forecast {
    let sigma = h.return_stdev(n).unwrap_or(0.0) * price;
    Forecast { price: target, lower: target - 2.0 * sigma, upper: target + 2.0 * sigma }
}

// -----------------------------------------------------------------------------
// 1) ORDER FLOW (VPIN)
//    Probability di atas trigger -> ikut sisi yang dominan.
//    Flow yang sangat toxic juga menaikkan risk_score.
// -----------------------------------------------------------------------------
pub struct OrderFlowAgent {
    id: String,
    priority: u8,
    specialization: Vec<Regime>,
    views: MarketViews,
    trigger: f64,
    notional: f64,
}

impl OrderFlowAgent {
    pub fn new(spec: &AgentSpec, ctx: &AgentContext) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            specialization: spec.specialization.clone(),
            views: ctx.views.clone(),
            trigger: 0.3,
            notional: ctx.default_notional,
        }
    }

    fn compute(&self, symbol: &str) -> Result<ThesisCandidate, AgentError> {
        let snap = self
            .views
            .vpin(symbol)
            .filter(|s| s.bucket_count > 0)
            .ok_or_else(|| AgentError::NoData(format!("no vpin for {symbol}")))?;
        let p = snap.probability.clamp(0.0, 1.0);
        let direction = if p < self.trigger || snap.signed_imbalance == 0.0 {
            Direction::Flat
        } else if snap.signed_imbalance > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        let risk = (0.2 + 0.4 * p).clamp(0.0, 1.0);
        Ok(thesis(&self.id, symbol, direction, p, risk, self.notional * p.max(0.1), None))
    }
}

#[async_trait]
impl Agent for OrderFlowAgent {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &self.specialization }
    fn priority(&self) -> u8 { self.priority }

    async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        self.compute(symbol)
    }

    fn fallback(&self, symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
        self.compute(symbol).ok().map(damped)
    }
}

// -----------------------------------------------------------------------------
// 2) TREND (MA crossover)
//    fast > slow + min_edge -> Long, fast < slow - min_edge -> Short.
//    Selisih kecil dianggap noise -> Flat.
// -----------------------------------------------------------------------------
pub struct TrendAgent {
    id: String,
    priority: u8,
    specialization: Vec<Regime>,
    views: MarketViews,
    fast: usize,
    slow: usize,
    min_edge: f64,
    notional: f64,
}

impl TrendAgent {
    pub fn new(spec: &AgentSpec, ctx: &AgentContext) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            specialization: spec.specialization.clone(),
            views: ctx.views.clone(),
            fast: ctx.fast_window,
            slow: ctx.slow_window,
            min_edge: 0.001,
            notional: ctx.default_notional,
        }
    }

    fn compute(&self, symbol: &str) -> Result<ThesisCandidate, AgentError> {
        let h = self.views.history(symbol).ok_or_else(|| AgentError::NoData(symbol.to_string()))?;
        let (price, diff) = match (h.last(), h.trend_strength(self.fast, self.slow)) {
            (Some(p), Some(d)) => (p, d),
            _ => return Err(AgentError::NoData(format!("{symbol}: {} prices", h.len()))),
        };
        let direction = if diff > self.min_edge {
            Direction::Long
        } else if diff < -self.min_edge {
            Direction::Short
        } else {
            Direction::Flat
        };
        let confidence = (diff.abs() / (self.min_edge * 10.0)).clamp(0.0, 1.0);
        let risk = vol_risk(&h, self.slow);
        let forecast = band(price, price * (1.0 + diff), &h, self.slow);
        Ok(thesis(&self.id, symbol, direction, confidence, risk, self.notional, Some(forecast)))
    }
}

#[async_trait]
impl Agent for TrendAgent {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &self.specialization }
    fn priority(&self) -> u8 { self.priority }

    async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        self.compute(symbol)
    }

    fn fallback(&self, symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
        self.compute(symbol).ok().map(damped)
    }
}

// -----------------------------------------------------------------------------
// 3) MEAN REVERSION
//    harga < SMA(w) - edge -> Long; harga > SMA(w) + edge -> Short.
//    Forecast = kembali ke SMA.
// -----------------------------------------------------------------------------
pub struct MeanReversionAgent {
    id: String,
    priority: u8,
    specialization: Vec<Regime>,
    views: MarketViews,
    window: usize,
    edge: f64,
    notional: f64,
}

impl MeanReversionAgent {
    pub fn new(spec: &AgentSpec, ctx: &AgentContext) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            specialization: spec.specialization.clone(),
            views: ctx.views.clone(),
            window: ctx.slow_window,
            edge: 0.002,
            notional: ctx.default_notional,
        }
    }

    fn compute(&self, symbol: &str) -> Result<ThesisCandidate, AgentError> {
        let h = self.views.history(symbol).ok_or_else(|| AgentError::NoData(symbol.to_string()))?;
        let (price, fair) = match (h.last(), h.sma(self.window)) {
            (Some(p), Some(f)) if f > 0.0 => (p, f),
            _ => return Err(AgentError::NoData(format!("{symbol}: {} prices", h.len()))),
        };
        let dev = (price - fair) / fair;
        let direction = if dev < -self.edge {
            Direction::Long
        } else if dev > self.edge {
            Direction::Short
        } else {
            Direction::Flat
        };
        let confidence = (dev.abs() / (self.edge * 4.0)).clamp(0.0, 1.0);
        let risk = vol_risk(&h, self.window);
        Ok(thesis(&self.id, symbol, direction, confidence, risk, self.notional, Some(band(price, fair, &h, self.window))))
    }
}

#[async_trait]
impl Agent for MeanReversionAgent {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &self.specialization }
    fn priority(&self) -> u8 { self.priority }

    async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        self.compute(symbol)
    }

    fn fallback(&self, symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
        self.compute(symbol).ok().map(damped)
    }
}

// -----------------------------------------------------------------------------
// 4) VOLATILITY BREAKOUT
//    harga > prior high * (1 + edge) -> Long; < prior low * (1 - edge) -> Short.
// -----------------------------------------------------------------------------
pub struct BreakoutAgent {
    id: String,
    priority: u8,
    specialization: Vec<Regime>,
    views: MarketViews,
    window: usize,
    edge: f64,
    notional: f64,
}

impl BreakoutAgent {
    pub fn new(spec: &AgentSpec, ctx: &AgentContext) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            specialization: spec.specialization.clone(),
            views: ctx.views.clone(),
            window: ctx.slow_window,
            edge: 0.0005,
            notional: ctx.default_notional,
        }
    }

    fn compute(&self, symbol: &str) -> Result<ThesisCandidate, AgentError> {
        let h = self.views.history(symbol).ok_or_else(|| AgentError::NoData(symbol.to_string()))?;
        let (price, (hi, lo)) = match (h.last(), h.prior_hi_lo(self.window)) {
            (Some(p), Some(hl)) => (p, hl),
            _ => return Err(AgentError::NoData(format!("{symbol}: {} prices", h.len()))),
        };
        let range = (hi - lo).max(price * 1e-6);
        let (direction, excess) = if price > hi * (1.0 + self.edge) {
            (Direction::Long, price - hi)
        } else if price < lo * (1.0 - self.edge) {
            (Direction::Short, lo - price)
        } else {
            (Direction::Flat, 0.0)
        };
        let confidence = (excess / range).clamp(0.0, 1.0);
        // breakout palsu sering terjadi; risk dasar lebih tinggi
        let risk = (0.15 + vol_risk(&h, self.window)).min(1.0);
        let target = price + direction.sign() * range * 0.5;
        Ok(thesis(&self.id, symbol, direction, confidence, risk, self.notional, Some(band(price, target, &h, self.window))))
    }
}

#[async_trait]
impl Agent for BreakoutAgent {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &self.specialization }
    fn priority(&self) -> u8 { self.priority }

    async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        self.compute(symbol)
    }

    fn fallback(&self, symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
        self.compute(symbol).ok().map(damped)
    }
}

// -----------------------------------------------------------------------------
// 5) REMOTE (HTTP)
//    Status dan header used-weight diteruskan ke rate budget tracker.
// -----------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
struct RemoteThesis {
    direction: Direction,
    confidence: f64,
    risk_score: f64,
    #[serde(default)]
    notional_hint: f64,
    #[serde(default)]
    forecast: Option<Forecast>,
}

pub struct RemoteAgent {
    id: String,
    priority: u8,
    specialization: Vec<Regime>,
    base_url: String,
    http: reqwest::Client,
    tracker: Arc<RateBudgetTracker>,
}

impl RemoteAgent {
    pub fn new(spec: &AgentSpec, base_url: &str, ctx: &AgentContext) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            specialization: spec.specialization.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: ctx.http.clone(),
            tracker: ctx.tracker.clone(),
        }
    }

    fn url(&self, symbol: &str, regime: Regime) -> String {
        format!(
            "{}/thesis?symbol={}&regime={}",
            self.base_url,
            urlencoding::encode(symbol),
            urlencoding::encode(regime.as_str())
        )
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn id(&self) -> &str { &self.id }
    fn specialization(&self) -> &[Regime] { &self.specialization }
    fn priority(&self) -> u8 { self.priority }

    async fn query(&self, symbol: &str, regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
        let url = self.url(symbol, regime.regime);
        let rsp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() { AgentError::Timeout(Duration::ZERO) } else { AgentError::Transport(e.to_string()) }
        })?;

        let status = rsp.status().as_u16();
        let used = rsp
            .headers()
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok());
        self.tracker.observe_status(status, used);

        if status == 429 || status == 418 {
            warn!(agent = %self.id, %symbol, status, "remote agent rate limited");
            return Err(AgentError::RateLimited(status));
        }
        if !rsp.status().is_success() {
            return Err(AgentError::Status(status));
        }

        let body: RemoteThesis = rsp.json().await.map_err(|e| AgentError::Decode(e.to_string()))?;
        debug!(agent = %self.id, %symbol, ?body, "remote thesis");
        Ok(thesis(
            &self.id,
            symbol,
            body.direction,
            body.confidence,
            body.risk_score,
            body.notional_hint,
            body.forecast,
        ))
    }
}

// ===== Registry =====

/// Everything a factory may need to build an agent.
#[derive(Clone)]
pub struct AgentContext {
    pub views: MarketViews,
    pub tracker: Arc<RateBudgetTracker>,
    pub http: reqwest::Client,
    pub default_notional: f64,
    pub fast_window: usize,
    pub slow_window: usize,
}

pub type AgentFactory = fn(&AgentSpec, &AgentContext) -> Result<Arc<dyn Agent>, AgentError>;

pub struct AgentRegistry {
    factories: HashMap<&'static str, AgentFactory>,
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_builtin() -> Self {
        let mut r = Self::empty();
        r.register("order_flow", |s, c| Ok(Arc::new(OrderFlowAgent::new(s, c))));
        r.register("trend", |s, c| Ok(Arc::new(TrendAgent::new(s, c))));
        r.register("mean_reversion", |s, c| Ok(Arc::new(MeanReversionAgent::new(s, c))));
        r.register("breakout", |s, c| Ok(Arc::new(BreakoutAgent::new(s, c))));
        r.register("remote", |s, c| match &s.kind {
            AgentKind::Remote { base_url } => Ok(Arc::new(RemoteAgent::new(s, base_url, c))),
            other => Err(AgentError::UnknownKind(other.as_str().to_string())),
        });
        r
    }

    pub fn register(&mut self, kind: &'static str, factory: AgentFactory) {
        self.factories.insert(kind, factory);
    }

    /// Build agents in registration (config) order.
    pub fn build(&self, specs: &[AgentSpec], ctx: &AgentContext) -> Result<Vec<Arc<dyn Agent>>, AgentError> {
        specs
            .iter()
            .map(|spec| {
                let kind = spec.kind.as_str();
                let factory = self.factories.get(kind).ok_or_else(|| AgentError::UnknownKind(kind.to_string()))?;
                factory(spec, ctx)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server};

    fn ctx_with(views: MarketViews) -> AgentContext {
        AgentContext {
            views,
            tracker: Arc::new(RateBudgetTracker::new(1200, Duration::from_secs(60))),
            http: reqwest::Client::new(),
            default_notional: 1_000.0,
            fast_window: 5,
            slow_window: 20,
        }
    }

    fn history(prices: impl IntoIterator<Item = f64>) -> PriceHistory {
        let mut h = PriceHistory::new("BTCUSDT", 128);
        for (i, p) in prices.into_iter().enumerate() {
            h.push(p, i as i64);
        }
        h
    }

    fn views_with_history(h: PriceHistory) -> (MarketViews, watch::Sender<PriceHistory>) {
        let (tx, rx) = watch::channel(h);
        let mut v = MarketViews::new();
        v.add_history("BTCUSDT", rx);
        (v, tx)
    }

    fn spec(token: &str) -> AgentSpec {
        AgentSpec::parse(token).unwrap()
    }

    #[tokio::test]
    async fn trend_agent_goes_long_in_uptrend() {
        let (views, _tx) = views_with_history(history((0..40).map(|i| 100.0 * 1.002f64.powi(i))));
        let agent = TrendAgent::new(&spec("trend"), &ctx_with(views));
        let c = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap();
        assert_eq!(c.direction, Direction::Long);
        assert_eq!(c.source, CandidateSource::Live);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
        assert!(c.forecast.is_some());
    }

    #[tokio::test]
    async fn mean_reversion_buys_the_dip() {
        let mut prices = vec![100.0; 25];
        prices.push(97.0);
        let (views, _tx) = views_with_history(history(prices));
        let agent = MeanReversionAgent::new(&spec("mean_reversion"), &ctx_with(views));
        let c = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap();
        assert_eq!(c.direction, Direction::Long);
    }

    #[tokio::test]
    async fn breakout_detects_range_break() {
        let mut prices: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        prices.push(95.0);
        let (views, _tx) = views_with_history(history(prices));
        let agent = BreakoutAgent::new(&spec("breakout"), &ctx_with(views));
        let c = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap();
        assert_eq!(c.direction, Direction::Short);
    }

    #[tokio::test]
    async fn short_history_is_no_data() {
        let (views, _tx) = views_with_history(history([100.0, 101.0]));
        let agent = TrendAgent::new(&spec("trend"), &ctx_with(views));
        let err = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::NoData(_)));
        assert!(!err.is_transient());
        assert!(agent.fallback("BTCUSDT", RegimeLabel::default()).is_none());
    }

    #[tokio::test]
    async fn order_flow_follows_dominant_side_and_falls_back_damped() {
        let snap = VpinSnapshot {
            symbol: "BTCUSDT".into(),
            probability: 0.8,
            signed_imbalance: -0.4,
            buy_volume: 30.0,
            sell_volume: 70.0,
            bucket_count: 50,
            ts_ms: 1,
        };
        let (_tx, rx) = watch::channel(snap);
        let mut views = MarketViews::new();
        views.add_vpin("BTCUSDT", rx);
        let agent = OrderFlowAgent::new(&spec("order_flow"), &ctx_with(views));
        let live = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap();
        assert_eq!(live.direction, Direction::Short);
        assert!((live.confidence - 0.8).abs() < 1e-12);

        let fb = agent.fallback("BTCUSDT", RegimeLabel::default()).unwrap();
        assert_eq!(fb.source, CandidateSource::Fallback);
        assert!((fb.confidence - 0.4).abs() < 1e-12);
    }

    #[test]
    fn transient_classification() {
        assert!(AgentError::Timeout(Duration::from_secs(2)).is_transient());
        assert!(AgentError::Transport("reset".into()).is_transient());
        assert!(AgentError::Status(503).is_transient());
        assert!(!AgentError::Status(404).is_transient());
        assert!(!AgentError::Decode("eof".into()).is_transient());
        assert!(!AgentError::RateLimited(429).is_transient());
    }

    #[test]
    fn registry_builds_in_config_order() {
        let specs = crate::config::parse_agents("breakout,order_flow,remote:alpha@http://127.0.0.1:1").unwrap();
        let agents = AgentRegistry::with_builtin().build(&specs, &ctx_with(MarketViews::new())).unwrap();
        let ids: Vec<&str> = agents.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec!["breakout", "order_flow", "alpha"]);
        assert!(agents[2].specialization().is_empty());
    }

    #[test]
    fn registry_without_factory_fails() {
        let specs = crate::config::parse_agents("trend").unwrap();
        let r = AgentRegistry::empty().build(&specs, &ctx_with(MarketViews::new()));
        assert!(matches!(r, Err(AgentError::UnknownKind(_))));
    }

    async fn serve(status: u16, body: &'static str, used_weight: &'static str) -> SocketAddr {
        let make_svc = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                assert_eq!(req.uri().path(), "/thesis");
                let rsp = Response::builder()
                    .status(status)
                    .header(USED_WEIGHT_HEADER, used_weight)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap();
                Ok::<_, Infallible>(rsp)
            }))
        });
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn remote_agent_decodes_thesis_and_reports_weight() {
        let addr = serve(200, r#"{"direction":"long","confidence":0.6,"risk_score":0.2,"notional_hint":500.0}"#, "1100").await;
        let ctx = ctx_with(MarketViews::new());
        let tracker = ctx.tracker.clone();
        let agent = RemoteAgent::new(&spec("remote:alpha@x"), &format!("http://{addr}"), &ctx);
        let c = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap();
        assert_eq!(c.agent_id, "alpha");
        assert_eq!(c.direction, Direction::Long);
        assert_eq!(c.notional_hint, 500.0);
        assert_eq!(tracker.remaining(), 100);
    }

    #[tokio::test]
    async fn remote_agent_429_exhausts_budget() {
        let addr = serve(429, "{}", "0").await;
        let ctx = ctx_with(MarketViews::new());
        let tracker = ctx.tracker.clone();
        let agent = RemoteAgent::new(&spec("remote:alpha@x"), &format!("http://{addr}"), &ctx);
        let err = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::RateLimited(429)));
        assert_eq!(tracker.remaining(), 0);
    }

    #[tokio::test]
    async fn remote_agent_5xx_is_transient_and_bad_body_is_not() {
        let addr = serve(503, "busy", "10").await;
        let ctx = ctx_with(MarketViews::new());
        let agent = RemoteAgent::new(&spec("remote:a@x"), &format!("http://{addr}"), &ctx);
        assert!(agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap_err().is_transient());

        let addr = serve(200, "not json", "10").await;
        let agent = RemoteAgent::new(&spec("remote:b@x"), &format!("http://{addr}"), &ctx);
        let err = agent.query("BTCUSDT", RegimeLabel::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Decode(_)));
    }
}
