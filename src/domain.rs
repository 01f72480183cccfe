// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction { Long, Short, Flat }
impl Direction {
    pub fn sign(&self) -> f64 { match self { Direction::Long => 1.0, Direction::Short => -1.0, Direction::Flat => 0.0 } }
    pub fn as_str(&self) -> &'static str {
        match self { Direction::Long => "long", Direction::Short => "short", Direction::Flat => "flat" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource { Live, Cached, Fallback }
impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self { CandidateSource::Live => "live", CandidateSource::Cached => "cached", CandidateSource::Fallback => "fallback" }
    }
}

/// Price forecast with its confidence interval; checked by the hallucination guard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast { pub price: f64, pub lower: f64, pub upper: f64 }

/// Thesis dari satu agent. Tidak diubah setelah dibuat; re-tag lewat `with_source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThesisCandidate {
    pub agent_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub confidence: f64,
    pub risk_score: f64,
    pub notional_hint: f64,
    pub produced_at: DateTime<Utc>,
    pub source: CandidateSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
}

impl ThesisCandidate {
    pub fn with_source(&self, source: CandidateSource) -> Self {
        Self { source, ..self.clone() }
    }
}

// ===== Regime =====
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime { BullTrending, BullVolatile, BearTrending, BearVolatile, RangeBound }

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::BullTrending => "bull_trending",
            Regime::BullVolatile => "bull_volatile",
            Regime::BearTrending => "bear_trending",
            Regime::BearVolatile => "bear_volatile",
            Regime::RangeBound   => "range_bound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bull_trending" => Some(Regime::BullTrending),
            "bull_volatile" => Some(Regime::BullVolatile),
            "bear_trending" => Some(Regime::BearTrending),
            "bear_volatile" => Some(Regime::BearVolatile),
            "range_bound" | "range" => Some(Regime::RangeBound),
            _ => None,
        }
    }

    pub fn all() -> [Regime; 5] {
        [Regime::BullTrending, Regime::BullVolatile, Regime::BearTrending, Regime::BearVolatile, Regime::RangeBound]
    }

    pub fn is_trending(&self) -> bool { matches!(self, Regime::BullTrending | Regime::BearTrending) }
    pub fn is_volatile(&self) -> bool { matches!(self, Regime::BullVolatile | Regime::BearVolatile) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabel { pub regime: Regime, pub confidence: f64 }

impl Default for RegimeLabel {
    fn default() -> Self { Self { regime: Regime::RangeBound, confidence: 0.0 } }
}

// ===== Consensus =====
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason { RiskThresholdExceeded, BelowConfidenceFloor, FlatDirection, Outscored }
impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RiskThresholdExceeded => "risk_threshold_exceeded",
            RejectReason::BelowConfidenceFloor  => "below_confidence_floor",
            RejectReason::FlatDirection         => "flat_direction",
            RejectReason::Outscored             => "outscored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedCandidate { pub agent_id: String, pub reason: RejectReason }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub symbol: String,
    pub direction: Direction,
    pub notional: f64,
    pub confidence: f64,
    pub score: f64,
    pub winning_agent_id: String,
    pub rejected_candidates: Vec<RejectedCandidate>,
    pub decided_at: DateTime<Utc>,
}

// ===== Market data =====
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick { pub ts_ms: i64, pub symbol: String, pub price: f64, pub volume: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick { pub price: f64, pub volume: f64, pub ts_ms: i64 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickBatch { pub symbol: String, pub ticks: Vec<Tick> }

// ===== Portfolio =====
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub agent_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub notional: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
}
impl Position { pub fn exposure(&self) -> f64 { self.notional * self.leverage } }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioState {
    pub total_capital: f64,
    pub total_exposure: f64,
    pub open_positions: Vec<Position>,
    pub unrealized_pnl: f64,
    pub peak_balance: f64,
    pub current_drawdown: f64,
}

impl PortfolioState {
    pub fn equity(&self) -> f64 { self.total_capital + self.unrealized_pnl }

    pub fn leverage(&self) -> f64 {
        if self.total_capital > 0.0 { self.total_exposure / self.total_capital } else { 0.0 }
    }

    /// (peak - equity) / peak, tidak pernah negatif. Peak = high-water mark equity.
    pub fn recompute_drawdown(&mut self) {
        self.peak_balance = self.peak_balance.max(self.equity());
        self.current_drawdown = if self.peak_balance > 0.0 {
            ((self.peak_balance - self.equity()) / self.peak_balance).max(0.0)
        } else {
            0.0
        };
    }
}

/// Event posisi dari luar (mis. companion low-latency trader).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionUpdate {
    Opened { agent_id: String, symbol: String, direction: Direction, notional: f64, leverage: f64 },
    Closed { position_id: u64, realized_pnl: f64 },
    Mark { unrealized_pnl: f64 },
}

/// Callback Risk Manager -> Collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRiskEvent { pub agent_id: String, pub daily_loss: f64, pub breached: bool }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub reservation_id: u64,
    pub agent_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub notional: f64,
    pub leverage: f64,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Decision(ConsensusDecision),
    RiskRejected { symbol: String, agent_id: String, reason: String },
    Exec(ExecutionRequest),
    Regime { symbol: String, label: RegimeLabel },
    Note { msg: String },
}
