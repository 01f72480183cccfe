// ===============================
// src/risk.rs
// ===============================
//
// Risk Manager: satu-satunya pemilik PortfolioState.
// Semua mutasi lewat RiskBook di balik satu Mutex, jadi authorize dari
// beberapa tick yang overlap tetap serial dan tidak bisa overcommit capital.
//
// Urutan cek authorize:
//   1) halt ter-latch                         -> drawdown_exceeded
//   2) drawdown > max                         -> latch halt, drawdown_exceeded
//   3) agent tidak dikenal / kena daily loss  -> unknown_agent / agent_loss_limit
//   4) cap notional (partial sizing)          -> allocation_exhausted kalau sisa 0
//   5) leverage setelah exposure baru > max   -> leverage_exceeded
//   6) reserve exposure, return Authorization
//
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::RiskLimits;
use crate::domain::{AgentRiskEvent, ConsensusDecision, Direction, PortfolioState, Position, PositionUpdate};
use crate::metrics::{DRAWDOWN, EXPOSURE, HALTED, RISK_REJECTS};

/// Structured rejection; `reason()` is the stable code used in logs and metrics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("drawdown {drawdown:.4} exceeds max {max:.4}, trading halted")]
    DrawdownExceeded { drawdown: f64, max: f64 },
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    #[error("agent {agent} daily loss {loss:.2} over limit {limit:.2}")]
    AgentLossLimit { agent: String, loss: f64, limit: f64 },
    #[error("agent {0} has no allocation left")]
    AllocationExhausted(String),
    #[error("projected leverage {projected:.3} exceeds max {max:.3}")]
    LeverageExceeded { projected: f64, max: f64 },
    #[error("invalid decision: {0}")]
    InvalidDecision(String),
}

impl RiskRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            RiskRejection::DrawdownExceeded { .. } => "drawdown_exceeded",
            RiskRejection::UnknownAgent(_) => "unknown_agent",
            RiskRejection::AgentLossLimit { .. } => "agent_loss_limit",
            RiskRejection::AllocationExhausted(_) => "allocation_exhausted",
            RiskRejection::LeverageExceeded { .. } => "leverage_exceeded",
            RiskRejection::InvalidDecision(_) => "invalid_decision",
        }
    }
}

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("agent allocations {total:.3} exceed total capital (1.0)")]
    AllocationOverflow { total: f64 },
    #[error("invalid risk limit {0}")]
    InvalidLimit(&'static str),
    #[error("halt not cleared: drawdown {drawdown:.4} still above {max:.4}")]
    HaltStillActive { drawdown: f64, max: f64 },
    #[error("unknown reservation {0}")]
    UnknownReservation(u64),
    #[error("unknown position {0}")]
    UnknownPosition(u64),
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    #[error("invalid position update: {0}")]
    InvalidUpdate(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub approved: bool,
    pub reservation_id: u64,
    pub agent_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub adjusted_notional: f64,
    pub leverage: f64,
}

/// What folding one position update did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Opened(u64),
    Closed { agent_id: String, realized_pnl: f64 },
    Marked,
}

/// Per-agent sizing limits handed to the risk manager at start-up.
#[derive(Debug, Clone)]
pub struct AgentLimit {
    pub agent_id: String,
    pub allocation_fraction: f64,
    pub max_leverage: f64,
}

#[derive(Debug, Clone)]
struct AgentBook {
    // allocation = fraction * total_capital saat ini, ikut berubah bersama PnL
    fraction: f64,
    max_leverage: f64,
    // notional (bukan exposure) dari reservasi + posisi terbuka
    reserved: f64,
    daily_pnl: f64,
    breached: bool,
}

impl AgentBook {
    fn daily_loss(&self) -> f64 { (-self.daily_pnl).max(0.0) }

    fn allocation(&self, capital: f64) -> f64 { self.fraction * capital.max(0.0) }
}

fn finite(what: &str, v: f64) -> Result<(), RiskError> {
    if v.is_finite() { Ok(()) } else { Err(RiskError::InvalidUpdate(format!("{what} {v}"))) }
}

fn positive(what: &str, v: f64) -> Result<(), RiskError> {
    if v.is_finite() && v > 0.0 { Ok(()) } else { Err(RiskError::InvalidUpdate(format!("{what} {v}"))) }
}

fn validate(update: &PositionUpdate) -> Result<(), RiskError> {
    match update {
        PositionUpdate::Opened { notional, leverage, .. } => {
            positive("notional", *notional)?;
            positive("leverage", *leverage)
        }
        PositionUpdate::Closed { realized_pnl, .. } => finite("realized_pnl", *realized_pnl),
        PositionUpdate::Mark { unrealized_pnl } => finite("unrealized_pnl", *unrealized_pnl),
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    agent_id: String,
    symbol: String,
    direction: Direction,
    notional: f64,
    leverage: f64,
    created: DateTime<Utc>,
}

struct RiskBook {
    portfolio: PortfolioState,
    agents: HashMap<String, AgentBook>,
    reservations: HashMap<u64, Reservation>,
    halted: bool,
    next_id: u64,
    day: NaiveDate,
}

pub struct RiskManager {
    limits: RiskLimits,
    book: Mutex<RiskBook>,
    snap_tx: watch::Sender<PortfolioState>,
    agent_tx: mpsc::Sender<AgentRiskEvent>,
}

impl RiskManager {
    pub fn new(
        limits: RiskLimits,
        agents: &[AgentLimit],
        agent_tx: mpsc::Sender<AgentRiskEvent>,
    ) -> Result<(Self, watch::Receiver<PortfolioState>), RiskError> {
        if !(limits.total_capital.is_finite() && limits.total_capital > 0.0) {
            return Err(RiskError::InvalidLimit("total_capital"));
        }
        if !(limits.max_leverage.is_finite() && limits.max_leverage > 0.0) {
            return Err(RiskError::InvalidLimit("max_leverage"));
        }
        if !(0.0..=1.0).contains(&limits.max_drawdown) {
            return Err(RiskError::InvalidLimit("max_drawdown"));
        }
        let total: f64 = agents.iter().map(|a| a.allocation_fraction).sum();
        if total > 1.0 + 1e-9 {
            return Err(RiskError::AllocationOverflow { total });
        }

        let books = agents
            .iter()
            .map(|a| {
                let book = AgentBook {
                    fraction: a.allocation_fraction.max(0.0),
                    max_leverage: a.max_leverage.max(0.0),
                    reserved: 0.0,
                    daily_pnl: 0.0,
                    breached: false,
                };
                (a.agent_id.clone(), book)
            })
            .collect();

        let portfolio = PortfolioState {
            total_capital: limits.total_capital,
            peak_balance: limits.total_capital,
            ..PortfolioState::default()
        };
        let (snap_tx, snap_rx) = watch::channel(portfolio.clone());
        let book = RiskBook {
            portfolio,
            agents: books,
            reservations: HashMap::new(),
            halted: false,
            next_id: 1,
            day: Utc::now().date_naive(),
        };
        Ok((Self { limits, book: Mutex::new(book), snap_tx, agent_tx }, snap_rx))
    }

    fn lock(&self) -> MutexGuard<'_, RiskBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, book: &RiskBook) {
        EXPOSURE.set(book.portfolio.total_exposure);
        DRAWDOWN.set(book.portfolio.current_drawdown);
        HALTED.set(book.halted as i64);
        self.snap_tx.send_replace(book.portfolio.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<PortfolioState> {
        self.snap_tx.subscribe()
    }

    pub fn snapshot(&self) -> PortfolioState {
        self.lock().portfolio.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    /// Current capital allocation of one agent.
    pub fn allocation(&self, agent_id: &str) -> Option<f64> {
        let book = self.lock();
        let capital = book.portfolio.total_capital;
        book.agents.get(agent_id).map(|a| a.allocation(capital))
    }

    pub fn authorize(&self, decision: &ConsensusDecision, agent_id: &str) -> Result<Authorization, RiskRejection> {
        let mut book = self.lock();
        let res = self.authorize_locked(&mut book, decision, agent_id);
        self.publish(&book);
        drop(book);

        if let Err(r) = &res {
            RISK_REJECTS.with_label_values(&[r.reason()]).inc();
            warn!(agent = %agent_id, symbol = %decision.symbol, reason = r.reason(), detail = %r, "risk rejected");
        }
        res
    }

    fn authorize_locked(
        &self,
        book: &mut RiskBook,
        decision: &ConsensusDecision,
        agent_id: &str,
    ) -> Result<Authorization, RiskRejection> {
        let max_dd = self.limits.max_drawdown;
        book.portfolio.recompute_drawdown();
        let dd = book.portfolio.current_drawdown;

        if book.halted {
            if !self.limits.manual_halt_clear && dd <= max_dd {
                book.halted = false;
                info!(drawdown = dd, "drawdown recovered, halt lifted");
            } else {
                return Err(RiskRejection::DrawdownExceeded { drawdown: dd, max: max_dd });
            }
        }
        if dd > max_dd {
            book.halted = true;
            error!(drawdown = dd, max = max_dd, "EMERGENCY: max drawdown breached, halting new authorizations");
            return Err(RiskRejection::DrawdownExceeded { drawdown: dd, max: max_dd });
        }

        let limit_frac = self.limits.daily_loss_limit_fraction;
        let agent = book.agents.get(agent_id).ok_or_else(|| RiskRejection::UnknownAgent(agent_id.to_string()))?;
        let allocation = agent.allocation(book.portfolio.total_capital);
        if agent.breached {
            return Err(RiskRejection::AgentLossLimit {
                agent: agent_id.to_string(),
                loss: agent.daily_loss(),
                limit: limit_frac * allocation,
            });
        }
        if decision.direction == Direction::Flat {
            return Err(RiskRejection::InvalidDecision("flat direction".into()));
        }
        if !(decision.notional.is_finite() && decision.notional > 0.0) {
            return Err(RiskRejection::InvalidDecision(format!("notional {}", decision.notional)));
        }

        // partial sizing lebih baik daripada reject
        let capped = decision
            .notional
            .min(self.limits.max_position_fraction * allocation)
            .min(allocation - agent.reserved);
        if capped <= 1e-9 {
            return Err(RiskRejection::AllocationExhausted(agent_id.to_string()));
        }

        let leverage = agent.max_leverage;
        let projected = (book.portfolio.total_exposure + capped * leverage) / book.portfolio.total_capital;
        if !(projected <= self.limits.max_leverage) {
            return Err(RiskRejection::LeverageExceeded { projected, max: self.limits.max_leverage });
        }

        let id = book.next_id;
        book.next_id += 1;
        book.reservations.insert(
            id,
            Reservation {
                agent_id: agent_id.to_string(),
                symbol: decision.symbol.clone(),
                direction: decision.direction,
                notional: capped,
                leverage,
                created: Utc::now(),
            },
        );
        if let Some(a) = book.agents.get_mut(agent_id) {
            a.reserved += capped;
        }
        book.portfolio.total_exposure += capped * leverage;

        if capped < decision.notional {
            info!(agent = %agent_id, symbol = %decision.symbol, requested = decision.notional, capped, "notional capped");
        }
        Ok(Authorization {
            approved: true,
            reservation_id: id,
            agent_id: agent_id.to_string(),
            symbol: decision.symbol.clone(),
            direction: decision.direction,
            adjusted_notional: capped,
            leverage,
        })
    }

    /// Undo a reservation whose execution never happened.
    pub fn release(&self, reservation_id: u64) -> Result<(), RiskError> {
        let mut book = self.lock();
        let r = book.reservations.remove(&reservation_id).ok_or(RiskError::UnknownReservation(reservation_id))?;
        if let Some(a) = book.agents.get_mut(&r.agent_id) {
            a.reserved = (a.reserved - r.notional).max(0.0);
        }
        book.portfolio.total_exposure = (book.portfolio.total_exposure - r.notional * r.leverage).max(0.0);
        self.publish(&book);
        info!(reservation_id, agent = %r.agent_id, symbol = %r.symbol, "reservation released");
        Ok(())
    }

    /// Execution sent: the reservation becomes an open position with the same id.
    pub fn confirm(&self, reservation_id: u64) -> Result<u64, RiskError> {
        let mut book = self.lock();
        let r = book.reservations.remove(&reservation_id).ok_or(RiskError::UnknownReservation(reservation_id))?;
        book.portfolio.open_positions.push(Position {
            id: reservation_id,
            agent_id: r.agent_id,
            symbol: r.symbol,
            direction: r.direction,
            notional: r.notional,
            leverage: r.leverage,
            opened_at: r.created,
        });
        self.publish(&book);
        Ok(reservation_id)
    }

    /// Fold one external position event into the book.
    pub fn apply_position_update(&self, update: PositionUpdate) -> Result<Applied, RiskError> {
        if let Err(e) = validate(&update) {
            warn!(error = %e, "position update rejected");
            return Err(e);
        }
        let mut book = self.lock();
        let applied = match update {
            PositionUpdate::Opened { agent_id, symbol, direction, notional, leverage } => {
                let id = book.next_id;
                book.next_id += 1;
                if let Some(a) = book.agents.get_mut(&agent_id) {
                    a.reserved += notional;
                }
                book.portfolio.total_exposure += notional * leverage;
                book.portfolio.open_positions.push(Position {
                    id,
                    agent_id,
                    symbol,
                    direction,
                    notional,
                    leverage,
                    opened_at: Utc::now(),
                });
                Applied::Opened(id)
            }
            PositionUpdate::Closed { position_id, realized_pnl } => {
                let idx = book
                    .portfolio
                    .open_positions
                    .iter()
                    .position(|p| p.id == position_id)
                    .ok_or(RiskError::UnknownPosition(position_id))?;
                let p = book.portfolio.open_positions.swap_remove(idx);
                if let Some(a) = book.agents.get_mut(&p.agent_id) {
                    a.reserved = (a.reserved - p.notional).max(0.0);
                }
                book.portfolio.total_exposure = (book.portfolio.total_exposure - p.exposure()).max(0.0);
                self.realize_locked(&mut book, &p.agent_id, realized_pnl);
                Applied::Closed { agent_id: p.agent_id, realized_pnl }
            }
            PositionUpdate::Mark { unrealized_pnl } => {
                book.portfolio.unrealized_pnl = unrealized_pnl;
                Applied::Marked
            }
        };
        book.portfolio.recompute_drawdown();
        self.publish(&book);
        Ok(applied)
    }

    /// Realized PnL for one agent; drives the daily-loss breach.
    pub fn record_realized_pnl(&self, agent_id: &str, pnl: f64) -> Result<(), RiskError> {
        finite("realized_pnl", pnl)?;
        let mut book = self.lock();
        if !book.agents.contains_key(agent_id) {
            return Err(RiskError::UnknownAgent(agent_id.to_string()));
        }
        self.realize_locked(&mut book, agent_id, pnl);
        book.portfolio.recompute_drawdown();
        self.publish(&book);
        Ok(())
    }

    fn realize_locked(&self, book: &mut RiskBook, agent_id: &str, pnl: f64) {
        book.portfolio.total_capital += pnl;
        let capital = book.portfolio.total_capital;
        let limit_frac = self.limits.daily_loss_limit_fraction;
        let Some(a) = book.agents.get_mut(agent_id) else { return };
        a.daily_pnl += pnl;
        let limit = limit_frac * a.allocation(capital);
        let breached = a.daily_loss() > limit;
        if breached != a.breached {
            a.breached = breached;
            if breached {
                warn!(agent = %agent_id, loss = a.daily_loss(), limit, "agent daily loss limit breached");
            }
        }
        let ev = AgentRiskEvent { agent_id: agent_id.to_string(), daily_loss: a.daily_loss(), breached };
        if let Err(e) = self.agent_tx.try_send(ev) {
            warn!(agent = %agent_id, ?e, "agent risk event dropped");
        }
    }

    /// Manual halt clear; refused while drawdown is still over the limit.
    pub fn clear_halt(&self) -> Result<(), RiskError> {
        let mut book = self.lock();
        book.portfolio.recompute_drawdown();
        let dd = book.portfolio.current_drawdown;
        if dd > self.limits.max_drawdown {
            return Err(RiskError::HaltStillActive { drawdown: dd, max: self.limits.max_drawdown });
        }
        if book.halted {
            book.halted = false;
            info!(drawdown = dd, "halt cleared manually");
        }
        self.publish(&book);
        Ok(())
    }

    /// Reset per-agent daily loss counters (UTC day boundary).
    pub fn reset_day(&self) {
        let mut book = self.lock();
        book.day = Utc::now().date_naive();
        for (id, a) in book.agents.iter_mut() {
            let was = a.breached;
            a.daily_pnl = 0.0;
            a.breached = false;
            if was {
                let ev = AgentRiskEvent { agent_id: id.clone(), daily_loss: 0.0, breached: false };
                if let Err(e) = self.agent_tx.try_send(ev) {
                    warn!(agent = %id, ?e, "agent risk event dropped");
                }
            }
        }
        info!("risk day reset");
    }

    fn refresh(&self) {
        let book = self.lock();
        self.publish(&book);
    }

    fn day_rolled(&self) -> bool {
        self.lock().day != Utc::now().date_naive()
    }
}

/// Housekeeping task: UTC day rollover plus periodic gauge refresh.
pub async fn run(risk: std::sync::Arc<RiskManager>, check_every: Duration) {
    let mut tick = interval(check_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if risk.day_rolled() {
            risk.reset_day();
        }
        risk.refresh();
    }
}
