// ===============================
// src/positions.rs (paper position tracker)
// ===============================
//
// Dry run tanpa order router: posisi yang di-confirm Risk Manager
// di-mark-to-market dari harga terakhir, lalu ditutup setelah `hold`.
// Hasilnya dikirim balik sebagai PositionUpdate (Mark / Closed), sama
// seperti yang dikirim companion trader di mode live.
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::agents::MarketViews;
use crate::domain::{PortfolioState, Position, PositionUpdate};
use crate::metrics::{PNL_REALIZED, PNL_UNREALIZED};

#[derive(Debug, Clone, Copy)]
struct Entry {
    px: f64,
    seen_at: Instant,
}

pub struct PaperBook {
    hold: Duration,
    entries: HashMap<u64, Entry>,
    // Closed terkirim tapi belum di-fold Risk Manager
    closing: HashSet<u64>,
    realized: f64,
}

fn pnl(p: &Position, entry_px: f64, px: f64) -> f64 {
    if entry_px <= 0.0 {
        return 0.0;
    }
    p.direction.sign() * p.exposure() * (px / entry_px - 1.0)
}

impl PaperBook {
    pub fn new(hold: Duration) -> Self {
        Self { hold, entries: HashMap::new(), closing: HashSet::new(), realized: 0.0 }
    }

    pub fn realized(&self) -> f64 { self.realized }

    /// Updates for one snapshot: a `Closed` per position past its hold, then one `Mark`.
    pub fn on_snapshot(&mut self, state: &PortfolioState, views: &MarketViews, now: Instant) -> Vec<PositionUpdate> {
        let open = |id: &u64| state.open_positions.iter().any(|p| p.id == *id);
        self.entries.retain(|id, _| open(id));
        self.closing.retain(|id| open(id));

        let mut out = Vec::new();
        let mut unrealized = 0.0;
        for p in &state.open_positions {
            if self.closing.contains(&p.id) {
                continue;
            }
            let Some(px) = views.last_price(&p.symbol) else { continue };
            let e = *self.entries.entry(p.id).or_insert(Entry { px, seen_at: now });
            let u = pnl(p, e.px, px);
            if now.saturating_duration_since(e.seen_at) >= self.hold {
                self.realized += u;
                self.entries.remove(&p.id);
                self.closing.insert(p.id);
                debug!(position = p.id, agent = %p.agent_id, symbol = %p.symbol, pnl = u, "paper position closed");
                out.push(PositionUpdate::Closed { position_id: p.id, realized_pnl: u });
            } else {
                unrealized += u;
            }
        }
        if (unrealized - state.unrealized_pnl).abs() > f64::EPSILON {
            out.push(PositionUpdate::Mark { unrealized_pnl: unrealized });
        }
        PNL_REALIZED.set(self.realized);
        PNL_UNREALIZED.set(unrealized);
        out
    }
}

pub async fn run(
    mut portfolio_rx: watch::Receiver<PortfolioState>,
    views: MarketViews,
    pos_tx: mpsc::Sender<PositionUpdate>,
    hold: Duration,
    every: Duration,
) {
    let mut book = PaperBook::new(hold);
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(hold_ms = hold.as_millis() as u64, "paper position tracker started");
    loop {
        tick.tick().await;
        let state = portfolio_rx.borrow_and_update().clone();
        for u in book.on_snapshot(&state, &views, Instant::now()) {
            if pos_tx.send(u).await.is_err() {
                info!("position channel closed, paper tracker stopped");
                return;
            }
        }
    }
}
