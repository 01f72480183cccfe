// ===============================
// src/market.rs
// ===============================
//
// Rolling price history per symbol (tidak ada arsip tick penuh).
// Dipakai oleh strategy agents (SMA, hi/lo) dan regime classifier (trend, volatilitas).
// Dipublish lewat watch channel; pembaca cukup `borrow()` tanpa clone.
//
use std::collections::VecDeque;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::domain::MarketTick;
use crate::metrics::{TICKS, TICKS_BY_SYMBOL};

/// Input untuk regime classifier. `None` = data belum cukup.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Indicators {
    pub trend_strength: Option<f64>,
    pub volatility: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PriceHistory {
    pub symbol: String,
    prices: VecDeque<f64>,
    cap: usize,
    pub ts_ms: i64,
}

impl PriceHistory {
    pub fn new(symbol: impl Into<String>, cap: usize) -> Self {
        let cap = cap.max(2);
        Self { symbol: symbol.into(), prices: VecDeque::with_capacity(cap), cap, ts_ms: 0 }
    }

    pub fn push(&mut self, price: f64, ts_ms: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        if self.prices.len() == self.cap {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
        self.ts_ms = ts_ms;
    }

    pub fn len(&self) -> usize { self.prices.len() }
    pub fn is_empty(&self) -> bool { self.prices.is_empty() }
    pub fn last(&self) -> Option<f64> { self.prices.back().copied() }

    /// SMA dari `n` harga terakhir.
    pub fn sma(&self, n: usize) -> Option<f64> {
        if n == 0 || self.prices.len() < n {
            return None;
        }
        let sum: f64 = self.prices.iter().rev().take(n).sum();
        Some(sum / n as f64)
    }

    /// High/low dari `n` harga sebelum harga terakhir (level breakout).
    pub fn prior_hi_lo(&self, n: usize) -> Option<(f64, f64)> {
        if n == 0 || self.prices.len() < n + 1 {
            return None;
        }
        let mut hi = f64::MIN;
        let mut lo = f64::MAX;
        for &p in self.prices.iter().rev().skip(1).take(n) {
            hi = hi.max(p);
            lo = lo.min(p);
        }
        Some((hi, lo))
    }

    /// Stdev simple return dari `n` return terakhir.
    pub fn return_stdev(&self, n: usize) -> Option<f64> {
        if n < 2 || self.prices.len() < n + 1 {
            return None;
        }
        let tail: Vec<f64> = self.prices.iter().rev().take(n + 1).copied().collect();
        // tail terbalik (terbaru dulu): r_i = p_i / p_{i+1} - 1
        let rets: Vec<f64> = tail.windows(2).map(|w| w[0] / w[1] - 1.0).collect();
        let mean = rets.iter().sum::<f64>() / rets.len() as f64;
        let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rets.len() - 1) as f64;
        Some(var.sqrt())
    }

    /// (SMA fast - SMA slow) / SMA slow; positif = uptrend.
    pub fn trend_strength(&self, fast: usize, slow: usize) -> Option<f64> {
        let f = self.sma(fast)?;
        let s = self.sma(slow)?;
        if s <= 0.0 { None } else { Some((f - s) / s) }
    }

    pub fn indicators(&self, fast: usize, slow: usize) -> Indicators {
        Indicators { trend_strength: self.trend_strength(fast, slow), volatility: self.return_stdev(slow) }
    }
}

/// Task: fold trade per symbol ke PriceHistory dan publish.
pub async fn run(
    symbol: String,
    mut md_rx: broadcast::Receiver<MarketTick>,
    hist_tx: watch::Sender<PriceHistory>,
) {
    info!(%symbol, "market view started");
    loop {
        match md_rx.recv().await {
            Ok(md) => {
                if md.symbol != symbol { continue; }
                TICKS.inc();
                TICKS_BY_SYMBOL.with_label_values(&[&symbol]).inc();
                hist_tx.send_modify(|h| h.push(md.price, md.ts_ms));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(%symbol, skipped = n, "market view lagging"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
