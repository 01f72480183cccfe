// ===============================
// src/vpin.rs
// ===============================
//
// Order-flow imbalance (VPIN) untuk agent high-frequency.
//
// - Tick rule: harga naik -> volume ke buy, turun -> sell,
//   sama -> dibagi rata (tidak pernah dibuang).
// - Window = ring buffer kapasitas tetap (arena + head index), satu bucket per tick.
//   Bucket tertua di-evict saat penuh, jadi memori tidak tumbuh.
// - probability = |buy - sell| / total * sqrt(bucket_count), clamp [0, 1].
// - Batch < min_batch -> 0.0 (tick tetap masuk window).
//
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::VpinCfg;
use crate::domain::{MarketTick, Tick, TickBatch};
use crate::metrics::VPIN;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bucket {
    buy: f64,
    sell: f64,
}

/// Rolling accumulator; `buy_volume + sell_volume == total_volume` selalu.
#[derive(Debug, Clone)]
pub struct VpinWindow {
    buckets: Vec<Bucket>,
    head: usize,
    len: usize,
    buy_volume: f64,
    sell_volume: f64,
    total_volume: f64,
    pushes_since_resum: usize,
}

impl VpinWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buckets: vec![Bucket::default(); capacity],
            head: 0,
            len: 0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            total_volume: 0.0,
            pushes_since_resum: 0,
        }
    }

    pub fn capacity(&self) -> usize { self.buckets.len() }
    pub fn bucket_count(&self) -> usize { self.len }
    pub fn buy_volume(&self) -> f64 { self.buy_volume }
    pub fn sell_volume(&self) -> f64 { self.sell_volume }
    pub fn total_volume(&self) -> f64 { self.total_volume }

    fn push(&mut self, b: Bucket) {
        let cap = self.capacity();
        if self.len == cap {
            // penuh: slot di head adalah bucket tertua
            let old = self.buckets[self.head];
            self.buy_volume = (self.buy_volume - old.buy).max(0.0);
            self.sell_volume = (self.sell_volume - old.sell).max(0.0);
        } else {
            self.len += 1;
        }
        self.buckets[self.head] = b;
        self.head = (self.head + 1) % cap;
        self.buy_volume += b.buy;
        self.sell_volume += b.sell;

        // resum penuh sekali per putaran untuk membuang drift floating point
        self.pushes_since_resum += 1;
        if self.pushes_since_resum >= cap {
            self.resum();
        }
        self.total_volume = self.buy_volume + self.sell_volume;
    }

    fn resum(&mut self) {
        let (mut buy, mut sell) = (0.0, 0.0);
        for i in 0..self.len {
            let idx = (self.head + self.capacity() - self.len + i) % self.capacity();
            buy += self.buckets[idx].buy;
            sell += self.buckets[idx].sell;
        }
        self.buy_volume = buy;
        self.sell_volume = sell;
        self.pushes_since_resum = 0;
    }

    /// |buy - sell| / total, 0 kalau window kosong.
    pub fn imbalance(&self) -> f64 {
        if self.total_volume <= 0.0 { 0.0 } else { (self.buy_volume - self.sell_volume).abs() / self.total_volume }
    }

    /// (buy - sell) / total; positif = tekanan beli.
    pub fn signed_imbalance(&self) -> f64 {
        if self.total_volume <= 0.0 { 0.0 } else { (self.buy_volume - self.sell_volume) / self.total_volume }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VpinSnapshot {
    pub symbol: String,
    pub probability: f64,
    pub signed_imbalance: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub bucket_count: usize,
    pub ts_ms: i64,
}

pub struct VpinEngine {
    window: VpinWindow,
    min_batch: usize,
    last_price: Option<f64>,
}

impl VpinEngine {
    pub fn new(cfg: &VpinCfg) -> Self {
        Self { window: VpinWindow::new(cfg.window), min_batch: cfg.min_batch, last_price: None }
    }

    pub fn window(&self) -> &VpinWindow { &self.window }

    fn classify(&mut self, tick: &Tick) -> Bucket {
        let b = match self.last_price {
            Some(prev) if tick.price > prev => Bucket { buy: tick.volume, sell: 0.0 },
            Some(prev) if tick.price < prev => Bucket { buy: 0.0, sell: tick.volume },
            // harga sama (atau tick pertama): split rata
            _ => Bucket { buy: tick.volume / 2.0, sell: tick.volume / 2.0 },
        };
        self.last_price = Some(tick.price);
        b
    }

    pub fn ingest(&mut self, batch: &TickBatch) -> f64 {
        let mut accepted = 0usize;
        for tick in &batch.ticks {
            if !tick.price.is_finite() || tick.price <= 0.0 || !tick.volume.is_finite() || tick.volume < 0.0 {
                debug!(symbol = %batch.symbol, ?tick, "vpin: skip malformed tick");
                continue;
            }
            let b = self.classify(tick);
            self.window.push(b);
            accepted += 1;
        }

        // hanya tick valid yang dihitung untuk min_batch
        if accepted < self.min_batch {
            return 0.0;
        }
        let scaled = self.window.imbalance() * (self.window.bucket_count() as f64).sqrt();
        scaled.clamp(0.0, 1.0)
    }

    pub fn snapshot(&self, symbol: &str, probability: f64, ts_ms: i64) -> VpinSnapshot {
        VpinSnapshot {
            symbol: symbol.to_string(),
            probability,
            signed_imbalance: self.window.signed_imbalance(),
            buy_volume: self.window.buy_volume(),
            sell_volume: self.window.sell_volume(),
            bucket_count: self.window.bucket_count(),
            ts_ms,
        }
    }
}

/// Task VPIN per symbol: kumpulkan trade jadi batch, ingest, publish via watch.
/// Jalan terpisah dari cadence Decision Loop; collector hanya membaca snapshot terakhir.
pub async fn run(
    symbol: String,
    mut md_rx: broadcast::Receiver<MarketTick>,
    snap_tx: watch::Sender<VpinSnapshot>,
    cfg: VpinCfg,
) {
    let mut engine = VpinEngine::new(&cfg);
    let mut batch = TickBatch { symbol: symbol.clone(), ticks: Vec::with_capacity(cfg.batch_size) };
    let mut flush = interval(Duration::from_millis(cfg.flush_ms.max(1)));
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(%symbol, window = cfg.window, "vpin engine started");

    loop {
        tokio::select! {
            r = md_rx.recv() => {
                match r {
                    Ok(md) => {
                        if md.symbol != symbol { continue; }
                        batch.ticks.push(Tick { price: md.price, volume: md.volume, ts_ms: md.ts_ms });
                        if batch.ticks.len() < cfg.batch_size { continue; }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%symbol, skipped = n, "vpin lagging behind feed");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(%symbol, "md channel closed, vpin stopped");
                        break;
                    }
                }
            }
            _ = flush.tick() => {
                // sisa tick yang belum cukup untuk satu batch tetap dihitung pada flush
                if batch.ticks.len() < cfg.min_batch { continue; }
            }
        }

        let ts_ms = batch.ticks.last().map(|t| t.ts_ms).unwrap_or_default();
        let p = engine.ingest(&batch);
        batch.ticks.clear();
        VPIN.with_label_values(&[&symbol]).set(p);
        let _ = snap_tx.send(engine.snapshot(&symbol, p, ts_ms));
    }
}
