// ===============================
// src/rate_budget.rs
// ===============================
//
// Sisa kapasitas request ke exchange per window waktu.
// - try_acquire()    : dipanggil sebelum setiap outbound call (collector)
// - observe_status() : status HTTP + header used-weight dari exchange
//                      429/418 -> sisa budget langsung nol sampai window reset
// - snapshot()       : dibaca Fallback Coordinator tiap tick
//
// Hanya atomics, tidak ada lock: tracker satu-satunya pemilik state ini.
//
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::RATE_BUDGET_REMAINING;

/// Header Binance untuk request weight yang sudah terpakai di window 1 menit.
pub const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

#[derive(Debug, Clone)]
pub struct RateBudget {
    pub remaining_calls: u32,
    pub capacity: u32,
    pub window_reset_at: Instant,
    pub throttled_agents: Vec<String>,
}

impl RateBudget {
    pub fn fraction_remaining(&self) -> f64 {
        if self.capacity == 0 { 0.0 } else { self.remaining_calls as f64 / self.capacity as f64 }
    }
}

#[derive(Debug)]
pub struct RateBudgetTracker {
    capacity: u32,
    window_ms: u64,
    base: Instant,
    remaining: AtomicU32,
    // offset (ms) dari `base`
    window_reset_ms: AtomicU64,
}

impl RateBudgetTracker {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        Self {
            capacity,
            window_ms,
            base: Instant::now(),
            remaining: AtomicU32::new(capacity),
            window_reset_ms: AtomicU64::new(window_ms),
        }
    }

    pub fn capacity(&self) -> u32 { self.capacity }

    fn now_ms(&self) -> u64 { self.base.elapsed().as_millis() as u64 }

    /// Window lama sudah lewat -> isi ulang budget. Hanya satu caller yang menang CAS.
    fn roll_window(&self) {
        let now = self.now_ms();
        let reset = self.window_reset_ms.load(Ordering::Acquire);
        if now < reset {
            return;
        }
        let next = now + self.window_ms;
        if self
            .window_reset_ms
            .compare_exchange(reset, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.remaining.store(self.capacity, Ordering::Release);
            RATE_BUDGET_REMAINING.set(self.capacity as i64);
            debug!(capacity = self.capacity, "rate window reset");
        }
    }

    /// Charge satu call. `false` berarti budget habis untuk window ini.
    pub fn try_acquire(&self) -> bool {
        self.roll_window();
        let ok = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .is_ok();
        RATE_BUDGET_REMAINING.set(self.remaining.load(Ordering::Acquire) as i64);
        ok
    }

    /// Fold response exchange ke budget.
    pub fn observe_status(&self, status: u16, used_weight: Option<u32>) {
        self.roll_window();
        if status == 429 || status == 418 {
            warn!(status, "exchange rate limited, budget zeroed until window reset");
            self.exhaust();
            return;
        }
        if let Some(used) = used_weight {
            let left = self.capacity.saturating_sub(used);
            self.remaining.fetch_min(left, Ordering::AcqRel);
            RATE_BUDGET_REMAINING.set(self.remaining.load(Ordering::Acquire) as i64);
        }
    }

    pub fn exhaust(&self) {
        self.remaining.store(0, Ordering::Release);
        RATE_BUDGET_REMAINING.set(0);
    }

    pub fn remaining(&self) -> u32 {
        self.roll_window();
        self.remaining.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, throttled_agents: Vec<String>) -> RateBudget {
        let remaining_calls = self.remaining();
        let reset_ms = self.window_reset_ms.load(Ordering::Acquire);
        RateBudget {
            remaining_calls,
            capacity: self.capacity,
            window_reset_at: self.base + Duration::from_millis(reset_ms),
            throttled_agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_drains_budget() {
        let t = RateBudgetTracker::new(3, Duration::from_secs(60));
        assert!(t.try_acquire());
        assert!(t.try_acquire());
        assert!(t.try_acquire());
        assert!(!t.try_acquire());
        assert_eq!(t.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_429_zeroes_budget_until_reset() {
        let t = RateBudgetTracker::new(100, Duration::from_secs(60));
        t.observe_status(429, None);
        assert_eq!(t.remaining(), 0);
        assert!(!t.try_acquire());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(t.remaining(), 100);
        assert!(t.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn used_weight_header_lowers_remaining() {
        let t = RateBudgetTracker::new(1200, Duration::from_secs(60));
        t.observe_status(200, Some(1000));
        assert_eq!(t.remaining(), 200);
        // header lebih kecil tidak menaikkan budget lagi
        t.observe_status(200, Some(10));
        assert_eq!(t.remaining(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_carries_throttled_agents() {
        let t = RateBudgetTracker::new(10, Duration::from_secs(60));
        let snap = t.snapshot(vec!["order_flow".into()]);
        assert_eq!(snap.remaining_calls, 10);
        assert_eq!(snap.throttled_agents, vec!["order_flow".to_string()]);
        assert!((snap.fraction_remaining() - 1.0).abs() < 1e-12);
    }
}
