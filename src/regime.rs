// ===============================
// src/regime.rs
// ===============================
//
// Market regime classifier (cadence lebih lambat dari decision loop).
//   |trend| <= trend_threshold         -> range_bound (tie juga ke range, lebih konservatif)
//   trend > 0, vol >  vol_threshold    -> bull_volatile
//   trend > 0, vol <= vol_threshold    -> bull_trending
//   trend < 0, ...                     -> bear_volatile / bear_trending
// Indikator hilang -> label sebelumnya dipertahankan.
//
use tracing::{debug, info};

use crate::config::RegimeCfg;
use crate::domain::{Regime, RegimeLabel};
use crate::market::Indicators;

pub struct RegimeClassifier {
    cfg: RegimeCfg,
    current: RegimeLabel,
    ticks_since: u64,
    classified_once: bool,
}

impl RegimeClassifier {
    pub fn new(cfg: RegimeCfg) -> Self {
        Self { cfg, current: RegimeLabel::default(), ticks_since: 0, classified_once: false }
    }

    pub fn current(&self) -> RegimeLabel { self.current }

    pub fn classify(&mut self, ind: &Indicators) -> RegimeLabel {
        let (trend, vol) = match (ind.trend_strength, ind.volatility) {
            (Some(t), Some(v)) if t.is_finite() && v.is_finite() => (t, v),
            _ => {
                debug!(held = self.current.regime.as_str(), "regime: missing indicators, holding label");
                return self.current;
            }
        };

        let thr = self.cfg.trend_threshold.max(f64::EPSILON);
        let strength = trend.abs();
        let regime = if strength <= self.cfg.trend_threshold {
            Regime::RangeBound
        } else {
            let volatile = vol > self.cfg.vol_threshold;
            match (trend > 0.0, volatile) {
                (true, false) => Regime::BullTrending,
                (true, true) => Regime::BullVolatile,
                (false, false) => Regime::BearTrending,
                (false, true) => Regime::BearVolatile,
            }
        };
        // jarak dari batas trend/range, dinormalisasi ke threshold
        let confidence = ((strength - self.cfg.trend_threshold).abs() / thr).clamp(0.0, 1.0);

        let label = RegimeLabel { regime, confidence };
        if label.regime != self.current.regime {
            info!(from = self.current.regime.as_str(), to = regime.as_str(), confidence, "regime change");
        }
        self.current = label;
        self.classified_once = true;
        label
    }

    /// Dipanggil tiap decision tick; klasifikasi ulang hanya tiap `every_ticks`.
    pub fn on_tick(&mut self, ind: &Indicators) -> RegimeLabel {
        self.ticks_since += 1;
        if !self.classified_once || self.ticks_since >= self.cfg.every_ticks.max(1) {
            self.ticks_since = 0;
            return self.classify(ind);
        }
        self.current
    }
}
