// ===============================
// src/fusion.rs
// ===============================
//
// Consensus: pilih satu thesis dari semua candidate.
//   1) risk_score >= risk_threshold   -> tolak (sebelum weighting apapun)
//   2) confidence < min_confidence    -> tolak
//   3) score = confidence * (1 - risk) * regime_affinity
//   4) score tertinggi menang; seri -> win-rate lebih baik -> index registrasi lebih kecil
//   5) tidak ada yang lolos / pemenang flat -> None (hasil normal, bukan error)
//
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use tracing::{debug, info};

use crate::collector::AgentProfile;
use crate::config::FusionCfg;
use crate::domain::{ConsensusDecision, Direction, RegimeLabel, RejectReason, RejectedCandidate, ThesisCandidate};
use crate::metrics::{DECISIONS, FUSION_REJECTS, NO_ACTION};

const NEUTRAL_WIN_RATE: f64 = 0.5;

/// Full result of one fusion round, including candidates that lost.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    pub decision: Option<ConsensusDecision>,
    pub rejected: Vec<RejectedCandidate>,
}

struct Scored<'a> {
    c: &'a ThesisCandidate,
    score: f64,
    win_rate: f64,
    index: usize,
}

pub struct FusionEngine {
    cfg: FusionCfg,
    profiles: HashMap<String, AgentProfile>,
    outcomes: HashMap<String, VecDeque<bool>>,
}

impl FusionEngine {
    pub fn new(cfg: FusionCfg, profiles: Vec<AgentProfile>) -> Self {
        let profiles = profiles.into_iter().map(|p| (p.agent_id.clone(), p)).collect();
        Self { cfg, profiles, outcomes: HashMap::new() }
    }

    /// Result of a closed position attributed to `agent_id`.
    pub fn record_outcome(&mut self, agent_id: &str, win: bool) {
        let cap = self.cfg.win_rate_window.max(1);
        let q = self.outcomes.entry(agent_id.to_string()).or_insert_with(|| VecDeque::with_capacity(cap));
        if q.len() == cap {
            q.pop_front();
        }
        q.push_back(win);
    }

    /// Trailing win-rate; 0.5 while there is no history.
    pub fn win_rate(&self, agent_id: &str) -> f64 {
        match self.outcomes.get(agent_id) {
            Some(q) if !q.is_empty() => q.iter().filter(|w| **w).count() as f64 / q.len() as f64,
            _ => NEUTRAL_WIN_RATE,
        }
    }

    /// 1.0 kalau spesialisasi cocok (atau generalist); kalau tidak, turun seiring keyakinan regime.
    pub fn affinity(&self, agent_id: &str, regime: RegimeLabel) -> f64 {
        let Some(p) = self.profiles.get(agent_id) else { return 1.0 };
        if p.specialization.is_empty() || p.specialization.contains(&regime.regime) {
            return 1.0;
        }
        let conf = if regime.confidence.is_finite() { regime.confidence.clamp(0.0, 1.0) } else { 0.0 };
        (1.0 - (1.0 - self.cfg.mismatch_affinity) * conf).clamp(0.5, 1.0)
    }

    fn index_of(&self, agent_id: &str) -> usize {
        self.profiles.get(agent_id).map(|p| p.index).unwrap_or(usize::MAX)
    }

    pub fn select(&self, candidates: &[ThesisCandidate], regime: RegimeLabel) -> Option<ConsensusDecision> {
        self.evaluate(candidates, regime).decision
    }

    pub fn evaluate(&self, candidates: &[ThesisCandidate], regime: RegimeLabel) -> FusionOutcome {
        let mut rejected: Vec<RejectedCandidate> = Vec::new();
        let mut scored: Vec<Scored> = Vec::with_capacity(candidates.len());

        for c in candidates {
            // NaN dianggap di atas threshold
            let reason = if c.risk_score.is_nan() || c.risk_score >= self.cfg.risk_threshold {
                Some(RejectReason::RiskThresholdExceeded)
            } else if c.confidence.is_nan() || c.confidence < self.cfg.min_confidence {
                Some(RejectReason::BelowConfidenceFloor)
            } else {
                None
            };
            if let Some(reason) = reason {
                debug!(agent = %c.agent_id, symbol = %c.symbol, reason = reason.as_str(), "candidate rejected");
                FUSION_REJECTS.with_label_values(&[reason.as_str()]).inc();
                rejected.push(RejectedCandidate { agent_id: c.agent_id.clone(), reason });
                continue;
            }
            let score = c.confidence * (1.0 - c.risk_score) * self.affinity(&c.agent_id, regime);
            scored.push(Scored { c, score, win_rate: self.win_rate(&c.agent_id), index: self.index_of(&c.agent_id) });
        }

        let Some(best) = scored.iter().map(|s| s.score).reduce(f64::max) else {
            NO_ACTION.inc();
            return FusionOutcome { decision: None, rejected };
        };
        let eps = self.cfg.tie_epsilon;
        let winner = scored
            .iter()
            .filter(|s| best - s.score < eps)
            .min_by(|a, b| {
                b.win_rate
                    .total_cmp(&a.win_rate)
                    .then(a.index.cmp(&b.index))
                    // id sama / agent tak terdaftar: tetap deterministik
                    .then(b.score.total_cmp(&a.score))
                    .then(b.c.confidence.total_cmp(&a.c.confidence))
                    .then(a.c.direction.as_str().cmp(b.c.direction.as_str()))
            })
            .map(|s| s.c);

        let Some(w) = winner else {
            NO_ACTION.inc();
            return FusionOutcome { decision: None, rejected };
        };
        for s in scored.iter().filter(|s| s.c.agent_id != w.agent_id) {
            rejected.push(RejectedCandidate { agent_id: s.c.agent_id.clone(), reason: RejectReason::Outscored });
        }

        if w.direction == Direction::Flat {
            debug!(agent = %w.agent_id, symbol = %w.symbol, "winning thesis is flat, no action");
            rejected.push(RejectedCandidate { agent_id: w.agent_id.clone(), reason: RejectReason::FlatDirection });
            NO_ACTION.inc();
            return FusionOutcome { decision: None, rejected };
        }

        let notional = if w.notional_hint.is_finite() && w.notional_hint > 0.0 {
            w.notional_hint
        } else {
            self.cfg.default_notional
        };
        let score = w.confidence * (1.0 - w.risk_score) * self.affinity(&w.agent_id, regime);
        let decision = ConsensusDecision {
            symbol: w.symbol.clone(),
            direction: w.direction,
            notional,
            confidence: w.confidence,
            score,
            winning_agent_id: w.agent_id.clone(),
            rejected_candidates: rejected.clone(),
            decided_at: Utc::now(),
        };
        DECISIONS.with_label_values(&[&decision.symbol, decision.direction.as_str()]).inc();
        info!(
            agent = %decision.winning_agent_id,
            symbol = %decision.symbol,
            direction = decision.direction.as_str(),
            score,
            regime = regime.regime.as_str(),
            "consensus"
        );
        FusionOutcome { decision: Some(decision), rejected }
    }
}
