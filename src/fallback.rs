// ===============================
// src/fallback.rs
// ===============================
//
// Dipanggil sekali per tick sebelum collector. Tiga tier:
//   ample       -> semua agent normal
//   constrained -> throttle agent prioritas tertinggi dulu (paling toleran cache
//                  untuk horizon pendek), lanjut ke prioritas berikut selama
//                  demand masih > sisa budget
//   exhausted   -> cache-only untuk semua agent, polling granularity dilebarkan
//                  sampai window rate reset
//
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::FallbackCfg;
use crate::metrics::{FALLBACK_TIER, THROTTLED_AGENTS};
use crate::rate_budget::RateBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetTier {
    Ample,
    Constrained,
    Exhausted,
}

impl BudgetTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetTier::Ample => "ample",
            BudgetTier::Constrained => "constrained",
            BudgetTier::Exhausted => "exhausted",
        }
    }

    fn gauge(&self) -> i64 {
        match self {
            BudgetTier::Ample => 0,
            BudgetTier::Constrained => 1,
            BudgetTier::Exhausted => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPlan {
    pub tier: BudgetTier,
    pub throttled: Vec<String>,
    pub cache_only: bool,
    /// Polling granularity; cached theses younger than this still count for throttled agents.
    pub poll_interval: Duration,
}

impl FallbackPlan {
    /// Plan with every agent live; used when no coordinator is involved (tests, single-shot runs).
    pub fn normal(poll_interval: Duration) -> Self {
        Self { tier: BudgetTier::Ample, throttled: Vec::new(), cache_only: false, poll_interval }
    }

    pub fn is_throttled(&self, agent_id: &str) -> bool {
        self.throttled.iter().any(|a| a == agent_id)
    }

    pub fn allows_live(&self, agent_id: &str) -> bool {
        !self.cache_only && !self.is_throttled(agent_id)
    }
}

pub struct FallbackCoordinator {
    cfg: FallbackCfg,
    // (agent_id, priority), prioritas tertinggi dulu; seri -> urutan registrasi
    by_priority: Vec<(String, u8)>,
    calls_per_agent: u32,
    last_tier: BudgetTier,
}

impl FallbackCoordinator {
    /// `agents` in registration order; `calls_per_agent` = live calls one agent makes per tick.
    pub fn new(cfg: FallbackCfg, agents: &[(String, u8)], calls_per_agent: u32) -> Self {
        let mut by_priority = agents.to_vec();
        by_priority.sort_by(|a, b| b.1.cmp(&a.1));
        Self { cfg, by_priority, calls_per_agent: calls_per_agent.max(1), last_tier: BudgetTier::Ample }
    }

    pub fn tier(&self) -> BudgetTier { self.last_tier }

    pub fn tier_for(&self, budget: &RateBudget) -> BudgetTier {
        if budget.remaining_calls == 0 {
            BudgetTier::Exhausted
        } else if budget.fraction_remaining() >= self.cfg.constrained_fraction {
            BudgetTier::Ample
        } else {
            BudgetTier::Constrained
        }
    }

    /// Computes this tick's plan and writes the throttled ids back into `budget`.
    pub fn plan(&mut self, budget: &mut RateBudget, now: Instant) -> FallbackPlan {
        let tier = self.tier_for(budget);
        let plan = match tier {
            BudgetTier::Ample => FallbackPlan::normal(self.cfg.normal_poll),
            BudgetTier::Constrained => {
                let mut throttled = Vec::new();
                let mut live = self.by_priority.len() as u32;
                for (id, _) in &self.by_priority {
                    let demand = live * self.calls_per_agent;
                    // yang pertama selalu di-throttle
                    if !throttled.is_empty() && demand <= budget.remaining_calls {
                        break;
                    }
                    throttled.push(id.clone());
                    live -= 1;
                }
                FallbackPlan { tier, throttled, cache_only: false, poll_interval: self.cfg.normal_poll }
            }
            BudgetTier::Exhausted => FallbackPlan {
                tier,
                throttled: self.by_priority.iter().map(|(id, _)| id.clone()).collect(),
                cache_only: true,
                poll_interval: self.cfg.degraded_poll,
            },
        };

        if tier != self.last_tier {
            let reset_in_ms = budget.window_reset_at.saturating_duration_since(now).as_millis() as u64;
            match tier {
                BudgetTier::Ample => info!(from = self.last_tier.as_str(), "rate budget recovered, all agents live"),
                _ => warn!(
                    from = self.last_tier.as_str(),
                    to = tier.as_str(),
                    remaining = budget.remaining_calls,
                    reset_in_ms,
                    throttled = ?plan.throttled,
                    "fallback tier change"
                ),
            }
            self.last_tier = tier;
        }
        FALLBACK_TIER.set(tier.gauge());
        THROTTLED_AGENTS.set(plan.throttled.len() as i64);
        budget.throttled_agents = plan.throttled.clone();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<(String, u8)> {
        vec![
            ("trend".into(), 40),
            ("order_flow".into(), 100),
            ("breakout".into(), 60),
            ("mean_reversion".into(), 40),
        ]
    }

    fn budget(remaining: u32, capacity: u32) -> RateBudget {
        RateBudget {
            remaining_calls: remaining,
            capacity,
            window_reset_at: Instant::now() + Duration::from_secs(30),
            throttled_agents: Vec::new(),
        }
    }

    fn coord() -> FallbackCoordinator {
        FallbackCoordinator::new(FallbackCfg::default(), &agents(), 1)
    }

    #[tokio::test(start_paused = true)]
    async fn ample_budget_runs_everyone() {
        let mut c = coord();
        let mut b = budget(1000, 1200);
        let plan = c.plan(&mut b, Instant::now());
        assert_eq!(plan.tier, BudgetTier::Ample);
        assert!(plan.throttled.is_empty());
        assert!(plan.allows_live("order_flow"));
        assert_eq!(plan.poll_interval, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn constrained_throttles_highest_priority_first() {
        let mut c = coord();
        let mut b = budget(100, 1200);
        let plan = c.plan(&mut b, Instant::now());
        assert_eq!(plan.tier, BudgetTier::Constrained);
        assert_eq!(plan.throttled, vec!["order_flow".to_string()]);
        assert!(!plan.cache_only);
        assert!(plan.allows_live("trend"));
        assert_eq!(b.throttled_agents, vec!["order_flow".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn constrained_keeps_throttling_while_demand_exceeds_budget() {
        let mut c = coord();
        let mut b = budget(2, 1200);
        let plan = c.plan(&mut b, Instant::now());
        // 4 agent, sisa 2 -> order_flow lalu breakout di-throttle
        assert_eq!(plan.throttled, vec!["order_flow".to_string(), "breakout".to_string()]);
        assert!(plan.allows_live("trend"));
        assert!(plan.allows_live("mean_reversion"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_goes_cache_only_with_wide_polling() {
        let mut c = coord();
        let mut b = budget(0, 1200);
        let plan = c.plan(&mut b, Instant::now());
        assert_eq!(plan.tier, BudgetTier::Exhausted);
        assert!(plan.cache_only);
        assert_eq!(plan.throttled.len(), 4);
        assert_eq!(plan.poll_interval, Duration::from_secs(300));
        assert!(!plan.allows_live("trend"));

        // window reset -> kembali normal
        let mut b = budget(1200, 1200);
        assert_eq!(c.plan(&mut b, Instant::now()).tier, BudgetTier::Ample);
        assert_eq!(c.tier(), BudgetTier::Ample);
    }
}
