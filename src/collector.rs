// ===============================
// src/collector.rs
// ===============================
//
// Agent Signal Collector: fan-out ke semua agent untuk satu symbol, tunggu semua
// (atau timeout), kembalikan candidate yang lolos validasi.
//
// - concurrency dibatasi (buffer_unordered(max_parallel))
// - timeout per attempt, retry exponential backoff + jitter untuk error transient
// - cache per agent keyed (symbol, rounded_timestamp); hit = source "cached", tanpa call
// - setiap live call dibebankan ke RateBudgetTracker
// - hallucination guard: buang candidate yang tidak masuk akal (per agent, bukan global)
// - AgentState hanya dimiliki collector; Risk Manager mengirim AgentRiskEvent via channel
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::agents::{Agent, AgentError, MarketViews};
use crate::config::CollectorCfg;
use crate::domain::{AgentRiskEvent, CandidateSource, Regime, RegimeLabel, ThesisCandidate};
use crate::fallback::FallbackPlan;
use crate::metrics::{AGENT_FAILURES, CANDIDATES, COLLECT_LATENCY};
use crate::rate_budget::RateBudgetTracker;

#[derive(Debug, Clone)]
struct CacheEntry {
    bucket: u64,
    candidate: ThesisCandidate,
    stored_at: Instant,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: String,
    /// Allocation at registration; live sizing uses `RiskManager::allocation`.
    pub capital_allocation: f64,
    pub max_leverage: f64,
    pub daily_loss: f64,
    pub daily_loss_breached: bool,
    pub enabled: bool,
    pub last_polled: Option<Instant>,
    // satu entry terbaru per symbol
    cache: HashMap<String, CacheEntry>,
}

impl AgentState {
    pub fn new(agent_id: &str, capital_allocation: f64, max_leverage: f64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            capital_allocation,
            max_leverage,
            daily_loss: 0.0,
            daily_loss_breached: false,
            enabled: true,
            last_polled: None,
            cache: HashMap::new(),
        }
    }

    pub fn cache_expires_at(&self, symbol: &str) -> Option<Instant> {
        self.cache.get(symbol).map(|e| e.expires_at)
    }

    fn reset_day(&mut self) {
        self.daily_loss = 0.0;
        self.daily_loss_breached = false;
    }

    /// Fresh hit: same or previous bucket and not expired.
    fn fresh(&self, symbol: &str, bucket: u64, now: Instant) -> Option<&ThesisCandidate> {
        self.cache
            .get(symbol)
            .filter(|e| (e.bucket == bucket || e.bucket + 1 == bucket) && now < e.expires_at)
            .map(|e| &e.candidate)
    }

    fn within(&self, symbol: &str, max_age: Duration, now: Instant) -> Option<&ThesisCandidate> {
        self.cache
            .get(symbol)
            .filter(|e| now.saturating_duration_since(e.stored_at) <= max_age)
            .map(|e| &e.candidate)
    }
}

/// Static facts about a registered agent, for fusion and the fallback coordinator.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub index: usize,
    pub priority: u8,
    pub specialization: Vec<Regime>,
}

pub struct Collector {
    cfg: CollectorCfg,
    agents: Vec<Arc<dyn Agent>>,
    states: Vec<AgentState>,
    tracker: Arc<RateBudgetTracker>,
    risk_rx: mpsc::Receiver<AgentRiskEvent>,
    views: MarketViews,
    plan: FallbackPlan,
    base: Instant,
    day: NaiveDate,
}

enum Job {
    Live,
    Ready(ThesisCandidate),
}

impl Collector {
    pub fn new(cfg: CollectorCfg, tracker: Arc<RateBudgetTracker>, risk_rx: mpsc::Receiver<AgentRiskEvent>) -> Self {
        Self {
            cfg,
            agents: Vec::new(),
            states: Vec::new(),
            tracker,
            risk_rx,
            views: MarketViews::new(),
            plan: FallbackPlan::normal(Duration::ZERO),
            base: Instant::now(),
            day: Utc::now().date_naive(),
        }
    }

    /// Reference prices for the hallucination guard.
    pub fn with_views(mut self, views: MarketViews) -> Self {
        self.views = views;
        self
    }

    /// Agents are kept in registration order; that order breaks fusion ties.
    pub fn register(&mut self, agent: Arc<dyn Agent>, capital_allocation: f64, max_leverage: f64) {
        self.states.push(AgentState::new(agent.id(), capital_allocation, max_leverage));
        self.agents.push(agent);
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        self.agents
            .iter()
            .enumerate()
            .map(|(index, a)| AgentProfile {
                agent_id: a.id().to_string(),
                index,
                priority: a.priority(),
                specialization: a.specialization().to_vec(),
            })
            .collect()
    }

    pub fn agent_states(&self) -> &[AgentState] { &self.states }

    pub fn set_enabled(&mut self, agent_id: &str, enabled: bool) -> bool {
        match self.states.iter_mut().find(|s| s.agent_id == agent_id) {
            Some(s) => {
                s.enabled = enabled;
                info!(agent = %agent_id, enabled, "agent toggled");
                true
            }
            None => false,
        }
    }

    /// Plan from the fallback coordinator; applies to every following `collect`.
    pub fn set_plan(&mut self, plan: FallbackPlan) {
        self.plan = plan;
    }

    fn bucket(&self, now: Instant) -> u64 {
        let ttl_ms = (self.cfg.cache_ttl.as_millis() as u64).max(1);
        now.saturating_duration_since(self.base).as_millis() as u64 / ttl_ms
    }

    fn drain_risk_events(&mut self) {
        while let Ok(ev) = self.risk_rx.try_recv() {
            if let Some(s) = self.states.iter_mut().find(|s| s.agent_id == ev.agent_id) {
                if ev.breached && !s.daily_loss_breached {
                    warn!(agent = %ev.agent_id, daily_loss = ev.daily_loss, "agent daily loss limit breached, skipping");
                }
                s.daily_loss = ev.daily_loss;
                s.daily_loss_breached = ev.breached;
            }
        }
        let today = Utc::now().date_naive();
        if today != self.day {
            info!(%today, "day boundary, agent loss counters reset");
            self.states.iter_mut().for_each(AgentState::reset_day);
            self.day = today;
        }
    }

    pub async fn collect(&mut self, symbol: &str, regime: RegimeLabel) -> Vec<ThesisCandidate> {
        let started = Instant::now();
        self.drain_risk_events();

        let now = Instant::now();
        let bucket = self.bucket(now);
        let mut jobs: Vec<(usize, Job)> = Vec::with_capacity(self.agents.len());

        for (i, agent) in self.agents.iter().enumerate() {
            let st = &self.states[i];
            if !st.enabled || st.daily_loss_breached {
                debug!(agent = %st.agent_id, %symbol, enabled = st.enabled, "agent skipped");
                continue;
            }
            if let Some(c) = st.fresh(symbol, bucket, now) {
                jobs.push((i, Job::Ready(c.with_source(CandidateSource::Cached))));
            } else if self.plan.allows_live(agent.id()) {
                jobs.push((i, Job::Live));
            } else if let Some(c) = self.degraded(i, symbol, regime, now) {
                jobs.push((i, Job::Ready(c)));
            } else {
                debug!(agent = %st.agent_id, %symbol, tier = self.plan.tier.as_str(), "throttled, nothing cached");
            }
        }

        // fan-out live calls
        let live: Vec<usize> = jobs.iter().filter(|(_, j)| matches!(j, Job::Live)).map(|(i, _)| *i).collect();
        let results: Vec<(usize, Result<ThesisCandidate, AgentError>)> = stream::iter(live.into_iter().map(|i| {
            let agent = self.agents[i].clone();
            let tracker = self.tracker.clone();
            let cfg = self.cfg.clone();
            let sym = symbol.to_string();
            async move { (i, query_with_retry(agent, &sym, regime, &tracker, &cfg).await) }
        }))
        .buffer_unordered(self.cfg.max_parallel.max(1))
        .collect()
        .await;

        let reference = self.views.last_price(symbol);
        let now = Instant::now();
        let bucket = self.bucket(now);
        let mut out: Vec<(usize, ThesisCandidate)> = jobs
            .into_iter()
            .filter_map(|(i, j)| match j {
                Job::Ready(c) => Some((i, c)),
                Job::Live => None,
            })
            .collect();

        for (i, res) in results {
            let id = self.states[i].agent_id.clone();
            self.states[i].last_polled = Some(now);
            match res {
                Ok(c) => match validate(&c, &id, symbol, reference, &self.cfg) {
                    Ok(()) => {
                        self.states[i].cache.insert(
                            symbol.to_string(),
                            CacheEntry { bucket, candidate: c.clone(), stored_at: now, expires_at: now + self.cfg.cache_ttl },
                        );
                        out.push((i, c));
                    }
                    Err(e) => {
                        AGENT_FAILURES.with_label_values(&[&id, e.kind()]).inc();
                        warn!(agent = %id, %symbol, reason = %e, "hallucination guard discarded thesis");
                    }
                },
                Err(AgentError::RateLimited(status)) => {
                    AGENT_FAILURES.with_label_values(&[&id, "rate_limited"]).inc();
                    match self.degraded(i, symbol, regime, now) {
                        Some(c) => {
                            debug!(agent = %id, %symbol, status, source = c.source.as_str(), "rate limited, degraded thesis");
                            out.push((i, c));
                        }
                        None => warn!(agent = %id, %symbol, status, "rate limited, agent excluded this tick"),
                    }
                }
                Err(e) => {
                    AGENT_FAILURES.with_label_values(&[&id, e.kind()]).inc();
                    warn!(agent = %id, %symbol, reason = %e, "agent excluded this tick");
                }
            }
        }

        out.sort_by_key(|(i, _)| *i);
        for (_, c) in &out {
            CANDIDATES.with_label_values(&[&c.agent_id, c.source.as_str()]).inc();
        }
        COLLECT_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
        out.into_iter().map(|(_, c)| c).collect()
    }

    // cache yang masih dalam polling granularity, kalau tidak ada -> fallback lokal agent
    fn degraded(&self, i: usize, symbol: &str, regime: RegimeLabel, now: Instant) -> Option<ThesisCandidate> {
        let max_age = self.plan.poll_interval.max(self.cfg.cache_ttl);
        if let Some(c) = self.states[i].within(symbol, max_age, now) {
            return Some(c.with_source(CandidateSource::Cached));
        }
        self.agents[i].fallback(symbol, regime).map(|c| c.with_source(CandidateSource::Fallback))
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_ms = (base.as_millis() as u64 / 4).max(1);
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

async fn query_with_retry(
    agent: Arc<dyn Agent>,
    symbol: &str,
    regime: RegimeLabel,
    tracker: &RateBudgetTracker,
    cfg: &CollectorCfg,
) -> Result<ThesisCandidate, AgentError> {
    let mut attempt = 1;
    loop {
        if !tracker.try_acquire() {
            return Err(AgentError::RateLimited(429));
        }
        // timeout = titik cancel; hasil yang telat dibuang bersama future-nya
        let res = match timeout(cfg.timeout, agent.query(symbol, regime)).await {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(cfg.timeout)),
        };
        match res {
            Ok(c) => return Ok(c),
            Err(e) if e.is_transient() && attempt < cfg.max_attempts => {
                let wait = backoff(cfg.retry_base, attempt);
                debug!(agent = %agent.id(), %symbol, attempt, ?wait, reason = %e, "transient failure, retrying");
                sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Hallucination guard. `reference` is the latest traded price when known.
pub fn validate(
    c: &ThesisCandidate,
    agent_id: &str,
    symbol: &str,
    reference: Option<f64>,
    cfg: &CollectorCfg,
) -> Result<(), AgentError> {
    let unit = |x: f64| x.is_finite() && (0.0..=1.0).contains(&x);
    if c.agent_id != agent_id || c.symbol != symbol {
        return Err(AgentError::Invalid(format!("thesis for {}/{}", c.agent_id, c.symbol)));
    }
    if !unit(c.confidence) {
        return Err(AgentError::Invalid(format!("confidence {}", c.confidence)));
    }
    if !unit(c.risk_score) {
        return Err(AgentError::Invalid(format!("risk_score {}", c.risk_score)));
    }
    if !c.notional_hint.is_finite() {
        return Err(AgentError::Invalid("notional_hint not finite".into()));
    }
    let Some(f) = c.forecast else { return Ok(()) };
    if !(f.price.is_finite() && f.lower.is_finite() && f.upper.is_finite()) || f.lower > f.upper {
        return Err(AgentError::Invalid(format!("forecast {:?}", f)));
    }
    let px = reference.filter(|p| *p > 0.0).unwrap_or(f.price);
    if px <= 0.0 {
        return Err(AgentError::Invalid(format!("forecast price {}", f.price)));
    }
    let deviation = (f.price - px).abs() / px;
    if deviation > cfg.max_forecast_deviation {
        return Err(AgentError::Invalid(format!("forecast {:.2} is {:.1}% from {:.2}", f.price, deviation * 100.0, px)));
    }
    let width = (f.upper - f.lower) / px;
    if width > cfg.max_interval_width {
        return Err(AgentError::Invalid(format!("interval width {:.1}% of price", width * 100.0)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::domain::{Direction, Forecast};
    use crate::fallback::BudgetTier;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Sleep(Duration),
        FailTransient(u32),
        Decode,
    }

    struct MockAgent {
        id: String,
        calls: Arc<AtomicU32>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        behavior: Behavior,
        confidence: f64,
        risk: f64,
        forecast: Option<Forecast>,
        has_fallback: bool,
    }

    impl MockAgent {
        fn new(id: &str, behavior: Behavior) -> Self {
            Self {
                id: id.to_string(),
                calls: Arc::new(AtomicU32::new(0)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                behavior,
                confidence: 0.6,
                risk: 0.2,
                forecast: None,
                has_fallback: false,
            }
        }

        fn candidate(&self, symbol: &str) -> ThesisCandidate {
            ThesisCandidate {
                agent_id: self.id.clone(),
                symbol: symbol.to_string(),
                direction: Direction::Long,
                confidence: self.confidence,
                risk_score: self.risk,
                notional_hint: 1_000.0,
                produced_at: Utc::now(),
                source: CandidateSource::Live,
                forecast: self.forecast,
            }
        }
    }

    #[async_trait]
    impl Agent for MockAgent {
        fn id(&self) -> &str { &self.id }
        fn specialization(&self) -> &[Regime] { &[] }
        fn priority(&self) -> u8 { 50 }

        async fn query(&self, symbol: &str, _regime: RegimeLabel) -> Result<ThesisCandidate, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let r = match self.behavior {
                Behavior::Ok => Ok(self.candidate(symbol)),
                Behavior::Sleep(d) => {
                    sleep(d).await;
                    Ok(self.candidate(symbol))
                }
                Behavior::FailTransient(k) if n <= k => Err(AgentError::Status(503)),
                Behavior::FailTransient(_) => Ok(self.candidate(symbol)),
                Behavior::Decode => Err(AgentError::Decode("garbage".into())),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            r
        }

        fn fallback(&self, symbol: &str, _regime: RegimeLabel) -> Option<ThesisCandidate> {
            self.has_fallback.then(|| self.candidate(symbol))
        }
    }

    fn collector(tracker: Arc<RateBudgetTracker>) -> (Collector, mpsc::Sender<AgentRiskEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Collector::new(CollectorCfg::default(), tracker, rx), tx)
    }

    fn tracker() -> Arc<RateBudgetTracker> {
        Arc::new(RateBudgetTracker::new(1200, Duration::from_secs(60)))
    }

    fn add(c: &mut Collector, a: MockAgent) -> Arc<AtomicU32> {
        let calls = a.calls.clone();
        c.register(Arc::new(a), 10_000.0, 1.0);
        calls
    }

    #[tokio::test(start_paused = true)]
    async fn collect_is_idempotent_within_ttl() {
        let (mut c, _tx) = collector(tracker());
        let calls = add(&mut c, MockAgent::new("a", Behavior::Ok));

        let first = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source, CandidateSource::Live);

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second[0].source, CandidateSource::Cached);
        assert_eq!(second[0].direction, first[0].direction);
        assert_eq!(second[0].confidence, first[0].confidence);

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(third[0].source, CandidateSource::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_survives_bucket_boundary() {
        let (mut c, _tx) = collector(tracker());
        let calls = add(&mut c, MockAgent::new("a", Behavior::Ok));

        tokio::time::advance(Duration::from_millis(9_900)).await;
        c.collect("BTCUSDT", RegimeLabel::default()).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        let again = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(again[0].source, CandidateSource::Cached);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_agent_times_out_after_all_attempts() {
        let (mut c, _tx) = collector(tracker());
        let slow = add(&mut c, MockAgent::new("slow", Behavior::Sleep(Duration::from_secs(5))));
        let fast = add(&mut c, MockAgent::new("fast", Behavior::Ok));

        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].agent_id, "fast");
        assert_eq!(slow.load(Ordering::SeqCst), 3);
        assert_eq!(fast.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (mut c, _tx) = collector(tracker());
        let calls = add(&mut c, MockAgent::new("flaky", Behavior::FailTransient(2)));
        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_are_not_retried() {
        let (mut c, _tx) = collector(tracker());
        let calls = add(&mut c, MockAgent::new("broken", Behavior::Decode));
        assert!(c.collect("BTCUSDT", RegimeLabel::default()).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_discards_only_the_bad_agent() {
        let (mut c, _tx) = collector(tracker());
        let mut wild = MockAgent::new("wild", Behavior::Ok);
        wild.forecast = Some(Forecast { price: 130.0, lower: 129.0, upper: 131.0 });
        let mut wide = MockAgent::new("wide", Behavior::Ok);
        wide.forecast = Some(Forecast { price: 100.0, lower: 90.0, upper: 115.0 });
        let mut overconfident = MockAgent::new("over", Behavior::Ok);
        overconfident.confidence = 1.5;
        let mut sane = MockAgent::new("sane", Behavior::Ok);
        sane.forecast = Some(Forecast { price: 100.0, lower: 98.0, upper: 102.0 });
        for a in [wild, wide, overconfident, sane] {
            add(&mut c, a);
        }

        let (_htx, hrx) = tokio::sync::watch::channel({
            let mut h = crate::market::PriceHistory::new("BTCUSDT", 8);
            h.push(100.0, 0);
            h
        });
        let mut views = MarketViews::new();
        views.add_history("BTCUSDT", hrx);
        let mut c = c.with_views(views);

        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;
        let ids: Vec<&str> = out.iter().map(|t| t.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["sane"]);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_agents_make_no_calls_but_still_contribute() {
        let t = tracker();
        let (mut c, _tx) = collector(t.clone());
        let cached = add(&mut c, MockAgent::new("cached", Behavior::Ok));
        let mut fb = MockAgent::new("fb", Behavior::Ok);
        fb.has_fallback = true;
        // fb belum pernah live -> tidak punya cache
        let fb_calls = add(&mut c, fb);
        c.set_enabled("fb", false);
        c.collect("BTCUSDT", RegimeLabel::default()).await;
        c.set_enabled("fb", true);
        assert_eq!(cached.load(Ordering::SeqCst), 1);
        let remaining_before = t.remaining();

        c.set_plan(FallbackPlan {
            tier: BudgetTier::Constrained,
            throttled: vec!["cached".into(), "fb".into()],
            cache_only: false,
            poll_interval: Duration::from_secs(60),
        });
        // lewat TTL, masih dalam polling granularity
        tokio::time::advance(Duration::from_secs(30)).await;
        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;

        assert_eq!(cached.load(Ordering::SeqCst), 1);
        assert_eq!(fb_calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.remaining(), remaining_before);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source, CandidateSource::Cached);
        assert_eq!(out[1].source, CandidateSource::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn breached_agents_are_skipped_until_day_reset() {
        let (mut c, tx) = collector(tracker());
        let calls = add(&mut c, MockAgent::new("loser", Behavior::Ok));
        tx.send(AgentRiskEvent { agent_id: "loser".into(), daily_loss: 600.0, breached: true }).await.unwrap();
        assert!(c.collect("BTCUSDT", RegimeLabel::default()).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(c.agent_states()[0].daily_loss_breached);
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_registration_order() {
        let (mut c, _tx) = collector(tracker());
        for i in 0..8 {
            // agent awal paling lambat, selesai paling akhir
            let a = MockAgent::new(&format!("a{i}"), Behavior::Sleep(Duration::from_millis(800 - 100 * i)));
            c.register(Arc::new(a), 1_000.0, 1.0);
        }
        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;
        let ids: Vec<String> = out.iter().map(|t| t.agent_id.clone()).collect();
        assert_eq!(ids, (0..8).map(|i| format!("a{i}")).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_in_flight_counter_never_exceeds_max_parallel() {
        let (mut c, _tx) = collector(tracker());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let mut a = MockAgent::new(&format!("a{i}"), Behavior::Sleep(Duration::from_millis(100)));
            a.in_flight = in_flight.clone();
            a.peak = peak.clone();
            c.register(Arc::new(a), 1_000.0, 1.0);
        }
        let out = c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(out.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= CollectorCfg::default().max_parallel);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_calls_are_charged_to_rate_budget() {
        let t = tracker();
        let (mut c, _tx) = collector(t.clone());
        add(&mut c, MockAgent::new("a", Behavior::Ok));
        add(&mut c, MockAgent::new("b", Behavior::FailTransient(1)));
        c.collect("BTCUSDT", RegimeLabel::default()).await;
        assert_eq!(t.remaining(), 1200 - 3);
    }

    #[test]
    fn guard_rejects_non_finite_risk() {
        let cfg = CollectorCfg::default();
        let mut c = MockAgent::new("a", Behavior::Ok).candidate("X");
        c.risk_score = f64::NAN;
        assert!(validate(&c, "a", "X", Some(100.0), &cfg).is_err());
        c.risk_score = 0.3;
        assert!(validate(&c, "a", "X", Some(100.0), &cfg).is_ok());
        assert!(validate(&c, "b", "X", Some(100.0), &cfg).is_err());
    }
}
