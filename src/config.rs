// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : thesis_fusion_bot — multi-agent decision core for crypto trading
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Fans out to strategy agents, fuses their theses into one decision,
          computes VPIN order-flow imbalance, enforces portfolio risk limits,
          degrades to cached/fallback theses under exchange rate limits,
          exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::domain::Regime;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("env file {0}: {1}")]
    EnvFile(PathBuf, String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("unknown agent kind {0:?}")]
    UnknownAgent(String),
    #[error("no agents configured")]
    NoAgents,
    #[error("agent allocations sum to {0:.3} of total capital (max 1.0)")]
    AllocationOverflow(f64),
}

/// Override CLI; sisanya dari ENV / .env
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "thesis_fusion_bot", about = "multi-agent thesis fusion decision core")]
pub struct Cli {
    /// Path .env alternatif
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// SYMBOLS override, comma separated
    #[arg(long)]
    pub symbols: Option<String>,
    /// Decision loop cadence (ms)
    #[arg(long)]
    pub tick_ms: Option<u64>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Stop setelah N decision ticks (default: jalan terus)
    #[arg(long)]
    pub max_ticks: Option<u64>,
}

/// Mode sumber market data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl MarketMode {
    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"             => MarketMode::Mock,
            "binance_sandbox"  => MarketMode::BinanceSandbox,
            "binance_mainnet"  => MarketMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock           => "mock",
            MarketMode::BinanceSandbox => "binance_sandbox",
            MarketMode::BinanceMainnet => "binance_mainnet",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            MarketMode::BinanceSandbox  => "wss://testnet.binance.vision/ws",
            MarketMode::BinanceMainnet  => "wss://stream.binance.com:9443/ws",
        }
    }
}

// ===== Agents =====
#[derive(Clone, Debug, PartialEq)]
pub enum AgentKind {
    OrderFlow,
    Trend,
    MeanReversion,
    Breakout,
    Remote { base_url: String },
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::OrderFlow     => "order_flow",
            AgentKind::Trend         => "trend",
            AgentKind::MeanReversion => "mean_reversion",
            AgentKind::Breakout      => "breakout",
            AgentKind::Remote { .. } => "remote",
        }
    }

    /// Prioritas default: makin tinggi = butuh data paling segar (di-throttle duluan).
    pub fn default_priority(&self) -> u8 {
        match self {
            AgentKind::OrderFlow     => 100,
            AgentKind::Breakout      => 60,
            AgentKind::Trend         => 40,
            AgentKind::MeanReversion => 40,
            AgentKind::Remote { .. } => 20,
        }
    }

    pub fn default_specialization(&self) -> Vec<Regime> {
        match self {
            AgentKind::OrderFlow     => vec![Regime::BullVolatile, Regime::BearVolatile],
            AgentKind::Trend         => vec![Regime::BullTrending, Regime::BearTrending],
            AgentKind::MeanReversion => vec![Regime::RangeBound],
            AgentKind::Breakout      => vec![Regime::BullVolatile, Regime::BearVolatile, Regime::RangeBound],
            AgentKind::Remote { .. } => Vec::new(), // generalist
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentSpec {
    pub id: String,
    pub kind: AgentKind,
    pub allocation_fraction: f64,
    pub max_leverage: f64,
    pub priority: u8,
    pub specialization: Vec<Regime>,
}

impl AgentSpec {
    /// Token: `order_flow` | `trend` | `mean_reversion` | `breakout` | `remote:<id>@<url>`
    pub fn parse(token: &str) -> Result<Self, ConfigError> {
        let t = token.trim();
        let (id, kind) = if let Some(rest) = t.strip_prefix("remote:") {
            let (id, url) = rest
                .split_once('@')
                .ok_or_else(|| ConfigError::UnknownAgent(t.to_string()))?;
            (id.trim().to_string(), AgentKind::Remote { base_url: url.trim().trim_end_matches('/').to_string() })
        } else {
            let kind = match t.to_ascii_lowercase().as_str() {
                "order_flow" | "orderflow" | "vpin" => AgentKind::OrderFlow,
                "trend" | "ma_crossover" | "ma"     => AgentKind::Trend,
                "mean_reversion" | "mr"             => AgentKind::MeanReversion,
                "breakout" | "vol_breakout" | "vb"  => AgentKind::Breakout,
                _ => return Err(ConfigError::UnknownAgent(t.to_string())),
            };
            (kind.as_str().to_string(), kind)
        };
        Ok(Self {
            priority: kind.default_priority(),
            specialization: kind.default_specialization(),
            id,
            kind,
            allocation_fraction: 0.0,
            max_leverage: 1.0,
        })
    }
}

// ===== Per-component settings =====
#[derive(Clone, Debug)]
pub struct CollectorCfg {
    pub max_parallel: usize,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub retry_base: Duration,
    pub max_attempts: u32,
    pub max_forecast_deviation: f64,
    pub max_interval_width: f64,
}

impl Default for CollectorCfg {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(10),
            retry_base: Duration::from_millis(500),
            max_attempts: 3,
            max_forecast_deviation: 0.20,
            max_interval_width: 0.10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FusionCfg {
    pub risk_threshold: f64,
    pub min_confidence: f64,
    pub tie_epsilon: f64,
    pub mismatch_affinity: f64,
    pub win_rate_window: usize,
    pub default_notional: f64,
}

impl Default for FusionCfg {
    fn default() -> Self {
        Self {
            risk_threshold: 0.7,
            min_confidence: 0.1,
            tie_epsilon: 1e-6,
            mismatch_affinity: 0.5,
            win_rate_window: 50,
            default_notional: 1_000.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RiskLimits {
    pub total_capital: f64,
    pub max_leverage: f64,
    pub max_drawdown: f64,
    pub max_position_fraction: f64,
    pub daily_loss_limit_fraction: f64,
    pub manual_halt_clear: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            total_capital: 100_000.0,
            max_leverage: 3.0,
            max_drawdown: 0.15,
            max_position_fraction: 0.20,
            daily_loss_limit_fraction: 0.05,
            manual_halt_clear: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FallbackCfg {
    pub constrained_fraction: f64,
    pub normal_poll: Duration,
    pub degraded_poll: Duration,
}

impl Default for FallbackCfg {
    fn default() -> Self {
        Self {
            constrained_fraction: 0.25,
            normal_poll: Duration::from_secs(60),
            degraded_poll: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateCfg {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateCfg {
    fn default() -> Self { Self { capacity: 1200, window: Duration::from_secs(60) } }
}

#[derive(Clone, Debug)]
pub struct VpinCfg {
    pub window: usize,
    pub min_batch: usize,
    pub batch_size: usize,
    pub flush_ms: u64,
}

impl Default for VpinCfg {
    fn default() -> Self { Self { window: 200, min_batch: 10, batch_size: 25, flush_ms: 1_000 } }
}

#[derive(Clone, Debug)]
pub struct RegimeCfg {
    pub trend_threshold: f64,
    pub vol_threshold: f64,
    pub every_ticks: u64,
    pub fast_window: usize,
    pub slow_window: usize,
}

impl Default for RegimeCfg {
    fn default() -> Self {
        Self { trend_threshold: 0.002, vol_threshold: 0.004, every_ticks: 5, fast_window: 16, slow_window: 64 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecSinkMode {
    Log,
    Http { url: String, api_key: String, api_secret: String },
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,
    pub tick_ms: u64,
    pub max_ticks: Option<u64>,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub feed_mode: MarketMode,
    pub binance_ws_url: String,
    pub history_len: usize,
    pub exec_sink: ExecSinkMode,
    /// Dry run: posisi ditutup otomatis setelah hold ini (0 = nonaktif).
    pub paper_hold: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub args: Args,
    pub agents: Vec<AgentSpec>,
    pub collector: CollectorCfg,
    pub fusion: FusionCfg,
    pub risk: RiskLimits,
    pub fallback: FallbackCfg,
    pub rate: RateCfg,
    pub vpin: VpinCfg,
    pub regime: RegimeCfg,
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
        _ => Ok(default),
    }
}

fn env_ms(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

pub fn parse_symbols(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

/// `AGENTS=order_flow,trend,remote:alpha@http://host:8080`
pub fn parse_agents(list: &str) -> Result<Vec<AgentSpec>, ConfigError> {
    let mut out: Vec<AgentSpec> = Vec::new();
    for tok in list.split(',').filter(|t| !t.trim().is_empty()) {
        let spec = AgentSpec::parse(tok)?;
        if out.iter().any(|a| a.id == spec.id) {
            continue; // dedup by id
        }
        out.push(spec);
    }
    if out.is_empty() {
        return Err(ConfigError::NoAgents);
    }
    Ok(out)
}

/// `AGENT_ALLOCATIONS=order_flow:0.2,trend:0.3`; agent tanpa entry dapat sisa dibagi rata.
/// Default total alokasi 0.9 dari capital.
pub fn apply_allocations(agents: &mut [AgentSpec], spec: Option<&str>) -> Result<(), ConfigError> {
    let mut explicit = 0.0;
    let mut assigned = vec![false; agents.len()];
    if let Some(s) = spec {
        for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (id, frac) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::Invalid { key: "AGENT_ALLOCATIONS", value: pair.to_string() })?;
            let frac: f64 = frac
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "AGENT_ALLOCATIONS", value: pair.to_string() })?;
            if !(0.0..=1.0).contains(&frac) {
                return Err(ConfigError::Invalid { key: "AGENT_ALLOCATIONS", value: pair.to_string() });
            }
            if let Some(i) = agents.iter().position(|a| a.id == id.trim()) {
                agents[i].allocation_fraction = frac;
                assigned[i] = true;
                explicit += frac;
            }
        }
    }
    let rest = assigned.iter().filter(|a| !**a).count();
    if rest > 0 {
        let share = ((0.9 - explicit).max(0.0)) / rest as f64;
        for (a, done) in agents.iter_mut().zip(assigned.iter()) {
            if !done {
                a.allocation_fraction = share;
            }
        }
    }
    let total: f64 = agents.iter().map(|a| a.allocation_fraction).sum();
    if total > 1.0 + 1e-9 {
        return Err(ConfigError::AllocationOverflow(total));
    }
    Ok(())
}

pub fn load(cli: &Cli) -> Result<Config, ConfigError> {
    // Pastikan .env dibaca (agar AGENTS, SYMBOLS, dll ter-load)
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile(path.clone(), e.to_string()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // ===== Basic =====
    let symbols = cli
        .symbols
        .clone()
        .or_else(|| env::var("SYMBOLS").ok())
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

    let feed_mode = MarketMode::from_env("FEED_MODE", MarketMode::Mock);
    let binance_ws_url = env::var("BINANCE_WS_URL").unwrap_or_else(|_| feed_mode.default_ws_url().to_string());

    let exec_sink = match env::var("EXEC_ROUTER_URL") {
        Ok(url) if !url.trim().is_empty() => ExecSinkMode::Http {
            url: url.trim().trim_end_matches('/').to_string(),
            api_key: env::var("EXEC_ROUTER_KEY").unwrap_or_default(),
            api_secret: env::var("EXEC_ROUTER_SECRET").unwrap_or_default(),
        },
        _ => ExecSinkMode::Log,
    };

    let args = Args {
        symbols,
        tick_ms: match cli.tick_ms { Some(v) => v, None => env_parse("TICK_MS", 3_000)? },
        max_ticks: match cli.max_ticks { Some(v) => Some(v), None => env::var("MAX_TICKS").ok().and_then(|s| s.parse().ok()) },
        record_file: env::var("RECORD_FILE").ok(),
        metrics_port: match cli.metrics_port { Some(p) => p, None => env_parse("METRICS_PORT", 9898)? },
        feed_mode,
        binance_ws_url,
        history_len: env_parse("HISTORY_LEN", 256)?,
        paper_hold: match exec_sink {
            ExecSinkMode::Log => env_ms("PAPER_HOLD_MS", Duration::from_secs(30))?,
            ExecSinkMode::Http { .. } => Duration::ZERO,
        },
        exec_sink,
    };

    // ===== Agents =====
    //   AGENTS=order_flow,trend,mean_reversion,breakout
    //   AGENT_ALLOCATIONS=order_flow:0.2,trend:0.3
    //   AGENT_LEVERAGE=2
    let agents_env = env::var("AGENTS").unwrap_or_else(|_| "order_flow,trend,mean_reversion,breakout".to_string());
    let mut agents = parse_agents(&agents_env)?;
    apply_allocations(&mut agents, env::var("AGENT_ALLOCATIONS").ok().as_deref())?;
    let agent_leverage: f64 = env_parse("AGENT_LEVERAGE", 1.0)?;
    for a in agents.iter_mut() {
        a.max_leverage = agent_leverage;
    }

    let d = CollectorCfg::default();
    let collector = CollectorCfg {
        max_parallel: env_parse("COLLECT_MAX_PARALLEL", d.max_parallel)?.max(1),
        timeout: env_ms("AGENT_TIMEOUT_MS", d.timeout)?,
        cache_ttl: env_ms("AGENT_CACHE_TTL_MS", d.cache_ttl)?,
        retry_base: env_ms("AGENT_RETRY_BASE_MS", d.retry_base)?,
        max_attempts: env_parse("AGENT_MAX_ATTEMPTS", d.max_attempts)?.max(1),
        max_forecast_deviation: env_parse("GUARD_MAX_DEVIATION", d.max_forecast_deviation)?,
        max_interval_width: env_parse("GUARD_MAX_INTERVAL_WIDTH", d.max_interval_width)?,
    };

    let d = FusionCfg::default();
    let fusion = FusionCfg {
        risk_threshold: env_parse("RISK_THRESHOLD", d.risk_threshold)?,
        min_confidence: env_parse("MIN_CONFIDENCE", d.min_confidence)?,
        tie_epsilon: env_parse("TIE_EPSILON", d.tie_epsilon)?,
        mismatch_affinity: env_parse("REGIME_MISMATCH_AFFINITY", d.mismatch_affinity)?.clamp(0.5, 1.0),
        win_rate_window: env_parse("WIN_RATE_WINDOW", d.win_rate_window)?.max(1),
        default_notional: env_parse("DEFAULT_NOTIONAL", d.default_notional)?,
    };

    let d = RiskLimits::default();
    let risk = RiskLimits {
        total_capital: env_parse("TOTAL_CAPITAL", d.total_capital)?,
        max_leverage: env_parse("MAX_LEVERAGE", d.max_leverage)?,
        max_drawdown: env_parse("MAX_DRAWDOWN", d.max_drawdown)?,
        max_position_fraction: env_parse("MAX_POSITION_FRACTION", d.max_position_fraction)?,
        daily_loss_limit_fraction: env_parse("DAILY_LOSS_LIMIT_FRACTION", d.daily_loss_limit_fraction)?,
        manual_halt_clear: env_parse("MANUAL_HALT_CLEAR", d.manual_halt_clear)?,
    };

    let d = FallbackCfg::default();
    let fallback = FallbackCfg {
        constrained_fraction: env_parse("BUDGET_CONSTRAINED_FRACTION", d.constrained_fraction)?,
        normal_poll: env_ms("POLL_NORMAL_MS", d.normal_poll)?,
        degraded_poll: env_ms("POLL_DEGRADED_MS", d.degraded_poll)?,
    };

    let d = RateCfg::default();
    let rate = RateCfg {
        capacity: env_parse("RATE_CAPACITY", d.capacity)?,
        window: env_ms("RATE_WINDOW_MS", d.window)?,
    };

    let d = VpinCfg::default();
    let vpin = VpinCfg {
        window: env_parse("VPIN_WINDOW", d.window)?.max(1),
        min_batch: env_parse("VPIN_MIN_BATCH", d.min_batch)?,
        batch_size: env_parse("VPIN_BATCH_SIZE", d.batch_size)?.max(1),
        flush_ms: env_parse("VPIN_FLUSH_MS", d.flush_ms)?,
    };

    let d = RegimeCfg::default();
    let regime = RegimeCfg {
        trend_threshold: env_parse("REGIME_TREND_THRESHOLD", d.trend_threshold)?,
        vol_threshold: env_parse("REGIME_VOL_THRESHOLD", d.vol_threshold)?,
        every_ticks: env_parse("REGIME_EVERY_TICKS", d.every_ticks)?,
        fast_window: env_parse("REGIME_FAST_WINDOW", d.fast_window)?,
        slow_window: env_parse("REGIME_SLOW_WINDOW", d.slow_window)?,
    };

    Ok(Config { args, agents, collector, fusion, risk, fallback, rate, vpin, regime })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtin_and_remote_agents() {
        let agents = parse_agents("order_flow, trend ,remote:alpha@http://10.0.0.5:8080/,trend").unwrap();
        assert_eq!(agents.len(), 3);
        assert_eq!(agents[0].kind, AgentKind::OrderFlow);
        assert_eq!(agents[0].priority, 100);
        assert_eq!(agents[2].id, "alpha");
        assert_eq!(agents[2].kind, AgentKind::Remote { base_url: "http://10.0.0.5:8080".into() });
    }

    #[test]
    fn rejects_unknown_agent() {
        assert!(matches!(parse_agents("order_flow,astrology"), Err(ConfigError::UnknownAgent(_))));
        assert!(matches!(parse_agents(" , "), Err(ConfigError::NoAgents)));
    }

    #[test]
    fn allocations_split_remainder_evenly() {
        let mut agents = parse_agents("order_flow,trend,breakout").unwrap();
        apply_allocations(&mut agents, Some("order_flow:0.3")).unwrap();
        assert!((agents[0].allocation_fraction - 0.3).abs() < 1e-12);
        assert!((agents[1].allocation_fraction - 0.3).abs() < 1e-12);
        assert!((agents[2].allocation_fraction - 0.3).abs() < 1e-12);
    }

    #[test]
    fn allocations_over_capital_are_rejected() {
        let mut agents = parse_agents("order_flow,trend").unwrap();
        let r = apply_allocations(&mut agents, Some("order_flow:0.7,trend:0.6"));
        assert!(matches!(r, Err(ConfigError::AllocationOverflow(_))));
    }

    #[test]
    fn symbols_are_normalized() {
        assert_eq!(parse_symbols(" btcusdt,,ethusdt "), vec!["BTCUSDT", "ETHUSDT"]);
    }
}
