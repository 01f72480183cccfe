// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("market_ticks_total", "market data trades").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("market_ticks_total_by_symbol", "trades per symbol"), &["symbol"]).unwrap()
});

pub static VPIN: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("vpin_probability", "order-flow imbalance probability"), &["symbol"]).unwrap()
});

pub static REGIME: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("market_regime", "1 for the active regime label (labels: symbol, regime)"),
        &["symbol", "regime"],
    )
    .unwrap()
});

// -------- Collector --------
pub static DECISION_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("decision_ticks_total", "decision loop ticks").unwrap());

pub static CANDIDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("thesis_candidates_total", "candidates collected (labels: agent, source)"),
        &["agent", "source"],
    )
    .unwrap()
});

pub static AGENT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("agent_failures_total", "agent query failures (labels: agent, kind)"),
        &["agent", "kind"],
    )
    .unwrap()
});

pub static COLLECT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("collect_latency_ms", "fan-out latency per tick (ms)")
            .buckets(vec![5.0, 25.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]),
    )
    .unwrap()
});

// -------- Fusion / risk --------
pub static FUSION_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fusion_rejects_total", "candidates rejected by fusion"), &["reason"]).unwrap()
});

pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("consensus_decisions_total", "consensus decisions (labels: symbol, direction)"),
        &["symbol", "direction"],
    )
    .unwrap()
});

pub static NO_ACTION: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("consensus_no_action_total", "ticks without a decision").unwrap());

pub static RISK_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("risk_rejects_total", "authorizations rejected"), &["reason"]).unwrap()
});

pub static EXPOSURE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_exposure", "total reserved exposure").unwrap());

pub static DRAWDOWN: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_drawdown", "current drawdown fraction").unwrap());

pub static HALTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("risk_halted", "1 while the emergency halt is latched").unwrap());

// -------- Paper positions (dry run) --------
pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("paper_pnl_realized", "realized PnL of simulated positions").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("paper_pnl_unrealized", "mark-to-market PnL of open simulated positions").unwrap());

// -------- Degraded mode --------
pub static RATE_BUDGET_REMAINING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("rate_budget_remaining", "exchange calls left in window").unwrap());

pub static FALLBACK_TIER: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("fallback_tier", "0 = ample, 1 = constrained, 2 = exhausted").unwrap()
});

pub static THROTTLED_AGENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("throttled_agents", "agents skipped by fallback").unwrap());

// -------- Execution --------
pub static EXEC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("execution_requests_total", "execution requests (labels: status, sink)"),
        &["status", "sink"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_AGENT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_agent", "registered agents (value = priority)"), &["agent"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbols"), &["symbol"]).unwrap()
});

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TICKS.clone()),
        Box::new(TICKS_BY_SYMBOL.clone()),
        Box::new(VPIN.clone()),
        Box::new(REGIME.clone()),
        Box::new(DECISION_TICKS.clone()),
        Box::new(CANDIDATES.clone()),
        Box::new(AGENT_FAILURES.clone()),
        Box::new(COLLECT_LATENCY.clone()),
        Box::new(FUSION_REJECTS.clone()),
        Box::new(DECISIONS.clone()),
        Box::new(NO_ACTION.clone()),
        Box::new(RISK_REJECTS.clone()),
        Box::new(EXPOSURE.clone()),
        Box::new(DRAWDOWN.clone()),
        Box::new(HALTED.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(PNL_UNREALIZED.clone()),
        Box::new(RATE_BUDGET_REMAINING.clone()),
        Box::new(FALLBACK_TIER.clone()),
        Box::new(THROTTLED_AGENTS.clone()),
        Box::new(EXEC_REQUESTS.clone()),
        Box::new(CONFIG_AGENT.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        // double init (tests) -> AlreadyReg, aman diabaikan
        let _ = REGISTRY.register(c);
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let body = encode_metrics();
    let rsp = Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("# encode error\n")));
    Ok(rsp)
}

/// Serve `/` dan `/metrics` (semua path jawab sama).
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}
