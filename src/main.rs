// ===============================
// src/main.rs
// ===============================
/*
 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(agent|symbol)'

# aktivitas per agent & keputusan
curl -s localhost:9898/metrics | grep '^thesis_candidates_total'
curl -s localhost:9898/metrics | grep '^decisions_total'
curl -s localhost:9898/metrics | egrep '^(rate_budget_remaining|fallback_tier)'

*/
/*
=============================================================================
Project : thesis_fusion_bot — multi-agent thesis fusion trading engine in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Streams multi-symbol market data (mock/Binance), collects trading
          theses from pluggable agents, fuses them into one regime-aware
          decision, sizes it under portfolio risk limits, degrades gracefully
          when the exchange rate budget runs low, exposes Prometheus metrics,
          and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::sync::Arc;

use clap::Parser;
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use thesis_fusion_bot::{
    agents::{AgentContext, AgentRegistry, MarketViews},
    collector::Collector,
    config::{self, Cli, MarketMode},
    decision::{DecisionLoop, LoopParts},
    domain::{Event, MarketTick, PositionUpdate},
    execution::ExecutionSink,
    feed, market,
    market::PriceHistory,
    metrics, positions, recorder,
    rate_budget::RateBudgetTracker,
    risk::{self, AgentLimit, RiskManager},
    vpin::{self, VpinSnapshot},
};

fn mock_start_px(symbol: &str) -> f64 {
    match symbol {
        s if s.starts_with("BTC") => 60_000.0,
        s if s.starts_with("ETH") => 3_000.0,
        s if s.starts_with("BNB") => 550.0,
        _ => 100.0,
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = Cli::parse();
    let cfg = match config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let args = cfg.args.clone();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        feed_mode = args.feed_mode.as_str(),
        symbols = ?args.symbols,
        agents = ?cfg.agents.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
        tick_ms = args.tick_ms,
        exec_sink = match &args.exec_sink {
            config::ExecSinkMode::Log => "log",
            config::ExecSinkMode::Http { url, .. } => url.as_str(),
        },
        binance_ws = %args.binance_ws_url,
        "startup config"
    );
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
    for a in &cfg.agents {
        metrics::CONFIG_AGENT.with_label_values(&[&a.id]).set(a.priority as i64);
    }

    // ---- Buses ----
    let (md_tx, _md_rx) = broadcast::channel::<MarketTick>(4096);
    let (agent_risk_tx, agent_risk_rx) = mpsc::channel(256);
    let (pos_tx, pos_rx) = mpsc::channel::<PositionUpdate>(1024);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => (Some(rec_tx), Some(tokio::spawn(recorder::run(rec_rx, path)))),
        None => (None, None),
    };

    // ---- Market views + VPIN per symbol ----
    let mut views = MarketViews::new();
    for sym in &args.symbols {
        let (hist_tx, hist_rx) = watch::channel(PriceHistory::new(sym.clone(), args.history_len));
        tokio::spawn(market::run(sym.clone(), md_tx.subscribe(), hist_tx));
        views.add_history(sym, hist_rx);

        let init = VpinSnapshot { symbol: sym.clone(), ..VpinSnapshot::default() };
        let (vpin_tx, vpin_rx) = watch::channel(init);
        tokio::spawn(vpin::run(sym.clone(), md_tx.subscribe(), vpin_tx, cfg.vpin.clone()));
        views.add_vpin(sym, vpin_rx);
    }

    // ---- FEED (Market Data) ----
    for sym in args.symbols.iter().cloned() {
        let tx = md_tx.clone();
        match args.feed_mode {
            MarketMode::Mock => {
                let px = mock_start_px(&sym);
                tokio::spawn(feed::run_mock(tx, sym, px));
            }
            MarketMode::BinanceSandbox | MarketMode::BinanceMainnet => {
                tokio::spawn(feed::run_binance(tx, sym, args.binance_ws_url.clone()));
            }
        }
    }

    // ---- Agents ----
    let tracker = Arc::new(RateBudgetTracker::new(cfg.rate.capacity, cfg.rate.window));
    let http = reqwest::Client::new();
    let ctx = AgentContext {
        views: views.clone(),
        tracker: tracker.clone(),
        http: http.clone(),
        default_notional: cfg.fusion.default_notional,
        fast_window: cfg.regime.fast_window,
        slow_window: cfg.regime.slow_window,
    };
    let agents = match AgentRegistry::with_builtin().build(&cfg.agents, &ctx) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "agent registry");
            std::process::exit(2);
        }
    };

    // ---- Risk ----
    let limits: Vec<AgentLimit> = cfg
        .agents
        .iter()
        .map(|a| AgentLimit {
            agent_id: a.id.clone(),
            allocation_fraction: a.allocation_fraction,
            max_leverage: a.max_leverage,
        })
        .collect();
    let (risk, portfolio_rx) = match RiskManager::new(cfg.risk.clone(), &limits, agent_risk_tx) {
        Ok((r, rx)) => (Arc::new(r), rx),
        Err(e) => {
            error!(error = %e, "risk limits");
            std::process::exit(2);
        }
    };
    tokio::spawn(risk::run(risk.clone(), Duration::from_secs(30)));

    // ---- Paper positions (dry run only) ----
    if !args.paper_hold.is_zero() {
        tokio::spawn(positions::run(portfolio_rx, views.clone(), pos_tx, args.paper_hold, Duration::from_secs(1)));
    } else {
        // companion trader (mode live) belum ada di binary ini
        drop(pos_tx);
    }

    // ---- Collector ----
    let mut collector = Collector::new(cfg.collector.clone(), tracker.clone(), agent_risk_rx).with_views(views.clone());
    for (agent, spec) in agents.into_iter().zip(cfg.agents.iter()) {
        collector.register(agent, spec.allocation_fraction * cfg.risk.total_capital, spec.max_leverage);
    }

    // ---- Decision loop ----
    let mut dl = DecisionLoop::new(LoopParts {
        symbols: args.symbols.clone(),
        views,
        collector,
        tracker,
        risk,
        sink: ExecutionSink::from_mode(&args.exec_sink, http),
        positions_rx: pos_rx,
        fusion: cfg.fusion.clone(),
        fallback: cfg.fallback.clone(),
        regime: cfg.regime.clone(),
    });
    if let Some(tx) = rec_tx {
        let _ = tx.try_send(Event::Note { msg: format!("started symbols={:?}", args.symbols) });
        dl = dl.with_events(tx);
    }

    dl.run(Duration::from_millis(args.tick_ms.max(1)), args.max_ticks).await;
    // sender terakhir ikut di-drop bersama loop; tunggu flush recorder
    if let Some(h) = rec_task {
        let _ = h.await;
    }
    info!("shutdown");
}
