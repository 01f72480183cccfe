// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters (trade stream, dibaca VPIN engine + market view):
// - run_mock    : random-walk trade generator (~100 trades/s per symbol)
// - run_binance : Binance WS `<symbol>@aggTrade` (Sandbox & Mainnet)
//                 WS base URL dari config
//
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::MarketTick;

/// Binance aggTrade payload (field yang dipakai saja).
/// {"e":"aggTrade","E":1672515782136,"s":"BNBBTC","a":12345,"p":"0.001","q":"100","T":1672515782136,"m":true}
#[derive(Debug, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub qty: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

impl AggTrade {
    pub fn to_tick(&self) -> Option<MarketTick> {
        let price = self.price.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0)?;
        let volume = self.qty.parse::<f64>().ok().filter(|q| q.is_finite() && *q >= 0.0)?;
        Some(MarketTick { ts_ms: self.trade_time, symbol: self.symbol.to_ascii_uppercase(), price, volume })
    }
}

pub fn parse_agg_trade(txt: &str) -> Option<MarketTick> {
    serde_json::from_str::<AggTrade>(txt).ok()?.to_tick()
}

/// Random-walk trades; drift dan volatilitas kecil supaya regime berganti pelan.
pub async fn run_mock(md_tx: broadcast::Sender<MarketTick>, symbol: String, start_px: f64) {
    let mut px = start_px.max(1.0);
    info!(%symbol, start_px = px, "mock feed started");
    loop {
        // jangan simpan ThreadRng melewati .await
        let (ret, volume) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-0.0008..=0.0008), rng.gen_range(0.01..5.0))
        };
        px = (px * (1.0 + ret)).max(0.01);
        let tick = MarketTick { ts_ms: chrono::Utc::now().timestamp_millis(), symbol: symbol.clone(), price: px, volume };
        if md_tx.send(tick).is_err() {
            debug!(%symbol, "no market data subscribers");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Adapter ke Binance WS (read-only) untuk trade stream `aggTrade`.
///
/// - `ws_base`:
///     * Sandbox: wss://testnet.binance.vision/ws
///     * Mainnet: wss://stream.binance.com:9443/ws
/// - topic di-lowercase; symbol di tick tetap uppercase.
pub async fn run_binance(md_tx: broadcast::Sender<MarketTick>, symbol: String, ws_base: String) {
    let topic = format!("{}@aggTrade", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);

    if let Err(e) = Url::parse(&ws_url) {
        error!(?e, %ws_url, "bad ws url");
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, "connecting binance aggTrade");
        match connect_async(ws_url.as_str()).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to aggTrade");
                attempt = 0;

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_agg_trade(&txt) {
                                Some(tick) => {
                                    let _ = md_tx.send(tick);
                                }
                                None => debug!(%txt, "unparsed ws frame"),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                info!(%symbol, "aggTrade disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter: 0.5s..32s
        attempt = attempt.saturating_add(1);
        let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}
