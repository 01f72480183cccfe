// ===============================
// src/execution.rs
// ===============================
//
// Execution sink: ExecutionRequest -> order-routing collaborator.
// - Log  : hanya tracing + metric (default / dry run)
// - Http : POST signed (HMAC-SHA256, hex) ke `{EXEC_ROUTER_URL}/orders`
//
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info};

use crate::config::ExecSinkMode;
use crate::domain::{Direction, ExecutionRequest};
use crate::metrics::EXEC_REQUESTS;

pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("flat direction is not executable")]
    FlatDirection,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("router answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, ExecutionError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| ExecutionError::Signing(e.to_string()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Query string yang ditandatangani; urutan field tetap supaya signature bisa diverifikasi.
pub fn order_query(req: &ExecutionRequest, ts_ms: i64) -> Result<String, ExecutionError> {
    let side = match req.direction {
        Direction::Long => "BUY",
        Direction::Short => "SELL",
        Direction::Flat => return Err(ExecutionError::FlatDirection),
    };
    let params = [
        ("symbol", req.symbol.to_ascii_uppercase()),
        ("side", side.to_string()),
        ("notional", format!("{:.2}", req.notional)),
        ("leverage", format!("{}", req.leverage)),
        ("agent", req.agent_id.clone()),
        ("clientOrderId", format!("tfb-{}", req.reservation_id)),
        ("timestamp", ts_ms.to_string()),
    ];
    Ok(params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&"))
}

#[derive(Clone, Debug)]
pub struct HttpSink {
    http: reqwest::Client,
    url: String,
    api_key: String,
    api_secret: String,
}

impl HttpSink {
    pub fn new(http: reqwest::Client, url: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    async fn send(&self, req: &ExecutionRequest) -> Result<(), ExecutionError> {
        let query = order_query(req, timestamp_ms())?;
        let sig = sign_query(&self.api_secret, &query)?;
        let url = format!("{}/orders?{}&signature={}", self.url, query, sig);

        let rsp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        if rsp.status().is_success() {
            return Ok(());
        }
        let status = rsp.status().as_u16();
        let body = rsp.text().await.unwrap_or_default();
        Err(ExecutionError::Rejected { status, body })
    }
}

#[derive(Clone, Debug)]
pub enum ExecutionSink {
    Log,
    Http(HttpSink),
}

impl ExecutionSink {
    pub fn from_mode(mode: &ExecSinkMode, http: reqwest::Client) -> Self {
        match mode {
            ExecSinkMode::Log => ExecutionSink::Log,
            ExecSinkMode::Http { url, api_key, api_secret } => {
                ExecutionSink::Http(HttpSink::new(http, url, api_key, api_secret))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionSink::Log => "log",
            ExecutionSink::Http(_) => "http",
        }
    }

    pub async fn submit(&self, req: &ExecutionRequest) -> Result<(), ExecutionError> {
        let res = match self {
            ExecutionSink::Log => {
                if req.direction == Direction::Flat {
                    Err(ExecutionError::FlatDirection)
                } else {
                    info!(
                        symbol = %req.symbol,
                        agent = %req.agent_id,
                        direction = req.direction.as_str(),
                        notional = req.notional,
                        leverage = req.leverage,
                        reservation = req.reservation_id,
                        "execution request"
                    );
                    Ok(())
                }
            }
            ExecutionSink::Http(sink) => sink.send(req).await,
        };
        match &res {
            Ok(()) => EXEC_REQUESTS.with_label_values(&["sent", self.name()]).inc(),
            Err(e) => {
                error!(symbol = %req.symbol, agent = %req.agent_id, error = %e, "execution failed");
                EXEC_REQUESTS.with_label_values(&["failed", self.name()]).inc();
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Method, Request, Response, Server};

    fn request(direction: Direction) -> ExecutionRequest {
        ExecutionRequest {
            reservation_id: 7,
            agent_id: "trend".into(),
            symbol: "btcusdt".into(),
            direction,
            notional: 1_250.5,
            leverage: 2.0,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn signature_is_hex_hmac_sha256() {
        // RFC 4231 test case 2
        let sig = sign_query("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(sig, "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn query_is_stable_and_flat_is_refused() {
        let q = order_query(&request(Direction::Short), 1_700_000_000_000).unwrap();
        assert_eq!(
            q,
            "symbol=BTCUSDT&side=SELL&notional=1250.50&leverage=2&agent=trend&clientOrderId=tfb-7&timestamp=1700000000000"
        );
        assert!(matches!(order_query(&request(Direction::Flat), 1), Err(ExecutionError::FlatDirection)));
    }

    #[tokio::test]
    async fn log_sink_accepts_directional_requests() {
        let sink = ExecutionSink::from_mode(&ExecSinkMode::Log, reqwest::Client::new());
        assert_eq!(sink.name(), "log");
        assert!(sink.submit(&request(Direction::Long)).await.is_ok());
        assert!(sink.submit(&request(Direction::Flat)).await.is_err());
    }

    async fn serve(status: u16, seen: Arc<Mutex<Vec<(String, String)>>>) -> SocketAddr {
        let make_svc = make_service_fn(move |_conn| {
            let seen = seen.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let seen = seen.clone();
                    async move {
                        assert_eq!(req.method(), Method::POST);
                        assert_eq!(req.uri().path(), "/orders");
                        let key = req
                            .headers()
                            .get(API_KEY_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let query = req.uri().query().unwrap_or_default().to_string();
                        seen.lock().unwrap().push((key, query));
                        Ok::<_, Infallible>(Response::builder().status(status).body(Body::from("nope")).unwrap())
                    }
                }))
            }
        });
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn http_sink_signs_the_query() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = serve(200, seen.clone()).await;
        let mode = ExecSinkMode::Http { url: format!("http://{addr}/"), api_key: "k1".into(), api_secret: "s3cret".into() };
        let sink = ExecutionSink::from_mode(&mode, reqwest::Client::new());
        sink.submit(&request(Direction::Long)).await.unwrap();

        let seen = seen.lock().unwrap();
        let (key, query) = &seen[0];
        assert_eq!(key, "k1");
        let (payload, sig) = query.rsplit_once("&signature=").unwrap();
        assert!(payload.starts_with("symbol=BTCUSDT&side=BUY&"));
        assert_eq!(sig, sign_query("s3cret", payload).unwrap());
    }

    #[tokio::test]
    async fn http_sink_surfaces_router_rejection() {
        let addr = serve(400, Arc::new(Mutex::new(Vec::new()))).await;
        let sink = ExecutionSink::Http(HttpSink::new(reqwest::Client::new(), &format!("http://{addr}"), "k", "s"));
        match sink.submit(&request(Direction::Short)).await {
            Err(ExecutionError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
