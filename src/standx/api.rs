//! Authenticated REST surface: the queries the engine and tools need, plus
//! signed placement/cancel for out-of-band use (the flatten tool, resync).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::auth::{AuthError, SigningIdentity};
use super::messages::{code_ok, parse_balance, parse_order, parse_position};
use super::transport::{HttpRequest, RetryPolicy, Transport, TransportError};
use super::types::{parse_f64_field, Balance, CancelOrderBody, Order, OrderRequest, Position};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("venue rejected request: code={code} {message}")]
    Rejected { code: i64, message: String },
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl ApiError {
    /// Clock skew / stale token on a signed call.
    pub fn is_signature_rejected(&self) -> bool {
        match self {
            ApiError::Transport(t) => t.is_auth_rejected(),
            ApiError::Rejected { code, .. } => *code == 401 || *code == 403,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolPrice {
    pub symbol: String,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub last_price: Option<f64>,
    pub mid_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub request_id: String,
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub rest_url: String,
    pub timeout: Duration,
    pub recv_window_ms: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://perps.standx.com".to_string(),
            timeout: Duration::from_secs(10),
            recv_window_ms: Some(5_000),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("STANDX_REST_URL") {
            cfg.rest_url = v;
        }
        if let Ok(v) = std::env::var("STANDX_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.timeout = Duration::from_secs(secs.max(1));
            }
        }
        if let Ok(v) = std::env::var("STANDX_RECV_WINDOW_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.recv_window_ms = (ms > 0).then_some(ms);
            }
        }
        cfg
    }
}

#[derive(Clone)]
pub struct StandxApi {
    transport: Transport,
    identity: Arc<SigningIdentity>,
    recv_window_ms: Option<u64>,
}

impl StandxApi {
    pub fn new(cfg: &ApiConfig, identity: Arc<SigningIdentity>) -> Result<Self, ApiError> {
        Ok(Self {
            transport: Transport::new(&cfg.rest_url, cfg.timeout, RetryPolicy::default())?,
            identity,
            recv_window_ms: cfg.recv_window_ms,
        })
    }

    fn authed(&self, req: HttpRequest) -> HttpRequest {
        req.header("Authorization", format!("Bearer {}", self.identity.token()))
    }

    // ─── Queries ───

    /// A fresh account has no balance record; the venue answers 404 with
    /// "user balance not found", which is a zero balance.
    pub async fn query_balance(&self) -> Result<Balance, ApiError> {
        match self.transport.call(&self.authed(HttpRequest::get("/api/query_balance"))).await {
            Ok(v) => parse_balance(unwrap_data(&v))
                .ok_or_else(|| ApiError::Unexpected(format!("balance: {v}"))),
            Err(TransportError::Status { status: 404, body })
                if body.to_ascii_lowercase().contains("user balance not found") =>
            {
                info!("💰 No balance record yet, treating as zero");
                Ok(Balance::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn query_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ApiError> {
        let mut req = HttpRequest::get("/api/query_positions");
        if let Some(s) = symbol {
            req = req.query("symbol", s);
        }
        let v = self.transport.call(&self.authed(req)).await?;
        Ok(list_items(&v).filter_map(parse_position).collect())
    }

    pub async fn query_open_orders(&self, symbol: &str) -> Result<Vec<Order>, ApiError> {
        let req = HttpRequest::get("/api/query_open_orders").query("symbol", symbol);
        let v = self.transport.call(&self.authed(req)).await?;
        Ok(list_items(&v)
            .filter_map(parse_order)
            .filter(|o| o.status.is_live())
            .collect())
    }

    pub async fn query_order(&self, order_id: Option<&str>, cl_ord_id: Option<&str>) -> Result<Option<Order>, ApiError> {
        let mut req = HttpRequest::get("/api/query_order");
        if let Some(id) = order_id {
            req = req.query("order_id", id);
        }
        if let Some(id) = cl_ord_id {
            req = req.query("cl_ord_id", id);
        }
        match self.transport.call(&self.authed(req)).await {
            Ok(v) => Ok(parse_order(unwrap_data(&v))),
            Err(TransportError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn query_symbol_price(&self, symbol: &str) -> Result<SymbolPrice, ApiError> {
        let req = HttpRequest::get("/api/query_symbol_price").query("symbol", symbol);
        let v = self.transport.call(&self.authed(req)).await?;
        let d = unwrap_data(&v);
        Ok(SymbolPrice {
            symbol: symbol.to_string(),
            mark_price: parse_f64_field(d, "mark_price"),
            index_price: parse_f64_field(d, "index_price"),
            last_price: parse_f64_field(d, "last_price"),
            mid_price: parse_f64_field(d, "mid_price"),
        })
    }

    // ─── Signed commands ───

    pub async fn new_order(&self, req: &OrderRequest, cl_ord_id: &str) -> Result<OrderAck, ApiError> {
        let signed = self
            .identity
            .sign("POST", "/api/new_order", &req.body(cl_ord_id), self.recv_window_ms)?;
        let v = self
            .transport
            .call(&signed.into_http(self.identity.token()))
            .await?;
        ack(&v)
    }

    pub async fn cancel_order(&self, order: &Order) -> Result<OrderAck, ApiError> {
        let signed = self.identity.sign(
            "POST",
            "/api/cancel_order",
            &CancelOrderBody::for_order(order),
            self.recv_window_ms,
        )?;
        let v = self
            .transport
            .call(&signed.into_http(self.identity.token()))
            .await?;
        ack(&v)
    }

    /// Cancel every open order on `symbol`, one by one. Returns how many
    /// cancels the venue accepted.
    pub async fn cancel_all(&self, symbol: &str) -> Result<usize, ApiError> {
        let orders = self.query_open_orders(symbol).await?;
        let mut accepted = 0;
        for order in &orders {
            match self.cancel_order(order).await {
                Ok(_) => accepted += 1,
                Err(e) => warn!(
                    "❌ cancel {} failed: {}",
                    order.order_id.as_deref().unwrap_or("?"),
                    e
                ),
            }
        }
        Ok(accepted)
    }
}

fn ack(v: &Value) -> Result<OrderAck, ApiError> {
    let code = v.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    let message = v
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    if !code_ok(code) {
        return Err(ApiError::Rejected { code, message });
    }
    Ok(OrderAck {
        request_id: v
            .get("request_id")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
        code,
        message,
    })
}

/// Responses come either bare or wrapped in `data` / `result`.
fn unwrap_data(v: &Value) -> &Value {
    v.get("data").or_else(|| v.get("result")).unwrap_or(v)
}

fn list_items(v: &Value) -> impl Iterator<Item = &Value> {
    let inner = unwrap_data(v);
    let items: &[Value] = match inner.as_array() {
        Some(arr) => arr,
        None if inner.is_object() => std::slice::from_ref(inner),
        None => &[],
    };
    items.iter()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers each request with the canned `(status, body)` for its path.
    pub async fn rest_stub(
        identity: Arc<SigningIdentity>,
        routes: Vec<(&'static str, u16, &'static str)>,
    ) -> StandxApi {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let header_end = loop {
                        if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break i + 4;
                        }
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let body_len = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    // Drain the body so closing the socket does not reset it.
                    while buf.len() < header_end + body_len {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let target = head.split_whitespace().nth(1).unwrap_or("/");
                    let path = target.split('?').next().unwrap_or("/");
                    let (status, body) = routes
                        .iter()
                        .find(|(p, _, _)| *p == path)
                        .map(|(_, s, b)| (*s, *b))
                        .unwrap_or((404, "{}"));
                    let resp = format!(
                        "HTTP/1.1 {status} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        let cfg = ApiConfig {
            rest_url: format!("http://{addr}"),
            timeout: Duration::from_secs(2),
            ..ApiConfig::default()
        };
        StandxApi::new(&cfg, identity).unwrap()
    }
}
