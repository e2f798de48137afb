//! HTTP transport — one reqwest client, a fixed per-request timeout and a
//! retry policy object that decides which failures are worth another attempt.
//!
//! Only failures where the request provably never reached the venue are
//! retried (connect failure, connection reset). Everything else comes back
//! to the caller as a typed [`TransportError`] on the first occurrence.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established (includes connect timeouts and
    /// proxy CONNECT failures).
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Request was sent but no response arrived in time. Not retried: the
    /// venue may already have acted on it.
    #[error("request timed out")]
    Timeout,

    /// 401/403. Usually a clock-skewed timestamp or a stale token.
    #[error("authorization rejected (HTTP {status}): {body}")]
    AuthRejected { status: u16, body: String },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("request error: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_) | TransportError::ConnectionReset(_)
        )
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, TransportError::AuthRejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::AuthRejected { status, .. } | TransportError::Status { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if is_connection_reset(&err) {
            TransportError::ConnectionReset(err.to_string())
        } else if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        source = inner.source();
    }
    false
}

// ─────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    retryable: fn(&TransportError) -> bool,
}

impl Default for RetryPolicy {
    /// 3 attempts, fixed 1s apart, network-level failures only.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retryable: TransportError::is_retryable,
        }
    }

    /// Single attempt.
    pub fn never() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_predicate(mut self, retryable: fn(&TransportError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn should_retry(&self, err: &TransportError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retryable)(err)
    }

    /// Drive `op` until it succeeds, fails terminally, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if self.should_retry(&e, attempt) => {
                    warn!(
                        "🔁 {} failed (attempt {}/{}): {} — retrying in {:?}",
                        label, attempt, self.max_attempts, e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// Already-encoded JSON body. Signed requests must send exactly the bytes
    /// that were signed, so the body is never re-serialized here.
    pub fn body(mut self, json: String) -> Self {
        self.body = Some(json);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(base_url: &str, timeout: Duration, policy: RetryPolicy) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| TransportError::Request(format!("invalid base url {base_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::Request(format!(
                "base url {base_url:?} must be http(s)"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn call(&self, req: &HttpRequest) -> Result<Value, TransportError> {
        let label = format!("{} {}", req.method, req.path);
        self.policy
            .run(&label, |attempt| self.send_once(req, attempt))
            .await
    }

    pub async fn call_json<T: DeserializeOwned>(&self, req: &HttpRequest) -> Result<T, TransportError> {
        let value = self.call(req).await?;
        serde_json::from_value(value).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn send_once(&self, req: &HttpRequest, attempt: u32) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, req.path);
        debug!(%url, method = %req.method, attempt, "HTTP request");

        let mut builder = self.client.request(req.method.clone(), &url);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &req.body {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::AuthRejected {
                status: status.as_u16(),
                body: text,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::ConnectionReset("rst".into()).is_retryable());
        assert!(!TransportError::Timeout.is_retryable());
        assert!(!TransportError::Status { status: 502, body: String::new() }.is_retryable());
        assert!(!TransportError::AuthRejected { status: 401, body: String::new() }.is_retryable());
        assert!(!TransportError::Decode("x".into()).is_retryable());
    }

    #[test]
    fn base_url_must_be_http() {
        let t = Duration::from_secs(1);
        assert!(Transport::new("not a url", t, quick()).is_err());
        assert!(Transport::new("wss://perps.standx.com", t, quick()).is_err());
        let ok = Transport::new("https://perps.standx.com/", t, quick()).unwrap();
        assert_eq!(ok.base_url(), "https://perps.standx.com");
    }

    #[test]
    fn default_policy_is_three_attempts_one_second_apart() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.delay, Duration::from_secs(1));
        let err = TransportError::Connect("x".into());
        assert!(p.should_retry(&err, 1));
        assert!(p.should_retry(&err, 2));
        assert!(!p.should_retry(&err, 3));
    }

    #[tokio::test]
    async fn retries_connect_failures_then_gives_up() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = quick()
            .run("test", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Connect("refused".into()))
            })
            .await;
        assert!(matches!(res, Err(TransportError::Connect(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_reset() {
        let calls = AtomicU32::new(0);
        let res = quick()
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TransportError::ConnectionReset("rst".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn application_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = quick()
            .run("test", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::AuthRejected { status: 401, body: "timestamp".into() })
            })
            .await;
        assert!(res.unwrap_err().is_auth_rejected());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_port_surfaces_as_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Transport::new(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_secs(2),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        )
        .unwrap();
        let err = transport.call(&HttpRequest::get("/api/ping")).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}
