//! Request signing and session bootstrap.
//!
//! Two ways in:
//!   Wallet  → ephemeral ed25519 key ──prepare-signin──→ JWT ──EIP-191──→ login → token
//!   Token   → pre-provisioned ed25519 key + access token (no network)
//!
//! Every mutating call is then signed with the ed25519 key over
//! `v1,{request_id},{timestamp}[,{recv_window}],{body}` where `body` is the
//! compact JSON that goes on the wire byte-for-byte.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Signature as WalletSignature;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::transport::{HttpRequest, RetryPolicy, Transport, TransportError};

pub const SIGN_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("both WALLET_PRIVATE_KEY and ED25519_PRIVATE_KEY/ACCESS_TOKEN are set; configure exactly one credential")]
    AmbiguousCredential,
    #[error("no credential configured: set WALLET_PRIVATE_KEY, or ED25519_PRIVATE_KEY together with ACCESS_TOKEN")]
    MissingCredential,
    #[error("token credential needs both ED25519_PRIVATE_KEY and ACCESS_TOKEN")]
    IncompleteToken,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("not authenticated yet")]
    NotAuthenticated,
    #[error("body encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ─────────────────────────────────────────────────────────
// Credential
// ─────────────────────────────────────────────────────────

/// Exactly one credential source is active for the process lifetime.
#[derive(Clone)]
pub enum Credential {
    Wallet {
        private_key: SecretString,
    },
    Token {
        signing_key: SecretString,
        access_token: SecretString,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Wallet { .. } => f
                .debug_struct("Wallet")
                .field("private_key", &"[REDACTED]")
                .finish(),
            Credential::Token { .. } => f
                .debug_struct("Token")
                .field("signing_key", &"[REDACTED]")
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}

impl Credential {
    pub fn from_parts(
        wallet_key: Option<String>,
        ed25519_key: Option<String>,
        access_token: Option<String>,
    ) -> Result<Self, AuthError> {
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        let has_wallet = present(&wallet_key);
        let has_key = present(&ed25519_key);
        let has_token = present(&access_token);

        match (has_wallet, has_key || has_token) {
            (true, true) => Err(AuthError::AmbiguousCredential),
            (true, false) => Ok(Credential::Wallet {
                private_key: SecretString::from(wallet_key.unwrap_or_default().trim().to_string()),
            }),
            (false, true) if has_key && has_token => Ok(Credential::Token {
                signing_key: SecretString::from(ed25519_key.unwrap_or_default().trim().to_string()),
                access_token: SecretString::from(access_token.unwrap_or_default().trim().to_string()),
            }),
            (false, true) => Err(AuthError::IncompleteToken),
            (false, false) => Err(AuthError::MissingCredential),
        }
    }

    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_parts(
            std::env::var("WALLET_PRIVATE_KEY").ok(),
            std::env::var("ED25519_PRIVATE_KEY").ok(),
            std::env::var("ACCESS_TOKEN").ok(),
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Wallet { .. } => "wallet",
            Credential::Token { .. } => "token",
        }
    }
}

/// Accepts a 32-byte seed (or 64-byte keypair) as hex or base58.
pub fn parse_ed25519_key(raw: &str) -> Result<SigningKey, AuthError> {
    let raw = raw.trim();
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = if stripped.len() >= 64 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(stripped).map_err(|e| AuthError::InvalidKey(e.to_string()))?
    } else {
        bs58::decode(raw)
            .into_vec()
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?
    };
    let seed: [u8; 32] = match bytes.len() {
        32 | 64 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes[..32]);
            seed
        }
        n => return Err(AuthError::InvalidKey(format!("expected 32 or 64 key bytes, got {n}"))),
    };
    Ok(SigningKey::from_bytes(&seed))
}

// ─────────────────────────────────────────────────────────
// Signing identity
// ─────────────────────────────────────────────────────────

/// Result of authentication: the session key plus the bearer token.
pub struct SigningIdentity {
    key: SigningKey,
    token: SecretString,
    address: Option<String>,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &self.public_key_b58())
            .field("address", &self.address)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl SigningIdentity {
    pub fn new(key: SigningKey, token: SecretString, address: Option<String>) -> Self {
        Self { key, token, address }
    }

    /// Base58 public key; doubles as the handshake request id.
    pub fn public_key_b58(&self) -> String {
        bs58::encode(self.key.verifying_key().to_bytes()).into_string()
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// Sign `body` with a fresh request id and the current wall clock.
    pub fn sign<T: Serialize>(
        &self,
        method: &str,
        path: &str,
        body: &T,
        recv_window: Option<u64>,
    ) -> Result<SignedRequest, AuthError> {
        let body = canonical_json(body)?;
        Ok(self.sign_encoded(
            method,
            path,
            body,
            chrono::Utc::now().timestamp_millis(),
            recv_window,
            uuid::Uuid::new_v4().to_string(),
        ))
    }

    pub fn sign_encoded(
        &self,
        method: &str,
        path: &str,
        body: String,
        timestamp: i64,
        recv_window: Option<u64>,
        request_id: String,
    ) -> SignedRequest {
        let message = signing_message(&request_id, timestamp, recv_window, &body);
        let signature = STANDARD.encode(self.key.sign(message.as_bytes()).to_bytes());
        SignedRequest {
            method: method.to_string(),
            path: path.to_string(),
            body,
            timestamp,
            recv_window,
            request_id,
            signature,
        }
    }
}

/// Compact JSON, struct fields in declaration order.
pub fn canonical_json<T: Serialize>(body: &T) -> Result<String, AuthError> {
    serde_json::to_string(body).map_err(|e| AuthError::Encode(e.to_string()))
}

pub fn signing_message(request_id: &str, timestamp: i64, recv_window: Option<u64>, body: &str) -> String {
    match recv_window {
        Some(window) => format!("{SIGN_VERSION},{request_id},{timestamp},{window},{body}"),
        None => format!("{SIGN_VERSION},{request_id},{timestamp},{body}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
    pub timestamp: i64,
    pub recv_window: Option<u64>,
    pub request_id: String,
    pub signature: String,
}

impl SignedRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("x-request-sign-version", SIGN_VERSION.to_string()),
            ("x-request-id", self.request_id.clone()),
            ("x-request-timestamp", self.timestamp.to_string()),
        ];
        if let Some(window) = self.recv_window {
            headers.push(("x-request-recv-window", window.to_string()));
        }
        headers.push(("x-request-signature", self.signature.clone()));
        headers
    }

    /// HTTP form: bearer token + signature headers + the exact signed body.
    pub fn into_http(self, token: &str) -> HttpRequest {
        let mut req = if self.method.eq_ignore_ascii_case("GET") {
            HttpRequest::get(&self.path)
        } else {
            HttpRequest::post(&self.path)
        };
        req = req.header("Authorization", format!("Bearer {token}"));
        for (k, v) in self.headers() {
            req = req.header(k, v);
        }
        req.body(self.body)
    }

    /// Stream form: same content under stream field names.
    pub fn stream_header(&self) -> Value {
        let mut header = json!({
            "sign_version": SIGN_VERSION,
            "request_id": self.request_id,
            "timestamp": self.timestamp,
            "signature": self.signature,
        });
        if let Some(window) = self.recv_window {
            header["recv_window"] = json!(window);
        }
        header
    }
}

// ─────────────────────────────────────────────────────────
// Signer
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub auth_url: String,
    pub chain: String,
    /// Lifetime requested for the login token.
    pub token_expires: Duration,
    /// `None` drops the window from the signed message and headers.
    pub recv_window_ms: Option<u64>,
    pub http_timeout: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://api.standx.com".to_string(),
            chain: "bsc".to_string(),
            token_expires: Duration::from_secs(7 * 24 * 3600),
            recv_window_ms: Some(5_000),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl SignerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("STANDX_AUTH_URL") {
            cfg.auth_url = v;
        }
        if let Ok(v) = std::env::var("STANDX_CHAIN") {
            cfg.chain = v;
        }
        if let Ok(v) = std::env::var("STANDX_RECV_WINDOW_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.recv_window_ms = (ms > 0).then_some(ms);
            }
        }
        if let Ok(v) = std::env::var("STANDX_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.http_timeout = Duration::from_secs(secs.max(1));
            }
        }
        cfg
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareSigninResponse {
    #[serde(default)]
    success: bool,
    signed_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
    address: Option<String>,
    alias: Option<String>,
}

pub struct Signer {
    cfg: SignerConfig,
    credential: Credential,
    transport: Transport,
    identity: OnceCell<Arc<SigningIdentity>>,
}

impl Signer {
    pub fn new(cfg: SignerConfig, credential: Credential) -> Result<Self, AuthError> {
        let transport = Transport::new(&cfg.auth_url, cfg.http_timeout, RetryPolicy::default())?;
        Ok(Self {
            cfg,
            credential,
            transport,
            identity: OnceCell::new(),
        })
    }

    /// Idempotent: the first successful call is cached for the process.
    pub async fn authenticate(&self) -> Result<Arc<SigningIdentity>, AuthError> {
        self.identity
            .get_or_try_init(|| async {
                let identity = match &self.credential {
                    Credential::Token {
                        signing_key,
                        access_token,
                    } => {
                        let key = parse_ed25519_key(signing_key.expose_secret())?;
                        SigningIdentity::new(key, access_token.clone(), None)
                    }
                    Credential::Wallet { private_key } => self.wallet_handshake(private_key).await?,
                };
                info!(
                    "🔑 Authenticated via {} | session_key={} address={}",
                    self.credential.kind(),
                    identity.public_key_b58(),
                    identity.address().unwrap_or("-"),
                );
                Ok::<_, AuthError>(Arc::new(identity))
            })
            .await
            .cloned()
    }

    pub fn sign<T: Serialize>(&self, method: &str, path: &str, body: &T) -> Result<SignedRequest, AuthError> {
        let identity = self.identity.get().ok_or(AuthError::NotAuthenticated)?;
        identity.sign(method, path, body, self.cfg.recv_window_ms)
    }

    async fn wallet_handshake(&self, private_key: &SecretString) -> Result<SigningIdentity, AuthError> {
        let wallet: PrivateKeySigner = private_key
            .expose_secret()
            .parse()
            .map_err(|e| AuthError::InvalidKey(format!("wallet key: {e}")))?;
        let address = wallet.address().to_string();

        let session_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let request_id = bs58::encode(session_key.verifying_key().to_bytes()).into_string();

        // 1. prepare-signin → JWT carrying the message to sign
        let prepare = HttpRequest::post("/v1/offchain/prepare-signin")
            .query("chain", self.cfg.chain.clone())
            .body(json!({ "address": address, "requestId": request_id }).to_string());
        let resp: PrepareSigninResponse = self.transport.call_json(&prepare).await?;
        let signed_data = match resp.signed_data {
            Some(jwt) if resp.success => jwt,
            _ => return Err(AuthError::Handshake("prepare-signin returned no signedData".into())),
        };
        let message = decode_jwt_message(&signed_data)?;
        debug!("🔑 prepare-signin ok, signing {} byte message", message.len());

        // 2. wallet signs the message, login exchanges it for a token
        let signature = personal_sign(&wallet, &message).await?;
        let login = HttpRequest::post("/v1/offchain/login")
            .query("chain", self.cfg.chain.clone())
            .body(
                json!({
                    "signature": format!("0x{}", hex::encode(signature.as_bytes())),
                    "signedData": signed_data,
                    "expiresSeconds": self.cfg.token_expires.as_secs(),
                })
                .to_string(),
            );
        let resp: LoginResponse = self.transport.call_json(&login).await?;
        let token = resp
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Handshake("login returned no token".into()))?;
        if let Some(alias) = &resp.alias {
            debug!("🔑 login alias={}", alias);
        }

        Ok(SigningIdentity::new(
            session_key,
            SecretString::from(token),
            Some(resp.address.unwrap_or(address)),
        ))
    }
}

/// EIP-191 personal_sign.
pub async fn personal_sign(wallet: &PrivateKeySigner, message: &str) -> Result<WalletSignature, AuthError> {
    wallet
        .sign_message(message.as_bytes())
        .await
        .map_err(|e| AuthError::Handshake(format!("wallet signing: {e}")))
}

/// Pull `message` out of the JWT payload. The signature is not verified; the
/// venue checks it on login.
pub fn decode_jwt_message(jwt: &str) -> Result<String, AuthError> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Handshake("signedData is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::Handshake(format!("JWT payload: {e}")))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| AuthError::Handshake(format!("JWT payload: {e}")))?;
    claims
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .ok_or_else(|| AuthError::Handshake("JWT payload has no message".into()))
}
