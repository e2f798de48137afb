//! Stream adapter: two independent WebSocket connections feeding one cache.
//!
//! Architecture:
//!   market WS  ──raw text──→ handler ──→ StateStore (depth)        ──→ take/await_price_update
//!   private WS ──raw text──→ handler ──→ StateStore (orders/pos/bal) + PendingCommands
//!   send_order / cancel_order ──signed frame──→ private WS ──push──→ handler resolves handle
//!
//! Per connection:
//!   Disconnected → Connecting → Subscribed → Streaming → ReconnectBackoff → Connecting …
//!
//! The socket loop never decodes; it only forwards text to the handler task so
//! a slow cache update cannot stall reads. On disconnect the cache is kept and
//! flagged stale until the link is back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::StandxApi;
use super::auth::{canonical_json, AuthError, SigningIdentity};
use super::backoff::ReconnectBackoff;
use super::cache::{CacheSnapshot, LinkState, OrderApply, PositionChange, StateStore, StreamKind};
use super::correlation::{CommandHandle, CommandKind, CommandOutcome, PendingCommands};
use super::messages::{
    auth_frame, code_ok, command_frame, parse_frame, subscribe_frame, StreamEvent, CHANNEL_DEPTH,
    METHOD_CANCEL_ORDER, METHOD_NEW_ORDER, PRIVATE_CHANNELS,
};
use super::types::{CancelOrderBody, Order, OrderRequest, OrderStatus, Position, Side};
use crate::notifier::{Event, Notifier, Throttle};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub market_ws_url: String,
    pub private_ws_url: String,
    pub symbol: String,
    /// How long a command handle waits for its confirmation.
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub recv_window_ms: Option<u64>,
    /// After a private reconnect, pull open orders + positions over REST.
    pub resync_on_reconnect: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            market_ws_url: "wss://perps.standx.com/ws-stream/v1".to_string(),
            private_ws_url: "wss://perps.standx.com/ws-stream/v1".to_string(),
            symbol: "BTC-USD".to_string(),
            command_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            recv_window_ms: Some(5_000),
            resync_on_reconnect: true,
        }
    }
}

impl AdapterConfig {
    pub fn from_env(symbol: &str) -> Self {
        let mut cfg = Self {
            symbol: symbol.to_string(),
            ..Self::default()
        };
        if let Ok(v) = std::env::var("STANDX_WS_URL") {
            cfg.market_ws_url = v.clone();
            cfg.private_ws_url = v;
        }
        if let Ok(v) = std::env::var("STANDX_PRIVATE_WS_URL") {
            cfg.private_ws_url = v;
        }
        if let Ok(v) = std::env::var("STANDX_COMMAND_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.command_timeout = Duration::from_millis(ms.max(1));
            }
        }
        if let Ok(v) = std::env::var("STANDX_RECV_WINDOW_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.recv_window_ms = (ms > 0).then_some(ms);
            }
        }
        if let Ok(v) = std::env::var("STANDX_RESYNC_ON_RECONNECT") {
            cfg.resync_on_reconnect = v == "1" || v.eq_ignore_ascii_case("true");
        }
        cfg
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("private stream is disconnected")]
    Disconnected,
    #[error("adapter has stopped")]
    Closed,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Signed frame waiting for the private socket.
#[derive(Debug)]
struct Outbound {
    request_id: String,
    frame: String,
    enqueued_at: Instant,
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct StreamAdapter {
    cfg: AdapterConfig,
    store: Arc<StateStore>,
    pending: Arc<PendingCommands>,
    identity: Arc<SigningIdentity>,
    api: Option<StandxApi>,
    notifier: Arc<dyn Notifier>,
    cmd_tx: mpsc::UnboundedSender<Outbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamAdapter {
    /// Spawn both connections and their handlers. Must run inside a runtime.
    pub fn start(
        cfg: AdapterConfig,
        identity: Arc<SigningIdentity>,
        api: Option<StandxApi>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        let store = Arc::new(StateStore::new(&cfg.symbol));
        let pending = PendingCommands::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (market_tx, market_rx) = mpsc::unbounded_channel();
        let (private_tx, private_rx) = mpsc::unbounded_channel();

        let handler = |kind| EventHandler {
            kind,
            symbol: cfg.symbol.clone(),
            store: store.clone(),
            pending: pending.clone(),
            notifier: notifier.clone(),
            last_live_count: 0,
        };

        let market = ConnectionLoop {
            kind: StreamKind::Market,
            url: cfg.market_ws_url.clone(),
            handshake: Handshake::Subscribe(vec![subscribe_frame(CHANNEL_DEPTH, &cfg.symbol)]),
            store: store.clone(),
            frames_tx: market_tx,
            backoff: ReconnectBackoff::new(cfg.backoff_base, cfg.backoff_cap, 0.1),
            connect_timeout: cfg.connect_timeout,
            ping_interval: cfg.ping_interval,
            command_timeout: cfg.command_timeout,
            resync: None,
            shutdown: shutdown.clone(),
        };
        let private = ConnectionLoop {
            kind: StreamKind::Private,
            url: cfg.private_ws_url.clone(),
            handshake: Handshake::Authenticate {
                frame: auth_frame(identity.token(), &PRIVATE_CHANNELS),
                timeout: cfg.auth_timeout,
            },
            store: store.clone(),
            frames_tx: private_tx,
            backoff: ReconnectBackoff::new(cfg.backoff_base, cfg.backoff_cap, 0.1),
            connect_timeout: cfg.connect_timeout,
            ping_interval: cfg.ping_interval,
            command_timeout: cfg.command_timeout,
            resync: api.clone().filter(|_| cfg.resync_on_reconnect),
            shutdown: shutdown.clone(),
        };

        let tasks = vec![
            tokio::spawn(handler(StreamKind::Market).run(market_rx)),
            tokio::spawn(handler(StreamKind::Private).run(private_rx)),
            tokio::spawn(market.run(None)),
            tokio::spawn(private.run(Some(cmd_rx))),
        ];

        info!(
            "📡 StreamAdapter started | symbol={} market={} private={}",
            cfg.symbol, cfg.market_ws_url, cfg.private_ws_url
        );

        Self {
            cfg,
            store,
            pending,
            identity,
            api,
            notifier,
            cmd_tx,
            tasks,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.store.snapshot()
    }

    pub fn take_price_update(&self) -> Option<f64> {
        self.store.take_price_update()
    }

    pub async fn await_price_update(&self, timeout: Duration) -> Option<f64> {
        self.store.await_price_update(timeout).await
    }

    /// Sign and queue a placement. The request id doubles as `cl_ord_id`.
    pub fn send_order(&self, req: &OrderRequest) -> Result<CommandHandle, AdapterError> {
        if self.store.is_stale(StreamKind::Private) {
            return Err(AdapterError::Disconnected);
        }
        let cl_ord_id = new_request_id();
        let body = canonical_json(&req.body(&cl_ord_id))?;
        let signed = self.identity.sign_encoded(
            "POST",
            "/api/new_order",
            body,
            chrono::Utc::now().timestamp_millis(),
            self.cfg.recv_window_ms,
            cl_ord_id.clone(),
        );

        self.store.register_pending(&cl_ord_id, req);
        let handle = self
            .pending
            .register(&cl_ord_id, CommandKind::Place, None, self.cfg.command_timeout);
        self.enqueue(&cl_ord_id, command_frame(METHOD_NEW_ORDER, &signed))
            .inspect_err(|_| self.store.drop_pending(&cl_ord_id))?;

        info!(
            "📤 new_order {} {} {}@{} reduce_only={} cl={}",
            req.symbol,
            req.side,
            req.qty,
            req.price.map(|p| p.to_string()).unwrap_or_else(|| "MKT".into()),
            req.reduce_only,
            cl_ord_id,
        );
        Ok(handle)
    }

    /// Cancel a live order. An order the cache no longer holds as live is a
    /// no-op that settles immediately as `Skipped`.
    pub fn cancel_order(&self, order: &Order) -> Result<CommandHandle, AdapterError> {
        let live = self
            .store
            .find_order(order.order_id.as_deref(), order.cl_ord_id.as_deref())
            .filter(|o| o.status.is_live());
        let Some(live) = live else {
            debug!("🧹 cancel skipped, order {:?} not live", order.key());
            return Ok(CommandHandle::ready(
                order.key().as_deref().unwrap_or_default(),
                CommandOutcome::Skipped,
            ));
        };
        if self.store.is_stale(StreamKind::Private) {
            return Err(AdapterError::Disconnected);
        }

        let request_id = new_request_id();
        let body = canonical_json(&CancelOrderBody::for_order(&live))?;
        let signed = self.identity.sign_encoded(
            "POST",
            "/api/cancel_order",
            body,
            chrono::Utc::now().timestamp_millis(),
            self.cfg.recv_window_ms,
            request_id.clone(),
        );
        let handle = self.pending.register(
            &request_id,
            CommandKind::Cancel,
            live.order_id.clone(),
            self.cfg.command_timeout,
        );
        self.enqueue(&request_id, command_frame(METHOD_CANCEL_ORDER, &signed))?;
        info!(
            "📤 cancel_order {} {}@{} id={}",
            live.side,
            live.qty,
            live.price,
            live.order_id.as_deref().unwrap_or("?"),
        );
        Ok(handle)
    }

    /// Poll the balance over REST; falls back to the last pushed value.
    pub async fn refresh_balance(&self) -> Option<f64> {
        poll_balance(self.api.as_ref(), &self.store, self.notifier.as_ref()).await
    }

    fn enqueue(&self, request_id: &str, frame: String) -> Result<(), AdapterError> {
        let out = Outbound {
            request_id: request_id.to_string(),
            frame,
            enqueued_at: Instant::now(),
        };
        self.cmd_tx.send(out).map_err(|_| {
            self.pending.forget(request_id);
            AdapterError::Closed
        })
    }

    /// Wait for all tasks after the shutdown token fired.
    pub async fn join(self, timeout: Duration) {
        let Self { tasks, cmd_tx, .. } = self;
        drop(cmd_tx);
        let all = futures::future::join_all(tasks);
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("📡 StreamAdapter tasks did not stop within {:?}", timeout);
        }
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

// ─────────────────────────────────────────────────────────
// Event handler (one per stream, preserves per-stream order)
// ─────────────────────────────────────────────────────────

struct EventHandler {
    kind: StreamKind,
    symbol: String,
    store: Arc<StateStore>,
    pending: Arc<PendingCommands>,
    notifier: Arc<dyn Notifier>,
    last_live_count: usize,
}

impl EventHandler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = rx.recv().await {
            for event in parse_frame(&text) {
                self.apply(event);
            }
        }
        debug!("📡 {:?} handler stopped", self.kind);
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Depth(d) => {
                self.store.apply_depth(&d);
            }
            StreamEvent::Order(order) => self.on_order(order),
            StreamEvent::Position(p) => {
                if p.symbol != self.symbol {
                    return;
                }
                let qty = p.qty;
                let entry = p.entry_price;
                let pnl = p.realized_pnl;
                match self.store.apply_position(p) {
                    PositionChange::Opened { qty } => {
                        info!("📍 position opened {} qty={} entry={}", self.symbol, qty, entry);
                        self.notifier.notify(
                            Event::PositionOpened,
                            &format!(
                                "symbol: `{}`\nside: {}\nqty: {}\nentry: {}",
                                self.symbol,
                                if qty > 0.0 { "long" } else { "short" },
                                qty.abs(),
                                entry
                            ),
                            None,
                        );
                    }
                    PositionChange::Closed => {
                        info!("📍 position closed {} realized_pnl={}", self.symbol, pnl);
                        self.notifier.notify(
                            Event::PositionClosed,
                            &format!("symbol: `{}`\nrealized pnl: {}", self.symbol, pnl),
                            None,
                        );
                    }
                    PositionChange::Resized { from, to } => {
                        info!("📍 position {} {} → {}", self.symbol, from, to);
                    }
                    PositionChange::Unchanged => debug!("📍 position {} qty={}", self.symbol, qty),
                }
            }
            StreamEvent::Balance(b) => {
                debug!("💰 balance available={} equity={}", b.available, b.equity);
                self.store.apply_balance(b);
            }
            StreamEvent::Auth { ok, code, message } => {
                debug!("🔐 auth reply ok={} code={} {}", ok, code, message);
            }
            StreamEvent::CommandReply {
                request_id,
                code,
                message,
            } => self.on_reply(request_id, code, message),
        }
    }

    fn on_order(&mut self, order: Order) {
        if order.symbol != self.symbol {
            return;
        }
        let cl_ord_id = order.cl_ord_id.clone();
        let order_id = order.order_id.clone();
        let status = order.status;
        info!(
            "📨 order {} {} {}@{} filled={} status={:?} id={} cl={}",
            order.symbol,
            order.side,
            order.qty,
            order.price,
            order.filled_qty,
            status,
            order_id.as_deref().unwrap_or("-"),
            cl_ord_id.as_deref().unwrap_or("-"),
        );

        if self.store.apply_order(order) == OrderApply::IgnoredTerminal {
            debug!("📨 late push for terminal order ignored");
        }

        if let Some(cl) = &cl_ord_id {
            if self.pending.kind_of(cl) == Some(CommandKind::Place) {
                let outcome = if status == OrderStatus::Rejected {
                    CommandOutcome::Rejected {
                        code: -1,
                        message: "rejected by venue".into(),
                    }
                } else {
                    CommandOutcome::Confirmed
                };
                self.pending.resolve(cl, outcome);
            }
        }
        if status.is_terminal() {
            if let Some(id) = &order_id {
                self.pending.resolve_cancels_for(id, CommandOutcome::Confirmed);
            }
        }

        let live = self.store.live_order_count();
        if self.last_live_count <= 2 && live > 2 {
            let snap = self.store.snapshot();
            warn!("⚠️ open order count {} exceeds 2", live);
            self.notifier.notify(
                Event::OrderCountExceeded,
                &format!(
                    "open orders: {}\nbids: {}, asks: {}",
                    live,
                    snap.live_orders(Side::Buy).len(),
                    snap.live_orders(Side::Sell).len()
                ),
                None,
            );
        }
        self.last_live_count = live;
    }

    fn on_reply(&mut self, request_id: String, code: i64, message: String) {
        if code_ok(code) {
            debug!("📬 command {} accepted", request_id);
            return;
        }
        warn!("📬 command {} rejected: code={} {}", request_id, code, message);

        if code == 401 || code == 403 {
            signature_alert(self.notifier.as_ref(), &format!("code {code}: {message}"));
        }

        match self.pending.kind_of(&request_id) {
            Some(CommandKind::Place) => {
                self.store.drop_pending(&request_id);
                self.pending
                    .resolve(&request_id, CommandOutcome::Rejected { code, message });
            }
            Some(CommandKind::Cancel) => {
                // Venue no longer knows the order: it is gone, settle the cache.
                let gone = {
                    let m = message.to_ascii_lowercase();
                    m.contains("not found") || m.contains("not exist")
                };
                let target = self.pending.cancel_target(&request_id);
                if gone {
                    if let Some(mut order) = self.store.find_order(target.as_deref(), None) {
                        order.status = OrderStatus::Canceled;
                        self.store.apply_order(order);
                    }
                    self.pending.resolve(&request_id, CommandOutcome::Confirmed);
                } else {
                    self.pending
                        .resolve(&request_id, CommandOutcome::Rejected { code, message });
                }
            }
            None => debug!("📬 reply for unknown request {}", request_id),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Connection loop
// ─────────────────────────────────────────────────────────

enum Handshake {
    Subscribe(Vec<String>),
    Authenticate { frame: String, timeout: Duration },
}

enum SessionEnd {
    Closed,
    Shutdown,
}

struct ConnectionLoop {
    kind: StreamKind,
    url: String,
    handshake: Handshake,
    store: Arc<StateStore>,
    frames_tx: mpsc::UnboundedSender<String>,
    backoff: ReconnectBackoff,
    connect_timeout: Duration,
    ping_interval: Duration,
    command_timeout: Duration,
    resync: Option<StandxApi>,
    shutdown: CancellationToken,
}

async fn next_command(rx: &mut Option<mpsc::UnboundedReceiver<Outbound>>) -> Option<Outbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionLoop {
    async fn run(mut self, mut commands: Option<mpsc::UnboundedReceiver<Outbound>>) {
        info!("📡 {:?} stream loop started | url={}", self.kind, self.url);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.store.set_link(self.kind, LinkState::Connecting);
            let result = self.session(&mut commands).await;
            self.store.mark_disconnected(self.kind);

            match result {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => info!("📡 {:?} stream closed", self.kind),
                Err(e) => warn!("📡 {:?} stream error: {:#}", self.kind, e),
            }

            self.store.set_link(self.kind, LinkState::ReconnectBackoff);
            let delay = self.backoff.next_delay();
            info!(
                "📡 {:?} reconnecting in {:?} (attempt {})",
                self.kind,
                delay,
                self.backoff.attempt()
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.store.set_link(self.kind, LinkState::Disconnected);
        info!("📡 {:?} stream loop stopped", self.kind);
    }

    async fn session(
        &mut self,
        commands: &mut Option<mpsc::UnboundedReceiver<Outbound>>,
    ) -> anyhow::Result<SessionEnd> {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(&self.url));
        let ws = tokio::select! {
            res = connect => match res {
                Ok(Ok((ws, _resp))) => ws,
                Ok(Err(e)) => anyhow::bail!("WS connect error: {:?}", e),
                Err(_) => anyhow::bail!("WS connection timeout"),
            },
            _ = self.shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
        };
        info!("✅ {:?} WS connected", self.kind);
        let (mut write, mut read) = ws.split();

        match &self.handshake {
            Handshake::Subscribe(frames) => {
                for f in frames {
                    write.send(Message::Text(f.clone())).await?;
                }
            }
            Handshake::Authenticate { frame, timeout } => {
                write.send(Message::Text(frame.clone())).await?;
                match tokio::time::timeout(*timeout, await_auth(&mut read, &self.frames_tx)).await {
                    Ok(res) => res?,
                    Err(_) => anyhow::bail!("auth reply timeout"),
                }
                info!("🔐 {:?} stream authenticated", self.kind);
            }
        }
        self.store.set_link(self.kind, LinkState::Subscribed);

        if self.kind == StreamKind::Private {
            if let Some(api) = &self.resync {
                resync(api, &self.store).await;
            }
            // Replay only commands still inside their confirmation window.
            if let Some(rx) = commands.as_mut() {
                while let Ok(out) = rx.try_recv() {
                    if out.enqueued_at.elapsed() >= self.command_timeout {
                        warn!("🗑️ dropping stale command {}", out.request_id);
                    } else {
                        write.send(Message::Text(out.frame)).await?;
                    }
                }
            }
            self.store.set_stale(StreamKind::Private, false);
        }

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;
        let mut streaming = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                cmd = next_command(commands) => match cmd {
                    Some(out) => {
                        if out.enqueued_at.elapsed() >= self.command_timeout {
                            warn!("🗑️ dropping stale command {}", out.request_id);
                            continue;
                        }
                        debug!("📤 frame {}", out.request_id);
                        write.send(Message::Text(out.frame)).await?;
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !streaming {
                            streaming = true;
                            self.backoff.reset();
                            self.store.set_link(self.kind, LinkState::Streaming);
                        }
                        if self.frames_tx.send(text).is_err() {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("📡 {:?} WS closed by server: {:?}", self.kind, frame);
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => anyhow::bail!("WS read error: {:?}", e),
                    None => return Ok(SessionEnd::Closed),
                },
            }
        }
    }
}

/// Read until the auth reply. Pushes that beat it are still forwarded.
async fn await_auth<S>(read: &mut S, frames_tx: &mpsc::UnboundedSender<String>) -> anyhow::Result<()>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let Message::Text(text) = msg? else { continue };
        let reply = parse_frame(&text).into_iter().find_map(|e| match e {
            StreamEvent::Auth { ok, code, message } => Some((ok, code, message)),
            _ => None,
        });
        match reply {
            Some((true, _, _)) => return Ok(()),
            Some((false, code, message)) => anyhow::bail!("auth rejected: code={} {}", code, message),
            None => {
                let _ = frames_tx.send(text);
            }
        }
    }
    anyhow::bail!("stream closed before auth reply")
}

/// Clock-sync alert shared by the command and REST paths.
fn signature_alert(notifier: &dyn Notifier, detail: &str) {
    notifier.notify(
        Event::SignatureRejected,
        &format!("{detail}\ncheck the host clock"),
        Some(Throttle::new("signature_rejected", Duration::from_secs(300))),
    );
}

async fn poll_balance(api: Option<&StandxApi>, store: &StateStore, notifier: &dyn Notifier) -> Option<f64> {
    if let Some(api) = api {
        match api.query_balance().await {
            Ok(b) => {
                store.apply_balance(b);
                return Some(b.available);
            }
            Err(e) if e.is_signature_rejected() => {
                error!("🚨 balance query signature rejected, using cached: {}", e);
                signature_alert(notifier, &format!("query_balance: {e}"));
            }
            Err(e) => warn!("💰 balance query failed, using cached: {}", e),
        }
    }
    store.balance().map(|b| b.available)
}

/// Authoritative REST view after a private reconnect.
async fn resync(api: &StandxApi, store: &StateStore) {
    let symbol = store.symbol().to_string();
    match api.query_open_orders(&symbol).await {
        Ok(orders) => store.apply_open_orders_snapshot(orders),
        Err(e) => warn!("📋 open-order resync failed: {}", e),
    }
    match api.query_positions(Some(&symbol)).await {
        Ok(positions) => {
            let mut reported = false;
            for p in positions.into_iter().filter(|p| p.symbol == symbol) {
                reported = true;
                store.apply_position(p);
            }
            // The venue omits flat positions from the list.
            if !reported {
                if let Some(prev) = store.position(&symbol).filter(|p| !p.is_flat()) {
                    info!("📍 resync: {} flat on venue, clearing cached qty {}", symbol, prev.qty);
                    store.apply_position(Position { qty: 0.0, ..prev });
                }
            }
        }
        Err(e) => warn!("📍 position resync failed: {}", e),
    }
}
