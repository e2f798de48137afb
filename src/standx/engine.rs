//! Strategy engine: keep one bid and one ask around mid, stay flat.
//!
//! Per iteration:
//!   0. private link stale      → wait
//!   1. position ≠ 0            → one reduce-only market close, iteration ends
//!   2. every Nth iteration     → balance → mode; mode change → forced requote
//!   3. fresh depth push        → deviation check against the mode's band
//!   4. requote                 → cancel all → fresh price → place bid + ask
//!   5. sleep the check interval
//!
//! Every command's outcome is awaited before the next step; a timeout leaves
//! the rest to the next iteration, where the cache shows what actually happened.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::CacheSnapshot;
use super::correlation::{CommandHandle, CommandOutcome};
use super::mode::{BpsBand, Mode, ModeTable};
use super::quote::{quote_prices, requote_reason, RequoteReason};
use super::types::{to_decimal, OrderRequest, Position, Side};
use super::venue::Venue;
use crate::notifier::{Event, Notifier, Throttle};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub symbol: String,
    /// Size per quote, base units.
    pub qty: f64,
    pub modes: ModeTable,
    /// Pause between iterations; zero spins as fast as commands settle.
    pub check_interval: Duration,
    /// Balance/mode check runs on the first and every Nth iteration.
    pub mode_check_every: u64,
    pub price_decimals: u32,
    pub qty_decimals: u32,
    /// How long a requote waits for a fresh depth push after cancelling.
    pub fresh_price_timeout: Duration,
    /// Same-size flatten is not resent within this window.
    pub flatten_cooldown: Duration,
    /// Bound on the cancel-all wait at shutdown.
    pub shutdown_timeout: Duration,
    /// Attached to placements; read from the current position at startup.
    pub margin_mode: Option<String>,
    pub leverage: Option<u32>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-USD".to_string(),
            qty: 0.001,
            modes: ModeTable::default(),
            check_interval: Duration::from_millis(100),
            mode_check_every: 50,
            price_decimals: 2,
            qty_decimals: 4,
            fresh_price_timeout: Duration::from_secs(2),
            flatten_cooldown: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(5),
            margin_mode: None,
            leverage: None,
        }
    }
}

impl StrategyConfig {
    pub fn from_env() -> Self {
        let mut c = Self {
            modes: ModeTable::from_env(),
            ..Self::default()
        };
        if let Ok(v) = std::env::var("LIMIT_ORDER_SYMBOL")    { if !v.trim().is_empty() { c.symbol = v.trim().to_string(); } }
        if let Ok(v) = std::env::var("LIMIT_ORDER_QTY")       { if let Ok(f) = v.parse() { c.qty = f; } }
        if let Ok(v) = std::env::var("MM_CHECK_INTERVAL_MS")  { if let Ok(ms) = v.parse() { c.check_interval = Duration::from_millis(ms); } }
        if let Ok(v) = std::env::var("MM_MODE_CHECK_EVERY")   { if let Ok(n) = v.parse::<u64>() { c.mode_check_every = n.max(1); } }
        if let Ok(v) = std::env::var("MM_PRICE_DECIMALS")     { if let Ok(n) = v.parse() { c.price_decimals = n; } }
        if let Ok(v) = std::env::var("MM_QTY_DECIMALS")       { if let Ok(n) = v.parse() { c.qty_decimals = n; } }
        c
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.symbol.is_empty(), "symbol must be set");
        anyhow::ensure!(
            self.order_qty().is_some(),
            "qty {} rounds to zero at {} decimals",
            self.qty,
            self.qty_decimals
        );
        anyhow::ensure!(self.modes.is_valid(), "invalid mode table: {:?}", self.modes);
        Ok(())
    }

    fn order_qty(&self) -> Option<Decimal> {
        to_decimal(self.qty, self.qty_decimals).filter(|q| *q > Decimal::ZERO)
    }
}

// ─────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AwaitingPrice,
    CheckingPosition,
    CheckingDeviation,
    Requoting,
    ShuttingDown,
}

#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub iterations: u64,
    pub requotes: u64,
    pub placed: u64,
    pub cancels: u64,
    pub flattens: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub panics: u64,
}

pub struct StrategyEngine<V: Venue> {
    cfg: StrategyConfig,
    venue: V,
    notifier: Arc<dyn Notifier>,
    state: EngineState,
    mode: Option<Mode>,
    force_requote: bool,
    /// Last flatten submitted: signed qty and when.
    last_flatten: Option<(f64, Instant)>,
    iteration: u64,
    stats: EngineStats,
}

impl<V: Venue> StrategyEngine<V> {
    pub fn new(cfg: StrategyConfig, venue: V, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            cfg,
            venue,
            notifier,
            state: EngineState::AwaitingPrice,
            mode: None,
            force_requote: false,
            last_flatten: None,
            iteration: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Loop until `shutdown` fires, then cancel every live order.
    pub async fn run(mut self, shutdown: CancellationToken) -> EngineStats {
        info!(
            "🎯 Engine started | symbol={} qty={} interval={:?} mode_every={} t1={} t2={}",
            self.cfg.symbol,
            self.cfg.qty,
            self.cfg.check_interval,
            self.cfg.mode_check_every,
            self.cfg.modes.threshold_1,
            self.cfg.modes.threshold_2,
        );

        while !shutdown.is_cancelled() {
            if let Err(panic) = AssertUnwindSafe(self.iterate()).catch_unwind().await {
                self.stats.panics += 1;
                error!("💥 iteration {} panicked: {}", self.iteration, panic_message(&*panic));
            }
            self.iteration += 1;
            self.stats.iterations += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.shutdown().await;
        let s = &self.stats;
        info!(
            "🎯 Shutdown | iterations={} requotes={} placed={} cancels={} flattens={} timeouts={} rejections={} panics={}",
            s.iterations, s.requotes, s.placed, s.cancels, s.flattens, s.timeouts, s.rejections, s.panics,
        );
        self.stats
    }

    /// One pass of the decision loop.
    pub async fn iterate(&mut self) {
        let snap = self.venue.snapshot();
        if snap.private_stale {
            debug!("⏸️ private stream stale, waiting");
            self.state = EngineState::AwaitingPrice;
            return;
        }

        // ── 1. Inventory ──
        self.state = EngineState::CheckingPosition;
        if let Some(pos) = snap.position.as_ref().filter(|p| !p.is_flat()) {
            match self.closing_qty(pos) {
                Some(qty) => {
                    self.flatten(pos, qty).await;
                    return;
                }
                None => debug!("🧯 position {} below qty precision, quoting as flat", pos.qty),
            }
        }
        self.last_flatten = None;

        // ── 2. Mode ──
        if self.mode.is_none() || self.iteration % self.cfg.mode_check_every.max(1) == 0 {
            self.check_mode().await;
        }
        let band = self.band();

        // ── 3. Deviation ──
        if self.force_requote {
            self.requote(RequoteReason::ModeChange, band).await;
            return;
        }
        self.state = EngineState::CheckingDeviation;
        let Some(mid) = self.venue.take_price_update() else {
            self.state = EngineState::AwaitingPrice;
            return;
        };
        if snap.pending_count() > 0 {
            debug!("⏳ {} placement(s) unconfirmed, skipping deviation check", snap.pending_count());
            return;
        }
        if let Some(reason) = requote_reason(&snap, mid, &band) {
            self.requote(reason, band).await;
        }
    }

    fn band(&self) -> BpsBand {
        self.cfg.modes.band(self.mode.unwrap_or(Mode::Degraded2))
    }

    async fn check_mode(&mut self) {
        let Some(balance) = self.venue.refresh_balance().await else {
            if self.mode.is_none() {
                warn!("💰 no balance yet, quoting in {} until one arrives", Mode::Degraded2);
            }
            return;
        };
        let next = self.cfg.modes.for_balance(balance);
        match self.mode {
            Some(prev) if prev != next => {
                let band = self.cfg.modes.band(next);
                warn!(
                    "🔀 mode {} → {} | balance={:.2} band=({}, {}, {})",
                    prev, next, balance, band.target, band.min, band.max
                );
                self.notifier.notify(
                    Event::ModeChanged,
                    &format!(
                        "symbol: `{}`\n{} → {}\nbalance: {:.2}\nbps: {}",
                        self.cfg.symbol, prev, next, balance, band.target
                    ),
                    None,
                );
                self.force_requote = true;
            }
            None => info!("🔀 mode {} | balance={:.2}", next, balance),
            _ => debug!("🔀 mode {} | balance={:.2}", next, balance),
        }
        self.mode = Some(next);
    }

    // ─── Flatten ───

    /// Close size at venue precision; `None` for dust that rounds to zero.
    fn closing_qty(&self, pos: &Position) -> Option<Decimal> {
        to_decimal(pos.qty.abs(), self.cfg.qty_decimals).filter(|q| *q > Decimal::ZERO)
    }

    async fn flatten(&mut self, pos: &Position, qty: Decimal) {
        if let Some((qty, at)) = self.last_flatten {
            if (qty - pos.qty).abs() < Position::EPSILON && at.elapsed() < self.cfg.flatten_cooldown {
                debug!("🧯 flatten of {} already in flight", pos.qty);
                return;
            }
        }
        let side = pos.closing_side();
        let req = OrderRequest::reduce_only_market(&self.cfg.symbol, side, qty)
            .with_margin(self.cfg.margin_mode.clone(), self.cfg.leverage);

        warn!("🧯 flatten {} {} {} (position {})", self.cfg.symbol, side, qty, pos.qty);
        self.last_flatten = Some((pos.qty, Instant::now()));
        self.stats.flattens += 1;

        let handle = match self.venue.send_order(&req) {
            Ok(h) => h,
            Err(e) => {
                warn!("🧯 flatten not sent: {}", e);
                self.last_flatten = None;
                return;
            }
        };
        self.notifier.notify(
            Event::FlattenSubmitted,
            &format!("symbol: `{}`\n{} {} reduce-only market", self.cfg.symbol, side, qty),
            None,
        );

        match handle.outcome().await {
            outcome if outcome.is_confirmed() => info!("🧯 flatten confirmed"),
            CommandOutcome::Unknown => {
                self.stats.timeouts += 1;
                warn!("🧯 flatten unconfirmed, next position push decides");
            }
            other => {
                self.stats.rejections += 1;
                self.last_flatten = None;
                warn!("🧯 flatten failed: {:?}", other);
                self.notifier.notify(
                    Event::FlattenFailed,
                    &format!("symbol: `{}`\nposition: {}\n{:?}", self.cfg.symbol, pos.qty, other),
                    None,
                );
            }
        }
    }

    // ─── Requote ───

    async fn requote(&mut self, reason: RequoteReason, band: BpsBand) {
        self.state = EngineState::Requoting;
        self.stats.requotes += 1;
        info!("🔁 requote: {} | target={}bps", reason, band.target);
        self.notifier.notify(
            Event::Requote,
            &format!("symbol: `{}`\nreason: {}", self.cfg.symbol, reason),
            Some(Throttle::new("requote", Duration::from_secs(60))),
        );

        if !self.cancel_all().await {
            warn!("🔁 cancellations unconfirmed, placement deferred");
            return;
        }
        if self.venue.snapshot().pending_count() > 0 {
            warn!("🔁 unconfirmed placements outstanding, placement deferred");
            return;
        }

        let Some(mid) = self.venue.await_price_update(self.cfg.fresh_price_timeout).await else {
            self.stats.timeouts += 1;
            warn!("🔁 no fresh price within {:?}, placement deferred", self.cfg.fresh_price_timeout);
            return;
        };
        let (Some(quote), Some(qty)) = (
            quote_prices(mid, band.target, self.cfg.price_decimals),
            self.cfg.order_qty(),
        ) else {
            warn!("🔁 cannot quote mid={} target={}bps", mid, band.target);
            return;
        };
        self.force_requote = false;

        let mut handles = Vec::with_capacity(2);
        for (side, price) in [(Side::Buy, quote.bid), (Side::Sell, quote.ask)] {
            let req = OrderRequest::limit(&self.cfg.symbol, side, qty, price)
                .with_margin(self.cfg.margin_mode.clone(), self.cfg.leverage);
            match self.venue.send_order(&req) {
                Ok(h) => handles.push((side, price, h)),
                Err(e) => warn!("📤 {} @ {} not sent: {}", side, price, e),
            }
        }
        info!("📤 quoting mid={} bid={} ask={} qty={}", mid, quote.bid, quote.ask, qty);

        let outcomes = futures::future::join_all(
            handles
                .into_iter()
                .map(|(side, price, h)| async move { (side, price, h.outcome().await) }),
        )
        .await;
        for (side, price, outcome) in outcomes {
            match outcome {
                CommandOutcome::Confirmed | CommandOutcome::Skipped => self.stats.placed += 1,
                CommandOutcome::Unknown => {
                    self.stats.timeouts += 1;
                    warn!("⏱️ {} @ {} unconfirmed", side, price);
                }
                CommandOutcome::Rejected { code, message } => {
                    self.stats.rejections += 1;
                    warn!("❌ {} @ {} rejected: code={} {}", side, price, code, message);
                }
            }
        }
    }

    /// Cancel every live order and wait. True when all are confirmed gone.
    async fn cancel_all(&mut self) -> bool {
        let snap: CacheSnapshot = self.venue.snapshot();
        let mut handles: Vec<CommandHandle> = Vec::new();
        let mut all_sent = true;
        for order in snap.orders.iter().filter(|o| o.status.is_live()) {
            match self.venue.cancel_order(order) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    all_sent = false;
                    warn!("❌ cancel {:?} not sent: {}", order.key(), e);
                }
            }
        }
        if handles.is_empty() {
            return all_sent;
        }
        self.stats.cancels += handles.len() as u64;
        let outcomes = futures::future::join_all(handles.into_iter().map(CommandHandle::outcome)).await;
        let confirmed = outcomes.iter().filter(|o| o.is_confirmed()).count();
        if confirmed < outcomes.len() {
            self.stats.timeouts += (outcomes.len() - confirmed) as u64;
            warn!("🧹 {}/{} cancels confirmed", confirmed, outcomes.len());
        }
        all_sent && confirmed == outcomes.len()
    }

    async fn shutdown(&mut self) {
        self.state = EngineState::ShuttingDown;
        info!("🛑 cancelling live orders before exit");
        let limit = self.cfg.shutdown_timeout;
        match tokio::time::timeout(limit, self.cancel_all()).await {
            Ok(true) => info!("🛑 all orders cancelled"),
            Ok(false) => warn!("🛑 some cancels unconfirmed"),
            Err(_) => warn!("🛑 cancel-all exceeded {:?}", limit),
        }
        self.notifier.notify(
            Event::Shutdown,
            &format!("symbol: `{}` engine stopped", self.cfg.symbol),
            None,
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string())
}
