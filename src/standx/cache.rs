//! Locally cached venue state, fed by the stream handlers.
//!
//! Each record (depth, orders, positions, balance, link status) sits behind
//! its own lock and is only written on the stream-handling path. Readers take
//! a [`CacheSnapshot`]; "wait until updated" is a `watch` channel bumped on
//! every accepted depth push.
//!
//! Order lifecycle:
//!   register_pending ──→ Pending ──push──→ Open / PartiallyFilled ──push──→ terminal (removed)
//! A terminal order is remembered for a while so a late non-terminal push for
//! the same id cannot bring it back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::messages::DepthUpdate;
use super::types::{Balance, DepthBook, Order, OrderRequest, OrderStatus, Position, Side};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Market,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Subscribed (and authenticated, for the private stream).
    Subscribed,
    Streaming,
    ReconnectBackoff,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    state: LinkState,
    stale: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            stale: true,
        }
    }
}

/// What an order push did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderApply {
    Inserted,
    Updated { previous: OrderStatus },
    /// Terminal push; the order left the open set.
    Removed { previous: Option<OrderStatus> },
    /// Late push for an order that already reached a terminal state.
    IgnoredTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionChange {
    Opened { qty: f64 },
    Closed,
    Resized { from: f64, to: f64 },
    Unchanged,
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct OrderState {
    open: HashMap<String, Order>,
    pending_since: HashMap<String, Instant>,
    /// Keys (client id and `id:<venue id>`) of orders seen terminal.
    terminal: HashMap<String, Instant>,
    terminal_ttl: Duration,
}

impl OrderState {
    fn new(terminal_ttl: Duration) -> Self {
        Self {
            open: HashMap::new(),
            pending_since: HashMap::new(),
            terminal: HashMap::new(),
            terminal_ttl,
        }
    }

    fn find_key(&self, order: &Order) -> Option<String> {
        if let Some(cl) = &order.cl_ord_id {
            if self.open.contains_key(cl) {
                return Some(cl.clone());
            }
        }
        let id = order.order_id.as_ref()?;
        self.open
            .iter()
            .find(|(_, o)| o.order_id.as_deref() == Some(id.as_str()))
            .map(|(k, _)| k.clone())
    }

    fn seen_terminal(&mut self, order: &Order) -> bool {
        let now = Instant::now();
        let ttl = self.terminal_ttl;
        self.terminal.retain(|_, at| now.duration_since(*at) < ttl);
        order
            .cl_ord_id
            .as_ref()
            .map(|cl| self.terminal.contains_key(cl))
            .unwrap_or(false)
            || order
                .order_id
                .as_ref()
                .map(|id| self.terminal.contains_key(&format!("id:{id}")))
                .unwrap_or(false)
    }

    fn remember_terminal(&mut self, order: &Order) {
        let now = Instant::now();
        if let Some(cl) = &order.cl_ord_id {
            self.terminal.insert(cl.clone(), now);
        }
        if let Some(id) = &order.order_id {
            self.terminal.insert(format!("id:{id}"), now);
        }
    }

    fn apply(&mut self, mut incoming: Order) -> OrderApply {
        if !incoming.status.is_terminal() && self.seen_terminal(&incoming) {
            return OrderApply::IgnoredTerminal;
        }

        let existing_key = self.find_key(&incoming);
        let existing = existing_key.as_ref().and_then(|k| self.open.get(k)).cloned();

        // Keep ids the push may omit
        if let Some(prev) = &existing {
            if incoming.cl_ord_id.is_none() {
                incoming.cl_ord_id = prev.cl_ord_id.clone();
            }
            if incoming.order_id.is_none() {
                incoming.order_id = prev.order_id.clone();
            }
        }

        if incoming.status.is_terminal() {
            if let Some(k) = &existing_key {
                self.open.remove(k);
                self.pending_since.remove(k);
            }
            self.remember_terminal(&incoming);
            return OrderApply::Removed {
                previous: existing.map(|o| o.status),
            };
        }

        let Some(key) = incoming.key() else {
            return OrderApply::IgnoredTerminal;
        };
        if let Some(old_key) = &existing_key {
            if *old_key != key {
                self.open.remove(old_key);
            }
            self.pending_since.remove(old_key);
        }
        self.pending_since.remove(&key);
        self.open.insert(key, incoming);
        match existing {
            Some(prev) => OrderApply::Updated {
                previous: prev.status,
            },
            None => OrderApply::Inserted,
        }
    }

    fn expire_pending(&mut self, ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending_since
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.pending_since.remove(&key);
            let still_pending = self
                .open
                .get(&key)
                .map(|o| o.status == OrderStatus::Pending)
                .unwrap_or(false);
            if still_pending {
                warn!("⏳ pending order {} never confirmed, dropping from cache", key);
                self.open.remove(&key);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub depth: DepthBook,
    /// Non-terminal orders for the managed symbol, pending included.
    pub orders: Vec<Order>,
    pub position: Option<Position>,
    pub balance: Option<Balance>,
    pub market_stale: bool,
    pub private_stale: bool,
}

impl CacheSnapshot {
    pub fn live_orders(&self, side: Side) -> Vec<&Order> {
        self.orders
            .iter()
            .filter(|o| o.side == side && o.status.is_live())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.orders.iter().filter(|o| o.status.is_live()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .count()
    }

    /// Signed position size for the managed symbol; 0 when flat or unknown.
    pub fn position_qty(&self) -> f64 {
        self.position.as_ref().map(|p| p.qty).unwrap_or(0.0)
    }
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StateStore {
    symbol: String,
    pending_ttl: Duration,
    depth: Mutex<DepthBook>,
    orders: Mutex<OrderState>,
    positions: Mutex<HashMap<String, Position>>,
    balance: Mutex<Option<Balance>>,
    links: Mutex<HashMap<StreamKind, Link>>,
    price_tx: watch::Sender<u64>,
}

impl StateStore {
    pub fn new(symbol: &str) -> Self {
        Self::with_ttls(symbol, Duration::from_secs(10), Duration::from_secs(15 * 60))
    }

    pub fn with_ttls(symbol: &str, pending_ttl: Duration, terminal_ttl: Duration) -> Self {
        let (price_tx, _) = watch::channel(0);
        let mut links = HashMap::new();
        links.insert(StreamKind::Market, Link::default());
        links.insert(StreamKind::Private, Link::default());
        Self {
            symbol: symbol.to_string(),
            pending_ttl,
            depth: Mutex::new(DepthBook::empty(symbol)),
            orders: Mutex::new(OrderState::new(terminal_ttl)),
            positions: Mutex::new(HashMap::new()),
            balance: Mutex::new(None),
            links: Mutex::new(links),
            price_tx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // ─── Depth ───

    /// Returns false when the push is for another symbol or its seq regressed.
    pub fn apply_depth(&self, update: &DepthUpdate) -> bool {
        if update.symbol != self.symbol {
            return false;
        }
        {
            let mut depth = lock(&self.depth);
            if let (Some(last), Some(seq)) = (depth.seq, update.seq) {
                if seq <= last {
                    debug!("📉 stale depth seq {} <= {}, dropped", seq, last);
                    return false;
                }
            }
            depth.best_bid = update.best_bid;
            depth.best_ask = update.best_ask;
            depth.mid = update.mid();
            depth.seq = update.seq.or(depth.seq);
            depth.received_at = Some(Instant::now());
            depth.updated = true;
        }
        self.set_stale(StreamKind::Market, false);
        self.price_tx.send_modify(|n| *n = n.wrapping_add(1));
        true
    }

    /// Consume the updated flag. `None` when nothing new arrived since the
    /// last consumption or the market link is stale.
    pub fn take_price_update(&self) -> Option<f64> {
        let stale = self.is_stale(StreamKind::Market);
        let mut depth = lock(&self.depth);
        if !depth.updated {
            return None;
        }
        depth.updated = false;
        (!stale && depth.is_ready()).then_some(depth.mid)
    }

    /// Wait for the next accepted depth push and consume it.
    pub async fn await_price_update(&self, timeout: Duration) -> Option<f64> {
        let mut rx = self.price_tx.subscribe();
        rx.borrow_and_update();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => self.take_price_update(),
            _ => None,
        }
    }

    // ─── Orders ───

    pub fn register_pending(&self, cl_ord_id: &str, req: &OrderRequest) {
        let order = Order {
            cl_ord_id: Some(cl_ord_id.to_string()),
            order_id: None,
            symbol: req.symbol.clone(),
            side: req.side,
            price: req.price.and_then(|p| p.to_f64()).unwrap_or(0.0),
            qty: req.qty.to_f64().unwrap_or(0.0),
            filled_qty: 0.0,
            status: OrderStatus::Pending,
        };
        let mut orders = lock(&self.orders);
        orders.pending_since.insert(cl_ord_id.to_string(), Instant::now());
        orders.open.insert(cl_ord_id.to_string(), order);
    }

    /// Placement rejected or abandoned before any push: drop the pending entry.
    pub fn drop_pending(&self, cl_ord_id: &str) {
        let mut orders = lock(&self.orders);
        orders.pending_since.remove(cl_ord_id);
        let still_pending = orders
            .open
            .get(cl_ord_id)
            .map(|o| o.status == OrderStatus::Pending)
            .unwrap_or(false);
        if still_pending {
            if let Some(o) = orders.open.remove(cl_ord_id) {
                orders.remember_terminal(&o);
            }
        }
    }

    pub fn apply_order(&self, order: Order) -> OrderApply {
        lock(&self.orders).apply(order)
    }

    pub fn find_order(&self, order_id: Option<&str>, cl_ord_id: Option<&str>) -> Option<Order> {
        let orders = lock(&self.orders);
        if let Some(cl) = cl_ord_id {
            if let Some(o) = orders.open.get(cl) {
                return Some(o.clone());
            }
        }
        let id = order_id?;
        orders
            .open
            .values()
            .find(|o| o.order_id.as_deref() == Some(id))
            .cloned()
    }

    /// Authoritative REST snapshot of open orders for the managed symbol.
    /// Pending placements survive; everything else is replaced.
    pub fn apply_open_orders_snapshot(&self, snapshot: Vec<Order>) {
        let mut orders = lock(&self.orders);
        let symbol = self.symbol.clone();
        orders
            .open
            .retain(|_, o| o.symbol != symbol || o.status == OrderStatus::Pending);
        let count = snapshot.len();
        for o in snapshot.into_iter().filter(|o| o.symbol == symbol) {
            orders.apply(o);
        }
        info!("📋 open-order snapshot applied: {} live", count);
    }

    pub fn live_order_count(&self) -> usize {
        lock(&self.orders)
            .open
            .values()
            .filter(|o| o.symbol == self.symbol && o.status.is_live())
            .count()
    }

    // ─── Position / balance ───

    pub fn apply_position(&self, position: Position) -> PositionChange {
        let mut positions = lock(&self.positions);
        let prev = positions
            .get(&position.symbol)
            .map(|p| p.qty)
            .unwrap_or(0.0);
        let next = position.qty;
        positions.insert(position.symbol.clone(), position);

        let flat = |q: f64| q.abs() < Position::EPSILON;
        match (flat(prev), flat(next)) {
            (true, false) => PositionChange::Opened { qty: next },
            (false, true) => PositionChange::Closed,
            (false, false) if (prev - next).abs() >= Position::EPSILON => PositionChange::Resized {
                from: prev,
                to: next,
            },
            _ => PositionChange::Unchanged,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        lock(&self.positions).get(symbol).cloned()
    }

    pub fn apply_balance(&self, balance: Balance) {
        *lock(&self.balance) = Some(balance);
    }

    pub fn balance(&self) -> Option<Balance> {
        *lock(&self.balance)
    }

    // ─── Links ───

    pub fn set_link(&self, kind: StreamKind, state: LinkState) {
        let mut links = lock(&self.links);
        let link = links.entry(kind).or_default();
        if link.state != state {
            debug!("🔌 {:?} link {:?} → {:?}", kind, link.state, state);
        }
        link.state = state;
    }

    pub fn set_stale(&self, kind: StreamKind, stale: bool) {
        let mut links = lock(&self.links);
        links.entry(kind).or_default().stale = stale;
    }

    pub fn is_stale(&self, kind: StreamKind) -> bool {
        lock(&self.links).get(&kind).map(|l| l.stale).unwrap_or(true)
    }

    /// Connection lost: keep everything, flag it stale. Depth seq restarts
    /// with the next session and the unconsumed price flag is dropped.
    pub fn mark_disconnected(&self, kind: StreamKind) {
        self.set_stale(kind, true);
        self.set_link(kind, LinkState::Disconnected);
        if kind == StreamKind::Market {
            let mut depth = lock(&self.depth);
            depth.seq = None;
            depth.updated = false;
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let orders = {
            let mut state = lock(&self.orders);
            state.expire_pending(self.pending_ttl);
            state
                .open
                .values()
                .filter(|o| o.symbol == self.symbol)
                .cloned()
                .collect()
        };
        CacheSnapshot {
            depth: lock(&self.depth).clone(),
            orders,
            position: self.position(&self.symbol),
            balance: self.balance(),
            market_stale: self.is_stale(StreamKind::Market),
            private_stale: self.is_stale(StreamKind::Private),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn depth(bid: f64, ask: f64, seq: u64) -> DepthUpdate {
        DepthUpdate {
            symbol: "BTC-USD".into(),
            best_bid: bid,
            best_ask: ask,
            seq: Some(seq),
        }
    }

    fn order(cl: &str, id: Option<&str>, side: Side, status: OrderStatus) -> Order {
        Order {
            cl_ord_id: Some(cl.to_string()),
            order_id: id.map(str::to_string),
            symbol: "BTC-USD".into(),
            side,
            price: 100.0,
            qty: 0.01,
            filled_qty: 0.0,
            status,
        }
    }

    fn store() -> StateStore {
        let s = StateStore::new("BTC-USD");
        s.set_stale(StreamKind::Private, false);
        s
    }

    #[test]
    fn price_flag_is_consumed_once() {
        let s = store();
        assert_eq!(s.take_price_update(), None);
        assert!(s.apply_depth(&depth(99.0, 101.0, 1)));
        assert_eq!(s.take_price_update(), Some(100.0));
        assert_eq!(s.take_price_update(), None);
    }

    #[test]
    fn depth_for_other_symbol_or_old_seq_is_dropped() {
        let s = store();
        assert!(s.apply_depth(&depth(99.0, 101.0, 5)));
        assert!(!s.apply_depth(&depth(98.0, 100.0, 4)));
        let mut other = depth(1.0, 2.0, 9);
        other.symbol = "ETH-USD".into();
        assert!(!s.apply_depth(&other));
        assert!((s.snapshot().depth.mid - 100.0).abs() < 1e-9);
    }

    #[test]
    fn market_disconnect_resets_seq_and_flag() {
        let s = store();
        s.apply_depth(&depth(99.0, 101.0, 50));
        s.mark_disconnected(StreamKind::Market);
        assert!(s.snapshot().market_stale);
        assert_eq!(s.take_price_update(), None);
        // New session restarts numbering
        assert!(s.apply_depth(&depth(99.0, 101.0, 1)));
        assert!(!s.snapshot().market_stale);
    }

    #[tokio::test]
    async fn await_price_update_wakes_on_next_push() {
        let s = std::sync::Arc::new(store());
        let s2 = s.clone();
        let waiter = tokio::spawn(async move { s2.await_price_update(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.apply_depth(&depth(199.0, 201.0, 1));
        assert_eq!(waiter.await.unwrap(), Some(200.0));
        // consumed by the waiter
        assert_eq!(s.take_price_update(), None);
    }

    #[tokio::test]
    async fn await_price_update_times_out() {
        let s = store();
        s.apply_depth(&depth(99.0, 101.0, 1));
        // An earlier, unconsumed push does not count as fresh
        assert_eq!(s.await_price_update(Duration::from_millis(20)).await, None);
    }

    #[test]
    fn pending_then_confirmed_then_terminal() {
        let s = store();
        let req = OrderRequest::limit("BTC-USD", Side::Buy, dec!(0.01), dec!(99.93));
        s.register_pending("c1", &req);
        let snap = s.snapshot();
        assert_eq!(snap.pending_count(), 1);
        assert_eq!(snap.live_count(), 0);

        assert_eq!(
            s.apply_order(order("c1", Some("7"), Side::Buy, OrderStatus::Open)),
            OrderApply::Updated { previous: OrderStatus::Pending }
        );
        assert_eq!(s.snapshot().live_orders(Side::Buy).len(), 1);

        assert_eq!(
            s.apply_order(order("c1", Some("7"), Side::Buy, OrderStatus::Canceled)),
            OrderApply::Removed { previous: Some(OrderStatus::Open) }
        );
        assert!(s.snapshot().orders.is_empty());
    }

    #[test]
    fn late_open_push_cannot_resurrect_terminal_order() {
        let s = store();
        s.apply_order(order("c1", Some("7"), Side::Sell, OrderStatus::Open));
        s.apply_order(order("c1", Some("7"), Side::Sell, OrderStatus::Filled));
        assert_eq!(
            s.apply_order(order("c1", Some("7"), Side::Sell, OrderStatus::Open)),
            OrderApply::IgnoredTerminal
        );
        // Also by venue id alone
        let mut by_id = order("zz", Some("7"), Side::Sell, OrderStatus::Open);
        by_id.cl_ord_id = None;
        assert_eq!(s.apply_order(by_id), OrderApply::IgnoredTerminal);
        assert!(s.snapshot().orders.is_empty());
    }

    #[test]
    fn push_matches_snapshot_entry_by_venue_id() {
        let s = store();
        let mut snap_order = order("x", Some("55"), Side::Buy, OrderStatus::Open);
        snap_order.cl_ord_id = None;
        s.apply_open_orders_snapshot(vec![snap_order]);
        s.apply_order(order("c9", Some("55"), Side::Buy, OrderStatus::PartiallyFilled));
        let snap = s.snapshot();
        assert_eq!(snap.orders.len(), 1);
        assert_eq!(snap.orders[0].cl_ord_id.as_deref(), Some("c9"));
        assert_eq!(snap.orders[0].status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn private_disconnect_keeps_orders_and_flags_stale() {
        let s = store();
        s.apply_order(order("b", Some("1"), Side::Buy, OrderStatus::Open));
        s.apply_order(order("a", Some("2"), Side::Sell, OrderStatus::Open));
        s.mark_disconnected(StreamKind::Private);

        let snap = s.snapshot();
        assert!(snap.private_stale);
        assert_eq!(snap.live_count(), 2);

        // Reconnected: fresh push supersedes, nothing was reset in between
        s.set_stale(StreamKind::Private, false);
        s.apply_order(order("b", Some("1"), Side::Buy, OrderStatus::Filled));
        let snap = s.snapshot();
        assert!(!snap.private_stale);
        assert_eq!(snap.live_count(), 1);
    }

    #[test]
    fn unconfirmed_pending_expires() {
        let s = StateStore::with_ttls("BTC-USD", Duration::ZERO, Duration::from_secs(60));
        let req = OrderRequest::limit("BTC-USD", Side::Sell, dec!(0.01), dec!(100.07));
        s.register_pending("c1", &req);
        assert!(s.snapshot().orders.is_empty());
    }

    #[test]
    fn rejected_placement_drops_pending() {
        let s = store();
        let req = OrderRequest::limit("BTC-USD", Side::Sell, dec!(0.01), dec!(100.07));
        s.register_pending("c1", &req);
        s.drop_pending("c1");
        assert!(s.snapshot().orders.is_empty());
        assert_eq!(
            s.apply_order(order("c1", Some("3"), Side::Sell, OrderStatus::Open)),
            OrderApply::IgnoredTerminal
        );
    }

    #[test]
    fn position_transitions() {
        let s = store();
        let pos = |q: f64| Position {
            symbol: "BTC-USD".into(),
            qty: q,
            entry_price: 100.0,
            leverage: Some(10),
            margin_mode: Some("cross".into()),
            realized_pnl: 0.0,
        };
        assert_eq!(s.apply_position(pos(0.0)), PositionChange::Unchanged);
        assert_eq!(s.apply_position(pos(0.01)), PositionChange::Opened { qty: 0.01 });
        assert_eq!(s.apply_position(pos(0.02)), PositionChange::Resized { from: 0.01, to: 0.02 });
        assert_eq!(s.apply_position(pos(0.0)), PositionChange::Closed);
        assert!((s.snapshot().position_qty()).abs() < 1e-12);
    }
}
