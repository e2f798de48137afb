//! What the strategy loop needs from a venue connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheSnapshot;
use super::correlation::CommandHandle;
use super::stream::{AdapterError, StreamAdapter};
use super::types::{Order, OrderRequest};

pub trait Venue: Send + Sync {
    fn symbol(&self) -> &str;

    /// Point-in-time copy of the cached state.
    fn snapshot(&self) -> CacheSnapshot;

    /// Mid of the newest depth push, once per push.
    fn take_price_update(&self) -> Option<f64>;

    /// Wait for the next depth push.
    fn await_price_update(&self, timeout: Duration) -> impl Future<Output = Option<f64>> + Send;

    fn send_order(&self, req: &OrderRequest) -> Result<CommandHandle, AdapterError>;

    fn cancel_order(&self, order: &Order) -> Result<CommandHandle, AdapterError>;

    /// Available balance, polled when possible.
    fn refresh_balance(&self) -> impl Future<Output = Option<f64>> + Send;
}

impl Venue for StreamAdapter {
    fn symbol(&self) -> &str {
        StreamAdapter::symbol(self)
    }

    fn snapshot(&self) -> CacheSnapshot {
        StreamAdapter::snapshot(self)
    }

    fn take_price_update(&self) -> Option<f64> {
        StreamAdapter::take_price_update(self)
    }

    fn await_price_update(&self, timeout: Duration) -> impl Future<Output = Option<f64>> + Send {
        StreamAdapter::await_price_update(self, timeout)
    }

    fn send_order(&self, req: &OrderRequest) -> Result<CommandHandle, AdapterError> {
        StreamAdapter::send_order(self, req)
    }

    fn cancel_order(&self, order: &Order) -> Result<CommandHandle, AdapterError> {
        StreamAdapter::cancel_order(self, order)
    }

    fn refresh_balance(&self) -> impl Future<Output = Option<f64>> + Send {
        StreamAdapter::refresh_balance(self)
    }
}

impl<T: Venue> Venue for Arc<T> {
    fn symbol(&self) -> &str {
        (**self).symbol()
    }

    fn snapshot(&self) -> CacheSnapshot {
        (**self).snapshot()
    }

    fn take_price_update(&self) -> Option<f64> {
        (**self).take_price_update()
    }

    fn await_price_update(&self, timeout: Duration) -> impl Future<Output = Option<f64>> + Send {
        (**self).await_price_update(timeout)
    }

    fn send_order(&self, req: &OrderRequest) -> Result<CommandHandle, AdapterError> {
        (**self).send_order(req)
    }

    fn cancel_order(&self, order: &Order) -> Result<CommandHandle, AdapterError> {
        (**self).cancel_order(order)
    }

    fn refresh_balance(&self) -> impl Future<Output = Option<f64>> + Send {
        (**self).refresh_balance()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::standx::correlation::CommandOutcome;
    use crate::standx::types::{DepthBook, OrderStatus, Position};

    /// How the mock answers a placement.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum PlaceBehavior {
        /// Order rests immediately.
        Confirm,
        /// No confirmation ever arrives; the order stays pending.
        Silent,
        Reject,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Place(OrderRequest),
        Cancel(Order),
    }

    #[derive(Debug)]
    pub struct MockState {
        pub orders: Vec<Order>,
        pub position: Option<Position>,
        pub balance: Option<f64>,
        pub mid: Option<f64>,
        pub updated: bool,
        /// When false, waiting for the next depth push always times out.
        pub fresh_prices: bool,
        pub private_stale: bool,
        pub place: PlaceBehavior,
        /// Market fills fully flatten the position.
        pub fill_market_orders: bool,
        pub sent: Vec<Sent>,
        next_id: u64,
    }

    /// Scriptable in-memory venue that records every command.
    #[derive(Debug, Clone)]
    pub struct MockVenue {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockVenue {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    orders: vec![],
                    position: None,
                    balance: Some(1_000.0),
                    mid: None,
                    updated: false,
                    fresh_prices: true,
                    private_stale: false,
                    place: PlaceBehavior::Confirm,
                    fill_market_orders: false,
                    sent: vec![],
                    next_id: 1,
                })),
            }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        /// Simulate a depth push.
        pub fn push_mid(&self, mid: f64) {
            self.with(|s| {
                s.mid = Some(mid);
                s.updated = true;
            });
        }

        pub fn set_position(&self, qty: f64) {
            self.with(|s| {
                s.position = Some(Position {
                    symbol: "BTC-USD".into(),
                    qty,
                    entry_price: 100.0,
                    leverage: None,
                    margin_mode: None,
                    realized_pnl: 0.0,
                })
            });
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.with(|s| s.sent.clone())
        }

        pub fn clear_sent(&self) {
            self.with(|s| s.sent.clear());
        }

        pub fn placements(&self) -> Vec<OrderRequest> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Place(r) => Some(r),
                    _ => None,
                })
                .collect()
        }

        pub fn cancels(&self) -> usize {
            self.sent()
                .iter()
                .filter(|s| matches!(s, Sent::Cancel(_)))
                .count()
        }
    }

    impl Venue for MockVenue {
        fn symbol(&self) -> &str {
            "BTC-USD"
        }

        fn snapshot(&self) -> CacheSnapshot {
            self.with(|s| {
                let mut depth = DepthBook::empty("BTC-USD");
                if let Some(mid) = s.mid {
                    depth.best_bid = mid - 0.01;
                    depth.best_ask = mid + 0.01;
                    depth.mid = mid;
                    depth.updated = s.updated;
                }
                CacheSnapshot {
                    depth,
                    orders: s.orders.clone(),
                    position: s.position.clone(),
                    balance: None,
                    market_stale: s.mid.is_none(),
                    private_stale: s.private_stale,
                }
            })
        }

        fn take_price_update(&self) -> Option<f64> {
            self.with(|s| {
                if s.updated {
                    s.updated = false;
                    s.mid
                } else {
                    None
                }
            })
        }

        fn await_price_update(&self, _timeout: Duration) -> impl Future<Output = Option<f64>> + Send {
            // A fresh push is always "about to arrive" when a price exists.
            let mid = self.with(|s| {
                s.updated = false;
                s.mid.filter(|_| s.fresh_prices)
            });
            async move { mid }
        }

        fn send_order(&self, req: &OrderRequest) -> Result<CommandHandle, AdapterError> {
            self.with(|s| {
                if s.private_stale {
                    return Err(AdapterError::Disconnected);
                }
                s.sent.push(Sent::Place(req.clone()));
                let cl = format!("cl{}", s.next_id);
                let id = s.next_id.to_string();
                s.next_id += 1;

                if req.reduce_only && s.fill_market_orders {
                    s.position = None;
                    return Ok(CommandHandle::ready(&cl, CommandOutcome::Confirmed));
                }
                let price = req
                    .price
                    .map(|p| p.to_string().parse::<f64>().unwrap_or(0.0))
                    .unwrap_or(0.0);
                let qty = req.qty.to_string().parse::<f64>().unwrap_or(0.0);
                let mut order = Order {
                    cl_ord_id: Some(cl.clone()),
                    order_id: None,
                    symbol: req.symbol.clone(),
                    side: req.side,
                    price,
                    qty,
                    filled_qty: 0.0,
                    status: OrderStatus::Pending,
                };
                match s.place {
                    PlaceBehavior::Confirm => {
                        if req.price.is_some() {
                            order.order_id = Some(id);
                            order.status = OrderStatus::Open;
                            s.orders.push(order);
                        }
                        Ok(CommandHandle::ready(&cl, CommandOutcome::Confirmed))
                    }
                    PlaceBehavior::Silent => {
                        s.orders.push(order);
                        // Sender dropped right away: the handle settles as Unknown.
                        let (_tx, handle) = CommandHandle::detached(&cl, Duration::from_millis(5));
                        Ok(handle)
                    }
                    PlaceBehavior::Reject => Ok(CommandHandle::ready(
                        &cl,
                        CommandOutcome::Rejected {
                            code: 400,
                            message: "rejected".into(),
                        },
                    )),
                }
            })
        }

        fn cancel_order(&self, order: &Order) -> Result<CommandHandle, AdapterError> {
            self.with(|s| {
                let idx = s
                    .orders
                    .iter()
                    .position(|o| o.cl_ord_id == order.cl_ord_id && o.status.is_live());
                let Some(idx) = idx else {
                    return Ok(CommandHandle::ready("skip", CommandOutcome::Skipped));
                };
                if s.private_stale {
                    return Err(AdapterError::Disconnected);
                }
                s.sent.push(Sent::Cancel(order.clone()));
                s.orders.remove(idx);
                Ok(CommandHandle::ready("cancel", CommandOutcome::Confirmed))
            })
        }

        fn refresh_balance(&self) -> impl Future<Output = Option<f64>> + Send {
            let balance = self.with(|s| s.balance);
            async move { balance }
        }
    }
}
