use std::fmt;
use std::time::Instant;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        if raw.eq_ignore_ascii_case("buy") || raw.eq_ignore_ascii_case("bid") {
            Some(Side::Buy)
        } else if raw.eq_ignore_ascii_case("sell") || raw.eq_ignore_ascii_case("ask") {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Alo,
}

/// 订单状态. Every transition after `Pending` comes from a venue push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Map the venue's status strings. Unknown strings are treated as open so
    /// the order stays visible until a terminal push arrives.
    pub fn from_venue(raw: &str) -> OrderStatus {
        match raw.to_ascii_lowercase().as_str() {
            "new" | "open" | "untriggered" => OrderStatus::Open,
            "partially_filled" | "partial_filled" | "partially-filled" => {
                OrderStatus::PartiallyFilled
            }
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" | "expired" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    /// Resting on the book (confirmed and not yet terminal).
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Client request id, echoed back by the venue as `cl_ord_id`.
    pub cl_ord_id: Option<String>,
    /// Venue order id, assigned asynchronously.
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub filled_qty: f64,
    pub status: OrderStatus,
}

impl Order {
    /// Cache key: the client id when we have one, the venue id otherwise.
    pub fn key(&self) -> Option<String> {
        self.cl_ord_id
            .clone()
            .or_else(|| self.order_id.as_ref().map(|id| format!("id:{id}")))
    }

    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity; positive is long.
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: Option<u32>,
    pub margin_mode: Option<String>,
    pub realized_pnl: f64,
}

impl Position {
    pub const EPSILON: f64 = 1e-12;

    pub fn is_flat(&self) -> bool {
        self.qty.abs() < Self::EPSILON
    }

    /// Side of the reduce-only order that closes this position.
    pub fn closing_side(&self) -> Side {
        if self.qty > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Balance {
    /// Margin available for new orders; drives mode selection.
    pub available: f64,
    pub equity: f64,
}

/// Top-of-book view for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthBook {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub seq: Option<u64>,
    pub received_at: Option<Instant>,
    /// Set on every accepted push, cleared when the strategy consumes it.
    pub updated: bool,
}

impl DepthBook {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            best_bid: 0.0,
            best_ask: 0.0,
            mid: 0.0,
            seq: None,
            received_at: None,
            updated: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.best_bid > 0.0 && self.best_ask > 0.0 && self.mid > 0.0
    }
}

/// What the strategy asks the venue to place.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub margin_mode: Option<String>,
    pub leverage: Option<u32>,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: Side, qty: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            margin_mode: None,
            leverage: None,
        }
    }

    /// Reduce-only IOC market order, used to flatten inventory.
    pub fn reduce_only_market(symbol: &str, side: Side, qty: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: true,
            margin_mode: None,
            leverage: None,
        }
    }

    pub fn with_margin(mut self, margin_mode: Option<String>, leverage: Option<u32>) -> Self {
        self.margin_mode = margin_mode;
        self.leverage = leverage;
        self
    }

    pub fn body(&self, cl_ord_id: &str) -> NewOrderBody {
        NewOrderBody {
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            qty: self.qty.to_string(),
            price: self.price.map(|p| p.to_string()),
            time_in_force: self.time_in_force,
            reduce_only: self.reduce_only,
            margin_mode: self.margin_mode.clone(),
            leverage: self.leverage,
            cl_ord_id: cl_ord_id.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Wire bodies (field order is the canonical signing order)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NewOrderBody {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    pub cl_ord_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cl_ord_id: Option<String>,
}

impl CancelOrderBody {
    pub fn for_order(order: &Order) -> Self {
        // Venue ids are numeric; fall back to the client id when we only have that.
        let order_id = order.order_id.as_ref().and_then(|id| id.parse::<u64>().ok());
        Self {
            order_id,
            cl_ord_id: if order_id.is_none() {
                order.cl_ord_id.clone()
            } else {
                None
            },
        }
    }
}

// ─────────────────────────────────────────────────────────
// Number helpers
// ─────────────────────────────────────────────────────────

/// Round to `dp` decimals for the wire (half away from zero).
pub fn to_decimal(value: f64, dp: u32) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero).normalize())
}

/// Numeric field that the venue may send as a JSON string or number.
pub fn parse_f64_field(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(parse_f64_value)
}

pub fn parse_f64_value(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

/// Id field that may be numeric or textual.
pub fn parse_id_field(val: &Value, field: &str) -> Option<String> {
    match val.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn status_mapping_and_terminality() {
        assert_eq!(OrderStatus::from_venue("new"), OrderStatus::Open);
        assert_eq!(
            OrderStatus::from_venue("PARTIALLY_FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert!(OrderStatus::from_venue("cancelled").is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Pending.is_live());
        assert!(OrderStatus::PartiallyFilled.is_live());
    }

    #[test]
    fn decimal_rounding_for_wire() {
        assert_eq!(to_decimal(99.925, 3), Some(dec!(99.925)));
        assert_eq!(to_decimal(100.0749999, 2), Some(dec!(100.07)));
        assert_eq!(to_decimal(0.01, 4), Some(dec!(0.01)));
        assert_eq!(to_decimal(f64::NAN, 2), None);
    }

    #[test]
    fn order_body_serializes_compact_in_field_order() {
        let req = OrderRequest::limit("BTC-USD", Side::Buy, dec!(0.01), dec!(99.93))
            .with_margin(Some("cross".into()), Some(10));
        let body = serde_json::to_string(&req.body("abc")).unwrap();
        assert_eq!(
            body,
            r#"{"symbol":"BTC-USD","side":"buy","order_type":"limit","qty":"0.01","price":"99.93","time_in_force":"gtc","reduce_only":false,"margin_mode":"cross","leverage":10,"cl_ord_id":"abc"}"#
        );
    }

    #[test]
    fn market_flatten_body_omits_price() {
        let req = OrderRequest::reduce_only_market("BTC-USD", Side::Sell, dec!(0.01));
        let body = serde_json::to_value(req.body("x")).unwrap();
        assert!(body.get("price").is_none());
        assert_eq!(body["reduce_only"], json!(true));
        assert_eq!(body["time_in_force"], json!("ioc"));
        assert_eq!(body["order_type"], json!("market"));
    }

    #[test]
    fn cancel_body_prefers_numeric_venue_id() {
        let mut order = Order {
            cl_ord_id: Some("c1".into()),
            order_id: Some("42".into()),
            symbol: "BTC-USD".into(),
            side: Side::Buy,
            price: 1.0,
            qty: 1.0,
            filled_qty: 0.0,
            status: OrderStatus::Open,
        };
        let body = serde_json::to_string(&CancelOrderBody::for_order(&order)).unwrap();
        assert_eq!(body, r#"{"order_id":42}"#);

        order.order_id = None;
        let body = serde_json::to_string(&CancelOrderBody::for_order(&order)).unwrap();
        assert_eq!(body, r#"{"cl_ord_id":"c1"}"#);
    }

    #[test]
    fn numeric_fields_accept_strings_and_numbers() {
        let v = json!({"a": "1.5", "b": 2, "id": 77, "s": "x"});
        assert_eq!(parse_f64_field(&v, "a"), Some(1.5));
        assert_eq!(parse_f64_field(&v, "b"), Some(2.0));
        assert_eq!(parse_id_field(&v, "id").as_deref(), Some("77"));
        assert_eq!(parse_id_field(&v, "s").as_deref(), Some("x"));
        assert_eq!(parse_id_field(&v, "missing"), None);
    }

    #[test]
    fn closing_side_is_opposite_of_exposure() {
        let mut p = Position {
            symbol: "BTC-USD".into(),
            qty: 0.01,
            entry_price: 100.0,
            leverage: None,
            margin_mode: None,
            realized_pnl: 0.0,
        };
        assert_eq!(p.closing_side(), Side::Sell);
        p.qty = -0.02;
        assert_eq!(p.closing_side(), Side::Buy);
        p.qty = 0.0;
        assert!(p.is_flat());
    }
}
