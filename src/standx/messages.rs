//! Stream wire format.
//!
//! Inbound frames are `{seq, channel, symbol, data}` pushes, the auth reply
//! and command replies `{code, message, request_id}`. Everything is decoded
//! into [`StreamEvent`] before it touches the cache.

use serde_json::{json, Value};
use tracing::debug;

use super::auth::SignedRequest;
use super::types::{
    parse_f64_field, parse_f64_value, parse_id_field, Balance, Order, OrderStatus, Position, Side,
};

pub const CHANNEL_DEPTH: &str = "depth_book";
pub const CHANNEL_ORDER: &str = "order";
pub const CHANNEL_POSITION: &str = "position";
pub const CHANNEL_BALANCE: &str = "balance";
pub const PRIVATE_CHANNELS: [&str; 3] = [CHANNEL_ORDER, CHANNEL_POSITION, CHANNEL_BALANCE];

pub const METHOD_NEW_ORDER: &str = "order:new";
pub const METHOD_CANCEL_ORDER: &str = "order:cancel";

#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub seq: Option<u64>,
}

impl DepthUpdate {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Depth(DepthUpdate),
    Order(Order),
    Position(Position),
    Balance(Balance),
    Auth { ok: bool, code: i64, message: String },
    CommandReply { request_id: String, code: i64, message: String },
}

/// The venue reports success as 0 on the stream and 200 on some replies.
pub fn code_ok(code: i64) -> bool {
    code == 0 || code == 200
}

// ─────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────

/// Decode one text frame. Unknown or malformed frames decode to nothing.
pub fn parse_frame(text: &str) -> Vec<StreamEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            debug!("📭 non-JSON frame ignored: {}", text.chars().take(64).collect::<String>());
            return vec![];
        }
    };

    // Batched frames
    if let Some(items) = value.as_array() {
        return items.iter().flat_map(parse_value).collect();
    }
    parse_value(&value)
}

fn parse_value(value: &Value) -> Vec<StreamEvent> {
    if let Some(auth) = value.get("auth") {
        return vec![auth_event(auth)];
    }

    let channel = value.get("channel").and_then(|v| v.as_str()).unwrap_or_default();
    let data = value.get("data").unwrap_or(&Value::Null);

    match channel {
        "auth" => vec![auth_event(data)],
        CHANNEL_DEPTH => parse_depth(value, data).map(StreamEvent::Depth).into_iter().collect(),
        CHANNEL_ORDER => for_each_item(data, |v| parse_order(v).map(StreamEvent::Order)),
        CHANNEL_POSITION => for_each_item(data, |v| parse_position(v).map(StreamEvent::Position)),
        CHANNEL_BALANCE => parse_balance(data).map(StreamEvent::Balance).into_iter().collect(),
        "" => parse_command_reply(value).into_iter().collect(),
        other => {
            debug!("📭 unhandled channel {}", other);
            vec![]
        }
    }
}

fn for_each_item(data: &Value, f: impl Fn(&Value) -> Option<StreamEvent>) -> Vec<StreamEvent> {
    match data.as_array() {
        Some(items) => items.iter().filter_map(&f).collect(),
        None => f(data).into_iter().collect(),
    }
}

fn auth_event(v: &Value) -> StreamEvent {
    let code = v.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
    let message = v
        .get("msg")
        .or_else(|| v.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    StreamEvent::Auth {
        ok: code_ok(code),
        code,
        message,
    }
}

fn parse_command_reply(v: &Value) -> Option<StreamEvent> {
    let request_id = parse_id_field(v, "request_id")?;
    let code = v.get("code").and_then(|c| c.as_i64())?;
    let message = v
        .get("message")
        .or_else(|| v.get("msg"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    Some(StreamEvent::CommandReply {
        request_id,
        code,
        message,
    })
}

/// Best bid = highest bid price, best ask = lowest ask price. Levels are not
/// assumed sorted. One-sided books produce no update.
fn parse_depth(frame: &Value, data: &Value) -> Option<DepthUpdate> {
    let symbol = frame
        .get("symbol")
        .or_else(|| data.get("symbol"))
        .and_then(|s| s.as_str())?
        .to_string();

    let best = |key: &str, pick: fn(f64, f64) -> f64| -> Option<f64> {
        data.get(key)?
            .as_array()?
            .iter()
            .filter_map(|lvl| {
                let lvl = lvl.as_array()?;
                let px = parse_f64_value(lvl.first()?)?;
                let qty = lvl.get(1).and_then(parse_f64_value).unwrap_or(1.0);
                (px > 0.0 && qty > 0.0).then_some(px)
            })
            .reduce(pick)
    };

    let best_bid = best("bids", f64::max)?;
    let best_ask = best("asks", f64::min)?;
    let seq = frame.get("seq").and_then(|s| s.as_u64());

    Some(DepthUpdate {
        symbol,
        best_bid,
        best_ask,
        seq,
    })
}

pub fn parse_order(v: &Value) -> Option<Order> {
    let side = v.get("side").and_then(|s| s.as_str()).and_then(Side::parse)?;
    let symbol = v.get("symbol").and_then(|s| s.as_str())?.to_string();
    let cl_ord_id = parse_id_field(v, "cl_ord_id");
    let order_id = parse_id_field(v, "id").or_else(|| parse_id_field(v, "order_id"));
    if cl_ord_id.is_none() && order_id.is_none() {
        return None;
    }
    let status = v
        .get("status")
        .and_then(|s| s.as_str())
        .map(OrderStatus::from_venue)
        .unwrap_or(OrderStatus::Open);

    Some(Order {
        cl_ord_id,
        order_id,
        symbol,
        side,
        price: parse_f64_field(v, "price").unwrap_or(0.0),
        qty: parse_f64_field(v, "qty").unwrap_or(0.0),
        filled_qty: parse_f64_field(v, "fill_qty")
            .or_else(|| parse_f64_field(v, "filled_qty"))
            .unwrap_or(0.0),
        status,
    })
}

pub fn parse_position(v: &Value) -> Option<Position> {
    Some(Position {
        symbol: v.get("symbol").and_then(|s| s.as_str())?.to_string(),
        qty: parse_f64_field(v, "qty")?,
        entry_price: parse_f64_field(v, "entry_price").unwrap_or(0.0),
        leverage: parse_f64_field(v, "leverage").map(|l| l.round() as u32),
        margin_mode: v
            .get("margin_mode")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        realized_pnl: parse_f64_field(v, "realized_pnl").unwrap_or(0.0),
    })
}

/// Available margin prefers `cross_available`, then `available`, then the raw
/// `balance`.
pub fn parse_balance(v: &Value) -> Option<Balance> {
    let raw_balance = parse_f64_field(v, "balance");
    let available = parse_f64_field(v, "cross_available")
        .or_else(|| parse_f64_field(v, "available"))
        .or(raw_balance)?;
    let equity = parse_f64_field(v, "equity")
        .or(raw_balance)
        .unwrap_or(available);
    Some(Balance { available, equity })
}

// ─────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────

pub fn subscribe_frame(channel: &str, symbol: &str) -> String {
    json!({ "subscribe": { "channel": channel, "symbol": symbol } }).to_string()
}

pub fn auth_frame(token: &str, channels: &[&str]) -> String {
    let streams: Vec<Value> = channels.iter().map(|c| json!({ "channel": c })).collect();
    json!({ "auth": { "token": token, "streams": streams } }).to_string()
}

/// Signed command; `params` is the signed body string, unmodified.
pub fn command_frame(method: &str, signed: &SignedRequest) -> String {
    json!({
        "method": method,
        "request_id": signed.request_id,
        "header": signed.stream_header(),
        "params": signed.body,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_uses_true_best_levels_regardless_of_order() {
        let frame = r#"{"seq":12,"channel":"depth_book","symbol":"BTC-USD","data":{
            "bids":[["99.5","1"],["99.9","0.2"],["99.7","0"]],
            "asks":[["100.4","1"],["100.1","3"]]}}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 1);
        let StreamEvent::Depth(d) = &events[0] else { panic!("expected depth") };
        assert_eq!(d.symbol, "BTC-USD");
        assert_eq!(d.seq, Some(12));
        assert!((d.best_bid - 99.9).abs() < 1e-9);
        assert!((d.best_ask - 100.1).abs() < 1e-9);
        assert!((d.mid() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_yields_nothing() {
        let frame = r#"{"channel":"depth_book","symbol":"BTC-USD","data":{"bids":[["99","1"]],"asks":[]}}"#;
        assert!(parse_frame(frame).is_empty());
    }

    #[test]
    fn order_push_with_numeric_id() {
        let frame = r#"{"seq":3,"channel":"order","data":{"id":9912,"cl_ord_id":"abc","symbol":"BTC-USD",
            "side":"sell","status":"partially_filled","qty":"0.02","price":"100.08","fill_qty":"0.01"}}"#;
        let events = parse_frame(frame);
        let StreamEvent::Order(o) = &events[0] else { panic!("expected order") };
        assert_eq!(o.order_id.as_deref(), Some("9912"));
        assert_eq!(o.cl_ord_id.as_deref(), Some("abc"));
        assert_eq!(o.side, Side::Sell);
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!((o.remaining_qty() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn batched_position_push() {
        let frame = r#"{"channel":"position","data":[
            {"symbol":"BTC-USD","qty":"0.01","entry_price":"100","leverage":"10","margin_mode":"cross","realized_pnl":"0"},
            {"symbol":"ETH-USD","qty":"0"}]}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 2);
        let StreamEvent::Position(p) = &events[0] else { panic!("expected position") };
        assert_eq!(p.leverage, Some(10));
        assert_eq!(p.margin_mode.as_deref(), Some("cross"));
    }

    #[test]
    fn balance_prefers_cross_available() {
        let b = parse_balance(&json!({"balance":"150","cross_available":"120.5"})).unwrap();
        assert!((b.available - 120.5).abs() < 1e-9);
        assert!((b.equity - 150.0).abs() < 1e-9);
        let b = parse_balance(&json!({"balance": 80})).unwrap();
        assert!((b.available - 80.0).abs() < 1e-9);
        assert!(parse_balance(&json!({})).is_none());
    }

    #[test]
    fn auth_replies_in_both_shapes() {
        let a = parse_frame(r#"{"channel":"auth","data":{"code":0,"msg":"success"}}"#);
        assert_eq!(a, vec![StreamEvent::Auth { ok: true, code: 0, message: "success".into() }]);
        let b = parse_frame(r#"{"auth":{"code":401,"msg":"invalid token"}}"#);
        assert!(matches!(&b[0], StreamEvent::Auth { ok: false, code: 401, .. }));
    }

    #[test]
    fn command_reply_decodes() {
        let r = parse_frame(r#"{"code":400,"message":"insufficient margin","request_id":"r-1"}"#);
        assert_eq!(
            r,
            vec![StreamEvent::CommandReply { request_id: "r-1".into(), code: 400, message: "insufficient margin".into() }]
        );
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(parse_frame("pong").is_empty());
        assert!(parse_frame(r#"{"channel":"trades","data":{}}"#).is_empty());
        assert!(parse_frame(r#"{"channel":"order","data":{"symbol":"BTC-USD","side":"buy"}}"#).is_empty());
    }

    #[test]
    fn outbound_frames() {
        assert_eq!(
            subscribe_frame(CHANNEL_DEPTH, "BTC-USD"),
            r#"{"subscribe":{"channel":"depth_book","symbol":"BTC-USD"}}"#
        );
        let auth: Value = serde_json::from_str(&auth_frame("tok", &PRIVATE_CHANNELS)).unwrap();
        assert_eq!(auth["auth"]["token"], "tok");
        assert_eq!(auth["auth"]["streams"][2]["channel"], "balance");
    }
}
