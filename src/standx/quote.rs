//! Quote pricing and the requote trigger.

use std::fmt;

use rust_decimal::Decimal;

use super::cache::CacheSnapshot;
use super::mode::BpsBand;
use super::types::{to_decimal, Side};

const BPS: f64 = 10_000.0;

/// Bid/ask pair, already rounded for the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Symmetric quote `target_bps` away from `mid`. None for unusable inputs.
pub fn quote_prices(mid: f64, target_bps: f64, price_decimals: u32) -> Option<Quote> {
    if !(mid.is_finite() && mid > 0.0) || !(0.0..BPS).contains(&target_bps) {
        return None;
    }
    let bid = to_decimal(mid * (1.0 - target_bps / BPS), price_decimals)?;
    let ask = to_decimal(mid * (1.0 + target_bps / BPS), price_decimals)?;
    (bid > Decimal::ZERO && bid < ask).then_some(Quote { bid, ask })
}

/// `|mid − price| / mid × 10000`.
pub fn deviation_bps(mid: f64, price: f64) -> f64 {
    if mid <= 0.0 {
        return f64::INFINITY;
    }
    (mid - price).abs() / mid * BPS
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequoteReason {
    /// Nothing resting on this side.
    MissingSide(Side),
    /// More than one order resting on this side.
    DuplicateSide(Side),
    /// Resting order drifted outside the band.
    OutOfBand { side: Side, price: f64, bps: f64 },
    /// Mode switched; quotes move to the new band.
    ModeChange,
}

impl fmt::Display for RequoteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequoteReason::MissingSide(s) => write!(f, "no {s} order"),
            RequoteReason::DuplicateSide(s) => write!(f, "multiple {s} orders"),
            RequoteReason::OutOfBand { side, price, bps } => {
                write!(f, "{side} @ {price} is {bps:.2} bps from mid")
            }
            RequoteReason::ModeChange => f.write_str("mode change"),
        }
    }
}

/// First reason the resting quotes no longer fit `band` around `mid`.
pub fn requote_reason(snapshot: &CacheSnapshot, mid: f64, band: &BpsBand) -> Option<RequoteReason> {
    for side in [Side::Buy, Side::Sell] {
        let live = snapshot.live_orders(side);
        match live.as_slice() {
            [] => return Some(RequoteReason::MissingSide(side)),
            [order] => {
                let bps = deviation_bps(mid, order.price);
                if !band.contains(bps) {
                    return Some(RequoteReason::OutOfBand {
                        side,
                        price: order.price,
                        bps,
                    });
                }
            }
            _ => return Some(RequoteReason::DuplicateSide(side)),
        }
    }
    None
}
