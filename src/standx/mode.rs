//! Balance-driven degradation policy.
//!
//! Three quoting modes, each with its own bps band. The band widens as the
//! available balance shrinks so a thin account quotes further from mid.

use std::fmt;

/// Quote distance from mid, in basis points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpsBand {
    /// Where new quotes are placed.
    pub target: f64,
    /// Closer than this → requote.
    pub min: f64,
    /// Further than this → requote.
    pub max: f64,
}

impl BpsBand {
    pub const fn new(target: f64, min: f64, max: f64) -> Self {
        Self { target, min, max }
    }

    pub fn contains(&self, bps: f64) -> bool {
        bps >= self.min && bps <= self.max
    }

    pub fn is_valid(&self) -> bool {
        self.min >= 0.0 && self.min <= self.target && self.target <= self.max
    }

    /// Parse `"target,min,max"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<f64> = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [target, min, max] => Some(Self::new(*target, *min, *max)).filter(BpsBand::is_valid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Normal,
    Degraded1,
    Degraded2,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Normal => "normal",
            Mode::Degraded1 => "degraded-1",
            Mode::Degraded2 => "degraded-2",
        })
    }
}

/// Thresholds plus one band per mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeTable {
    /// Balance at or above → normal.
    pub threshold_1: f64,
    /// Balance at or above (and below t1) → degraded-1.
    pub threshold_2: f64,
    pub normal: BpsBand,
    pub degraded_1: BpsBand,
    pub degraded_2: BpsBand,
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            threshold_1: 100.0,
            threshold_2: 50.0,
            normal: BpsBand::new(7.5, 5.0, 10.0),
            degraded_1: BpsBand::new(15.0, 10.0, 20.0),
            degraded_2: BpsBand::new(30.0, 20.0, 40.0),
        }
    }
}

impl ModeTable {
    /// Total over every input; NaN lands in the most defensive mode.
    pub fn for_balance(&self, balance: f64) -> Mode {
        if balance >= self.threshold_1 {
            Mode::Normal
        } else if balance >= self.threshold_2 {
            Mode::Degraded1
        } else {
            Mode::Degraded2
        }
    }

    pub fn band(&self, mode: Mode) -> BpsBand {
        match mode {
            Mode::Normal => self.normal,
            Mode::Degraded1 => self.degraded_1,
            Mode::Degraded2 => self.degraded_2,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.threshold_1 > self.threshold_2
            && self.normal.is_valid()
            && self.degraded_1.is_valid()
            && self.degraded_2.is_valid()
    }

    pub fn from_env() -> Self {
        let mut t = Self::default();
        if let Ok(v) = std::env::var("LIMIT_ORDER_BPS") { if let Ok(f) = v.parse() { t.normal.target = f; } }
        if let Ok(v) = std::env::var("MM_MIN_BPS")      { if let Ok(f) = v.parse() { t.normal.min = f; } }
        if let Ok(v) = std::env::var("MAX_ORDER_BPS")   { if let Ok(f) = v.parse() { t.normal.max = f; } }
        if let Ok(v) = std::env::var("MM_DEGRADED1_BPS") { if let Some(b) = BpsBand::parse(&v) { t.degraded_1 = b; } }
        if let Ok(v) = std::env::var("MM_DEGRADED2_BPS") { if let Some(b) = BpsBand::parse(&v) { t.degraded_2 = b; } }
        if let Ok(v) = std::env::var("MM_BALANCE_THRESHOLD_1") { if let Ok(f) = v.parse() { t.threshold_1 = f; } }
        if let Ok(v) = std::env::var("MM_BALANCE_THRESHOLD_2") { if let Ok(f) = v.parse() { t.threshold_2 = f; } }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank(m: Mode) -> u8 {
        match m {
            Mode::Normal => 0,
            Mode::Degraded1 => 1,
            Mode::Degraded2 => 2,
        }
    }

    #[test]
    fn boundaries_are_inclusive_on_the_upper_mode() {
        let t = ModeTable::default();
        assert_eq!(t.for_balance(100.0), Mode::Normal);
        assert_eq!(t.for_balance(99.999), Mode::Degraded1);
        assert_eq!(t.for_balance(50.0), Mode::Degraded1);
        assert_eq!(t.for_balance(49.999), Mode::Degraded2);
    }

    #[test]
    fn total_over_odd_inputs() {
        let t = ModeTable::default();
        assert_eq!(t.for_balance(f64::NAN), Mode::Degraded2);
        assert_eq!(t.for_balance(-1.0), Mode::Degraded2);
        assert_eq!(t.for_balance(0.0), Mode::Degraded2);
        assert_eq!(t.for_balance(f64::INFINITY), Mode::Normal);
        assert_eq!(t.for_balance(f64::NEG_INFINITY), Mode::Degraded2);
    }

    #[test]
    fn lower_balance_never_improves_mode() {
        let t = ModeTable::default();
        let mut prev = t.for_balance(1_000.0);
        let mut b = 1_000.0;
        while b > -10.0 {
            let m = t.for_balance(b);
            assert!(rank(m) >= rank(prev), "balance {b}: {m} after {prev}");
            prev = m;
            b -= 0.5;
        }
    }

    #[test]
    fn balance_drop_crosses_into_degraded_1() {
        let t = ModeTable::default();
        assert_eq!(t.for_balance(120.0), Mode::Normal);
        assert_eq!(t.for_balance(85.0), Mode::Degraded1);
        assert_eq!(t.band(Mode::Degraded1), BpsBand::new(15.0, 10.0, 20.0));
    }

    #[test]
    fn band_parse() {
        assert_eq!(BpsBand::parse("15, 10, 20"), Some(BpsBand::new(15.0, 10.0, 20.0)));
        assert_eq!(BpsBand::parse("15,10"), None);
        assert_eq!(BpsBand::parse("15,x,20"), None);
        // target outside [min, max]
        assert_eq!(BpsBand::parse("25,10,20"), None);
    }

    #[test]
    fn band_contains_edges() {
        let b = BpsBand::new(7.5, 5.0, 10.0);
        assert!(b.contains(5.0));
        assert!(b.contains(10.0));
        assert!(!b.contains(4.99));
        assert!(!b.contains(10.01));
        assert!(ModeTable::default().is_valid());
    }
}
