//! Market data types and functionality

pub mod historical;

use serde::{Deserialize, Serialize};

/// Session filter for historical requests.
///
/// `Extended` (all hours) is the default since futures trade nearly around the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TradingHours {
    /// Regular Trading Hours only (RTH)
    Regular,
    /// Include extended hours (pre-market, after-hours and overnight sessions)
    #[default]
    Extended,
}

impl TradingHours {
    /// Returns true if only regular trading hours should be used
    pub fn use_rth(&self) -> bool {
        matches!(self, TradingHours::Regular)
    }

    /// Creates TradingHours from a boolean use_rth value
    pub fn from_use_rth(use_rth: bool) -> Self {
        if use_rth {
            TradingHours::Regular
        } else {
            TradingHours::Extended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_hours() {
        assert_eq!(TradingHours::default(), TradingHours::Extended);
        assert!(TradingHours::Regular.use_rth());
        assert!(!TradingHours::Extended.use_rth());
        assert_eq!(TradingHours::from_use_rth(true), TradingHours::Regular);
        assert_eq!(TradingHours::from_use_rth(false), TradingHours::Extended);
    }
}
