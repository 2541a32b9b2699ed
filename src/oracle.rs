//! Exchange-rate source for source asset → ZEC conversion
//!
//! The rate is authoritative at submit time. There is no fallback: if a rate
//! is missing the submit is refused and the record stays `pending`.

use std::collections::HashMap;

use bigdecimal::BigDecimal;

use crate::conversion::is_positive;
use crate::error::SettlementError;
use crate::types::Asset;

pub trait PriceOracle: Send + Sync {
    /// ZEC per one unit of `asset`
    fn current_rate(&self, asset: Asset) -> Result<BigDecimal, SettlementError>;
}

/// Fixed rates from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticRateOracle {
    rates: HashMap<Asset, BigDecimal>,
}

impl StaticRateOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, asset: Asset, rate: BigDecimal) -> Self {
        self.rates.insert(asset, rate);
        self
    }

    pub fn set_rate(&mut self, asset: Asset, rate: Option<BigDecimal>) {
        match rate {
            Some(rate) => self.rates.insert(asset, rate),
            None => self.rates.remove(&asset),
        };
    }
}

impl PriceOracle for StaticRateOracle {
    fn current_rate(&self, asset: Asset) -> Result<BigDecimal, SettlementError> {
        self.rates
            .get(&asset)
            .filter(|rate| is_positive(rate))
            .cloned()
            .ok_or_else(|| SettlementError::RateUnavailable(format!("{}/ZEC", asset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_configured_rate_is_returned() {
        let oracle = StaticRateOracle::new().with_rate(Asset::Sol, BigDecimal::from_str("0.5").unwrap());
        assert_eq!(
            oracle.current_rate(Asset::Sol).unwrap(),
            BigDecimal::from_str("0.5").unwrap()
        );
    }

    #[test]
    fn test_missing_rate_fails_closed() {
        let oracle = StaticRateOracle::new();
        let err = oracle.current_rate(Asset::Usdc).unwrap_err();
        assert!(matches!(err, SettlementError::RateUnavailable(ref pair) if pair == "USDC/ZEC"));
    }

    #[test]
    fn test_zero_rate_is_unavailable() {
        let mut oracle = StaticRateOracle::new();
        oracle.set_rate(Asset::Sol, Some(BigDecimal::from(0)));
        assert!(oracle.current_rate(Asset::Sol).is_err());
        oracle.set_rate(Asset::Sol, None);
        assert!(oracle.current_rate(Asset::Sol).is_err());
    }
}
