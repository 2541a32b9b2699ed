//! Unit conversion between source-chain assets and ZEC
//!
//! All arithmetic is on `BigDecimal`; rates are supplied by the caller (see
//! [`crate::oracle`]) and never fetched here.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use std::str::FromStr;
use thiserror::Error;

use crate::types::ZEC_DECIMALS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("malformed amount: {0:?}")]
    Malformed(String),
    #[error("amount {amount} has more than {max} fractional digits")]
    TooPrecise { amount: String, max: u32 },
    #[error("amount must not be negative")]
    Negative,
    #[error("amount {0} does not fit in minimal units")]
    Overflow(String),
}

/// Parse a plain decimal string (`^\d+(\.\d+)?$`) with at most `max_scale`
/// fractional digits.
pub fn parse_amount(raw: &str, max_scale: u32) -> Result<BigDecimal, ConversionError> {
    let (int_part, frac_part) = match raw.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (raw, None),
    };

    let digits_only = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits_only(int_part) || !frac_part.map_or(true, digits_only) {
        return Err(ConversionError::Malformed(raw.to_string()));
    }
    if frac_part.map_or(0, str::len) > max_scale as usize {
        return Err(ConversionError::TooPrecise {
            amount: raw.to_string(),
            max: max_scale,
        });
    }

    BigDecimal::from_str(raw).map_err(|_| ConversionError::Malformed(raw.to_string()))
}

/// `amount * rate`
pub fn to_reference_unit(amount: &BigDecimal, rate: &BigDecimal) -> BigDecimal {
    amount * rate
}

/// Convert a source amount into ZEC, truncated to zatoshi precision.
pub fn to_zec(amount: &BigDecimal, rate: &BigDecimal) -> BigDecimal {
    round_down(&to_reference_unit(amount, rate), ZEC_DECIMALS)
}

/// `minimal / 10^decimals`
pub fn from_minimal_unit(minimal: u64, decimals: u32) -> BigDecimal {
    BigDecimal::new(minimal.into(), i64::from(decimals))
}

/// `amount * 10^decimals`, exact. Fails if `amount` carries more precision
/// than the minimal unit can represent.
pub fn to_minimal_unit(amount: &BigDecimal, decimals: u32) -> Result<u64, ConversionError> {
    if amount < &BigDecimal::zero() {
        return Err(ConversionError::Negative);
    }

    let scaled = amount * &BigDecimal::new(1u64.into(), -i64::from(decimals));
    let whole = scaled.with_scale(0);
    if whole != scaled {
        return Err(ConversionError::TooPrecise {
            amount: amount.to_string(),
            max: decimals,
        });
    }

    whole
        .to_u64()
        .ok_or_else(|| ConversionError::Overflow(amount.to_string()))
}

/// Truncate toward zero to `decimals` fractional digits.
pub fn round_down(amount: &BigDecimal, decimals: u32) -> BigDecimal {
    amount.with_scale(i64::from(decimals))
}

/// Render with exactly `decimals` fractional digits, truncating any extra
/// precision. Always plain notation, which is the form stored in the NUMERIC
/// columns and sent to the node.
pub fn format_fixed(amount: &BigDecimal, decimals: u32) -> Result<String, ConversionError> {
    let minimal = to_minimal_unit(&round_down(amount, decimals), decimals)?;
    if decimals == 0 {
        return Ok(minimal.to_string());
    }
    let unit = 10u64.pow(decimals);
    Ok(format!(
        "{}.{:0width$}",
        minimal / unit,
        minimal % unit,
        width = decimals as usize
    ))
}

pub fn is_positive(amount: &BigDecimal) -> bool {
    amount > &BigDecimal::zero()
}
