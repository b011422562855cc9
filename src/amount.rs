//! Credit amount handling.
//!
//! Credits are decimals with six fractional digits. Amounts entering the
//! ledger are normalized with banker's rounding and must be positive.
//! Persistent stores keep them as integer micro-credits.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{LedgerError, Result};

/// Fractional digits kept for every credit amount.
pub const CREDIT_SCALE: u32 = 6;

const MICROS_PER_CREDIT: i64 = 1_000_000;

/// Round to the ledger's precision.
#[must_use]
pub fn normalize(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Validate and normalize an amount supplied by a caller.
///
/// Rejects zero and negative values, including values that round to zero.
pub fn validate_positive(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::invalid_amount(format!(
            "amount must be positive, got {amount}"
        )));
    }
    let normalized = normalize(amount);
    if normalized.is_zero() {
        return Err(LedgerError::invalid_amount(format!(
            "amount {amount} is below the smallest credit unit"
        )));
    }
    Ok(normalized)
}

/// Convert to micro-credits for integer storage.
pub fn to_micros(amount: Decimal) -> Result<i64> {
    let scaled = normalize(amount) * Decimal::from(MICROS_PER_CREDIT);
    i64::try_from(scaled.trunc())
        .map_err(|_| LedgerError::invalid_amount(format!("amount {amount} out of range")))
}

/// Convert stored micro-credits back to a decimal.
#[must_use]
pub fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, CREDIT_SCALE)
}

/// Clamp negative remainders to zero for display and resolution.
#[must_use]
pub fn non_negative(amount: Decimal) -> Decimal {
    amount.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_rejects_non_positive() {
        assert!(matches!(
            validate_positive(Decimal::ZERO),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(validate_positive(d("-1")).is_err());
        assert!(validate_positive(d("0.0000001")).is_err());
    }

    #[test]
    fn test_normalizes_to_six_places() {
        assert_eq!(validate_positive(d("0.1234565")).unwrap(), d("0.123456"));
        assert_eq!(validate_positive(d("0.1234575")).unwrap(), d("0.123458"));
        assert_eq!(validate_positive(d("2")).unwrap(), d("2"));
    }

    #[test]
    fn test_micros_conversion() {
        assert_eq!(to_micros(d("0.05")).unwrap(), 50_000);
        assert_eq!(to_micros(d("-1.5")).unwrap(), -1_500_000);
        assert_eq!(from_micros(30_000), d("0.03"));
        assert_eq!(from_micros(to_micros(d("12.345678")).unwrap()), d("12.345678"));
    }
}
