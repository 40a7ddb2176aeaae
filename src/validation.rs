/// Input validation for the payment pipeline
///
/// Validation failures are terminal for the unit of work that raised them and
/// are never retried, so every check runs before any I/O.
use rust_decimal::Decimal;

use crate::error::{CoinvestError, FailureReason, OpFailure, Result};

/// Validate a monetary amount (must be strictly positive)
pub fn validate_amount(amount: Decimal, field_name: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(CoinvestError::Validation(format!(
            "{} must be positive: {}",
            field_name, amount
        )));
    }
    Ok(())
}

/// Validate an allocation percentage (must be in (0, 100])
pub fn validate_percent(percent: Decimal) -> Result<()> {
    if percent <= Decimal::ZERO || percent > Decimal::from(100) {
        return Err(CoinvestError::Validation(format!(
            "percent must be in (0, 100]: {}",
            percent
        )));
    }
    Ok(())
}

/// Validate an asset ticker (non-empty, uppercase alphanumeric)
pub fn validate_ticker(ticker: &str) -> Result<()> {
    if ticker.is_empty() {
        return Err(CoinvestError::Validation(
            "ticker cannot be empty".to_string(),
        ));
    }
    if !ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_lowercase())
    {
        return Err(CoinvestError::Validation(format!(
            "ticker must be uppercase alphanumeric: {}",
            ticker
        )));
    }
    Ok(())
}

/// Validate an exchange name (non-empty)
pub fn validate_exchange_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoinvestError::Validation(
            "exchange name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Collect per-field validation errors into a structured failure.
///
/// Runs every check so the caller sees all offending fields at once rather
/// than one per round trip.
pub struct FieldValidator {
    failure: Option<OpFailure>,
}

impl FieldValidator {
    pub fn new() -> Self {
        Self { failure: None }
    }

    pub fn check(&mut self, field: &str, result: Result<()>) -> &mut Self {
        if let Err(err) = result {
            let failure = self.failure.get_or_insert_with(|| {
                OpFailure::new(FailureReason::Validation, "validation failed")
            });
            failure.field_errors.insert(field.to_string(), err.to_string());
        }
        self
    }

    pub fn finish(&mut self) -> std::result::Result<(), OpFailure> {
        match self.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(dec!(0.01), "net_amount").is_ok());
        assert!(validate_amount(dec!(100), "net_amount").is_ok());

        assert!(validate_amount(dec!(0), "net_amount").is_err());
        assert!(validate_amount(dec!(-5), "net_amount").is_err());
    }

    #[test]
    fn test_validate_percent() {
        assert!(validate_percent(dec!(0.5)).is_ok());
        assert!(validate_percent(dec!(100)).is_ok());

        assert!(validate_percent(dec!(0)).is_err());
        assert!(validate_percent(dec!(100.01)).is_err());
        assert!(validate_percent(dec!(-10)).is_err());
    }

    #[test]
    fn test_validate_ticker() {
        assert!(validate_ticker("BTC").is_ok());
        assert!(validate_ticker("SOL2").is_ok());

        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("btc").is_err());
        assert!(validate_ticker("BTC-USD").is_err());
    }

    #[test]
    fn test_validate_exchange_name() {
        assert!(validate_exchange_name("binance").is_ok());
        assert!(validate_exchange_name("").is_err());
        assert!(validate_exchange_name("   ").is_err());
    }

    #[test]
    fn field_validator_collects_all_errors() {
        let failure = FieldValidator::new()
            .check("percent", validate_percent(dec!(0)))
            .check("ticker", validate_ticker(""))
            .check("amount", validate_amount(dec!(10), "amount"))
            .finish()
            .unwrap_err();

        assert_eq!(failure.reason, FailureReason::Validation);
        assert_eq!(failure.field_errors.len(), 2);
        assert!(failure.field_errors.contains_key("percent"));
        assert!(failure.field_errors.contains_key("ticker"));
    }
}
