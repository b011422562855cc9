//! Token pricing.
//!
//! Cost of one request is
//! `(tokens_in × input_price + tokens_out × output_price) / 1,000,000 × markup`,
//! with prices quoted per million tokens. The configuration carries a
//! version string that is written into every usage transaction so old
//! debits stay explainable after prices change.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::amount::normalize;
use crate::error::{LedgerError, Result};

const TOKENS_PER_QUOTE: i64 = 1_000_000;

/// Per-million-token prices for one model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl ModelPrice {
    pub fn new(input_per_million: Decimal, output_per_million: Decimal) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Versioned price list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_markup")]
    pub markup_multiplier: Decimal,
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
    /// Used for models missing from `models`. Without it they are rejected.
    #[serde(default)]
    pub default_price: Option<ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            markup_multiplier: default_markup(),
            models: HashMap::new(),
            default_price: None,
        }
    }
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_markup() -> Decimal {
    Decimal::ONE
}

/// A priced request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UsageCost {
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: Decimal,
    pub pricing_version: String,
}

impl UsageCost {
    /// Description written on the usage transaction.
    #[must_use]
    pub fn description(&self) -> String {
        format!(
            "{} usage: {} in / {} out tokens (pricing {})",
            self.model, self.tokens_in, self.tokens_out, self.pricing_version
        )
    }
}

impl PricingConfig {
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    #[must_use]
    pub fn with_markup(mut self, markup: Decimal) -> Self {
        self.markup_multiplier = markup;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_default_price(mut self, price: ModelPrice) -> Self {
        self.default_price = Some(price);
        self
    }

    pub fn price_for(&self, model: &str) -> Result<&ModelPrice> {
        self.models
            .get(model)
            .or(self.default_price.as_ref())
            .ok_or_else(|| LedgerError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Price a request. The result is rounded to ledger precision.
    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Result<UsageCost> {
        let price = self.price_for(model)?;
        let raw = (Decimal::from(tokens_in) * price.input_per_million
            + Decimal::from(tokens_out) * price.output_per_million)
            / Decimal::from(TOKENS_PER_QUOTE)
            * self.markup_multiplier;

        Ok(UsageCost {
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost: normalize(raw),
            pricing_version: self.version.clone(),
        })
    }

    /// Check prices and markup are usable.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.markup_multiplier <= Decimal::ZERO {
            return Err(format!(
                "markup multiplier must be positive, got {}",
                self.markup_multiplier
            ));
        }
        let prices = self
            .models
            .iter()
            .map(|(name, price)| (name.as_str(), price))
            .chain(self.default_price.iter().map(|price| ("default", price)));
        for (name, price) in prices {
            if price.input_per_million < Decimal::ZERO || price.output_per_million < Decimal::ZERO {
                return Err(format!("price for '{}' must not be negative", name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn pricing() -> PricingConfig {
        PricingConfig::default()
            .with_version("2025-01")
            .with_markup(d("1.5"))
            .with_model("gpt-4o-mini", ModelPrice::new(d("0.15"), d("0.60")))
    }

    #[test]
    fn test_cost_applies_markup() {
        let cost = pricing().cost("gpt-4o-mini", 10_000, 2_000).unwrap();
        // (10_000 × 0.15 + 2_000 × 0.60) / 1e6 = 0.0027, × 1.5 = 0.00405
        assert_eq!(cost.cost, d("0.00405"));
        assert_eq!(cost.pricing_version, "2025-01");
        assert!(cost.description().contains("pricing 2025-01"));
    }

    #[test]
    fn test_cost_rounds_to_ledger_precision() {
        let cost = pricing().cost("gpt-4o-mini", 1, 0).unwrap();
        // 0.000000225 rounds to zero at six places
        assert_eq!(cost.cost, Decimal::ZERO);
    }

    #[test]
    fn test_unknown_model() {
        assert!(matches!(
            pricing().cost("mystery", 1, 1),
            Err(LedgerError::UnknownModel { .. })
        ));

        let with_default = pricing().with_default_price(ModelPrice::new(d("1"), d("1")));
        assert_eq!(
            with_default.cost("mystery", 1_000_000, 0).unwrap().cost,
            d("1.5")
        );
    }

    #[test]
    fn test_validate() {
        assert!(pricing().validate().is_ok());
        assert!(pricing().with_markup(Decimal::ZERO).validate().is_err());
        assert!(
            pricing()
                .with_model("bad", ModelPrice::new(d("-1"), d("0")))
                .validate()
                .is_err()
        );
    }
}
