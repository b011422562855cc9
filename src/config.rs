use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::allocator::FamilyConfig;
use crate::error::{LedgerError, Result};
use crate::gate::GateConfig;
use crate::pricing::PricingConfig;
use crate::utils::{get_env_with_prefix, parse_flag};

/// Main configuration for the ledger engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub family: FamilyConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Connection URL. `None` selects the in-memory store.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_max_connections() -> u32 {
    10
}

/// Builder for LedgerConfig with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: LedgerConfig,
    pricing_file: Option<PathBuf>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LedgerConfig::default(),
            pricing_file: None,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.config.pricing = pricing;
        self
    }

    /// Load the price list from a JSON file at build time.
    pub fn with_pricing_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pricing_file = Some(path.into());
        self
    }

    pub fn with_markup(mut self, markup: Decimal) -> Self {
        self.config.pricing.markup_multiplier = markup;
        self
    }

    pub fn with_family(mut self, family: FamilyConfig) -> Self {
        self.config.family = family;
        self
    }

    pub fn with_parent_balance_sync(mut self, enabled: bool) -> Self {
        self.config.family.sync_parent_balance = enabled;
        self
    }

    pub fn with_welcome_credit(mut self, amount: Decimal) -> Self {
        self.config.family.welcome_credit = Some(amount);
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.config.gate = gate;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database.url = Some(url.into());
        self
    }

    /// Load configuration from environment variables with CREDITGATE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = parse_flag(&json).unwrap_or(false);
        }

        if let Some(path) = get_env_with_prefix("PRICING_FILE") {
            self.pricing_file = Some(PathBuf::from(path));
        }
        if let Some(version) = get_env_with_prefix("PRICING_VERSION") {
            self.config.pricing.version = version;
        }
        if let Some(markup) = get_env_with_prefix("MARKUP_MULTIPLIER") {
            if let Ok(m) = Decimal::from_str(markup.trim()) {
                self.config.pricing.markup_multiplier = m;
            }
        }

        if let Some(sync) = get_env_with_prefix("FAMILY_SYNC_PARENT_BALANCE") {
            if let Some(enabled) = parse_flag(&sync) {
                self.config.family.sync_parent_balance = enabled;
            }
        }
        if let Some(credit) = get_env_with_prefix("FAMILY_WELCOME_CREDIT") {
            if let Ok(amount) = Decimal::from_str(credit.trim()) {
                self.config.family.welcome_credit = Some(amount);
            }
        }

        if let Some(enabled) = get_env_with_prefix("GATE_ENABLED") {
            if let Some(enabled) = parse_flag(&enabled) {
                self.config.gate.enabled = enabled;
            }
        }
        if let Some(enforce) = get_env_with_prefix("GATE_ENFORCE_MODEL_ALLOWLIST") {
            if let Some(enforce) = parse_flag(&enforce) {
                self.config.gate.enforce_model_allowlist = enforce;
            }
        }

        if let Some(url) = get_env_with_prefix("DATABASE_URL") {
            self.config.database.url = Some(url);
        }
        if let Some(max) = get_env_with_prefix("DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.config.database.max_connections = n;
            }
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pricing file cannot be read or
    /// parsed, the log level is unknown, prices or markup are invalid, or
    /// the welcome credit is not positive.
    pub fn build(mut self) -> Result<LedgerConfig> {
        if let Some(path) = &self.pricing_file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                LedgerError::configuration(format!(
                    "cannot read pricing file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let mut pricing: PricingConfig = serde_json::from_str(&raw).map_err(|e| {
                LedgerError::configuration(format!(
                    "invalid pricing file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            // Explicit env markup wins over the file
            if self.config.pricing.markup_multiplier != Decimal::ONE {
                pricing.markup_multiplier = self.config.pricing.markup_multiplier;
            }
            self.config.pricing = pricing;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(LedgerError::configuration(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        self.config
            .pricing
            .validate()
            .map_err(LedgerError::configuration)?;

        if let Some(credit) = self.config.family.welcome_credit {
            if credit <= Decimal::ZERO {
                return Err(LedgerError::configuration(format!(
                    "welcome credit must be positive, got {}",
                    credit
                )));
            }
        }

        if self.config.database.max_connections == 0 {
            return Err(LedgerError::configuration(
                "database max_connections must be at least 1",
            ));
        }

        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPrice;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.family.sync_parent_balance);
        assert!(config.gate.enabled);
        assert_eq!(config.pricing.markup_multiplier, Decimal::ONE);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_builder_validation() {
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
        assert!(
            ConfigBuilder::new()
                .with_markup(Decimal::ZERO)
                .build()
                .is_err()
        );
        assert!(
            ConfigBuilder::new()
                .with_welcome_credit(Decimal::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("CREDITGATE_MARKUP_MULTIPLIER", "1.25");
            std::env::set_var("CREDITGATE_FAMILY_SYNC_PARENT_BALANCE", "false");
            std::env::set_var("CREDITGATE_FAMILY_WELCOME_CREDIT", "2.50");
        }

        let config = ConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.pricing.markup_multiplier, Decimal::new(125, 2));
        assert!(!config.family.sync_parent_balance);
        assert_eq!(config.family.welcome_credit, Some(Decimal::new(250, 2)));

        unsafe {
            std::env::remove_var("CREDITGATE_MARKUP_MULTIPLIER");
            std::env::remove_var("CREDITGATE_FAMILY_SYNC_PARENT_BALANCE");
            std::env::remove_var("CREDITGATE_FAMILY_WELCOME_CREDIT");
        }
    }

    #[test]
    fn test_pricing_file() {
        let pricing = PricingConfig::default()
            .with_version("2025-02")
            .with_model("small", ModelPrice::new(Decimal::ONE, Decimal::TWO));
        let path = std::env::temp_dir().join(format!("creditgate-pricing-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&pricing).unwrap()).unwrap();

        let config = ConfigBuilder::new().with_pricing_file(&path).build().unwrap();
        assert_eq!(config.pricing.version, "2025-02");
        assert!(config.pricing.models.contains_key("small"));

        std::fs::remove_file(&path).unwrap();
        assert!(ConfigBuilder::new().with_pricing_file(&path).build().is_err());
    }
}
