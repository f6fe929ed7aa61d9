// =============================================================================
// Configuration validation — format check, then a per-type schema validator
// =============================================================================
//
// Validation is two-phase: the raw blob must be well-formed in its declared
// format (JSON or YAML), then the parsed value must pass the validator
// registered for the configuration type. Unknown types are rejected at
// create time by the registry lookup.
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;

use crate::config::model::{ConfigFormat, ConfigType};
use crate::error::ConfigError;

/// Parse a raw blob in its declared format into canonical JSON.
pub fn parse_payload(raw: &str, format: ConfigFormat) -> Result<Value, ConfigError> {
    match format {
        ConfigFormat::Json => serde_json::from_str(raw)
            .map_err(|e| ConfigError::Validation(format!("malformed JSON: {e}"))),
        ConfigFormat::Yaml => serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::Validation(format!("malformed YAML: {e}"))),
    }
}

/// Schema validator for one configuration type.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), ConfigError>;
}

fn require_object<'v>(
    value: &'v Value,
) -> Result<&'v serde_json::Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| ConfigError::Validation("value must be an object".into()))
}

fn require_non_negative(map: &serde_json::Map<String, Value>, field: &str) -> Result<(), ConfigError> {
    if let Some(v) = map.get(field) {
        let n = v
            .as_f64()
            .ok_or_else(|| ConfigError::Validation(format!("{field} must be numeric")))?;
        if n < 0.0 {
            return Err(ConfigError::Validation(format!(
                "{field} must be non-negative"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-type validators
// ---------------------------------------------------------------------------

/// Strategy configs need a name; parameters are free-form.
struct StrategyValidator;

impl ConfigValidator for StrategyValidator {
    fn validate(&self, value: &Value) -> Result<(), ConfigError> {
        let map = require_object(value)?;
        match map.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => {}
            _ => {
                return Err(ConfigError::Validation(
                    "strategy config requires a non-empty 'name'".into(),
                ))
            }
        }
        if let Some(params) = map.get("params") {
            if !params.is_object() {
                return Err(ConfigError::Validation(
                    "'params' must be an object".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Risk-limit configs: known numeric thresholds, all non-negative,
/// percentages capped at 100.
struct RiskLimitValidator;

impl ConfigValidator for RiskLimitValidator {
    fn validate(&self, value: &Value) -> Result<(), ConfigError> {
        let map = require_object(value)?;
        for field in [
            "min_balance",
            "max_margin_ratio",
            "max_position_size",
            "max_position",
        ] {
            require_non_negative(map, field)?;
        }
        if let Some(v) = map.get("max_drawdown_pct") {
            let n = v
                .as_f64()
                .ok_or_else(|| ConfigError::Validation("max_drawdown_pct must be numeric".into()))?;
            if !(0.0..=100.0).contains(&n) {
                return Err(ConfigError::Validation(
                    "max_drawdown_pct must be within [0, 100]".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Trading-pair configs need an uppercase symbol; tick/step sizes must be
/// positive when present.
struct TradingPairValidator;

impl ConfigValidator for TradingPairValidator {
    fn validate(&self, value: &Value) -> Result<(), ConfigError> {
        let map = require_object(value)?;
        match map.get("symbol").and_then(|v| v.as_str()) {
            Some(symbol) if !symbol.is_empty() => {
                if symbol.chars().any(|c| c.is_ascii_lowercase()) {
                    return Err(ConfigError::Validation(
                        "'symbol' must be uppercase".into(),
                    ));
                }
            }
            _ => {
                return Err(ConfigError::Validation(
                    "trading_pair config requires a 'symbol'".into(),
                ))
            }
        }
        for field in ["tick_size", "step_size", "min_notional"] {
            if let Some(v) = map.get(field) {
                let n = v
                    .as_f64()
                    .ok_or_else(|| ConfigError::Validation(format!("{field} must be numeric")))?;
                if n <= 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "{field} must be positive"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// System configs: any non-empty object.
struct SystemValidator;

impl ConfigValidator for SystemValidator {
    fn validate(&self, value: &Value) -> Result<(), ConfigError> {
        let map = require_object(value)?;
        if map.is_empty() {
            return Err(ConfigError::Validation(
                "system config must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps configuration type to its schema validator.
pub struct ValidatorRegistry {
    validators: HashMap<ConfigType, Box<dyn ConfigValidator>>,
}

impl ValidatorRegistry {
    pub fn with_builtin_validators() -> Self {
        let mut validators: HashMap<ConfigType, Box<dyn ConfigValidator>> = HashMap::new();
        validators.insert(ConfigType::Strategy, Box::new(StrategyValidator));
        validators.insert(ConfigType::RiskLimit, Box::new(RiskLimitValidator));
        validators.insert(ConfigType::TradingPair, Box::new(TradingPairValidator));
        validators.insert(ConfigType::System, Box::new(SystemValidator));
        Self { validators }
    }

    /// Format check followed by the type-specific schema check. Returns the
    /// canonical JSON value that gets persisted.
    pub fn validate(
        &self,
        config_type: ConfigType,
        raw: &str,
        format: ConfigFormat,
    ) -> Result<Value, ConfigError> {
        let value = parse_payload(raw, format)?;
        let validator = self
            .validators
            .get(&config_type)
            .ok_or_else(|| ConfigError::UnknownType(config_type.to_string()))?;
        validator.validate(&value)?;
        Ok(value)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtin_validators()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ValidatorRegistry {
        ValidatorRegistry::with_builtin_validators()
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let r = registry();
        assert!(r
            .validate(ConfigType::System, "{not json", ConfigFormat::Json)
            .is_err());
        assert!(r
            .validate(ConfigType::System, ": : :", ConfigFormat::Yaml)
            .is_err());
    }

    #[test]
    fn yaml_parses_into_canonical_json() {
        let r = registry();
        let value = r
            .validate(
                ConfigType::RiskLimit,
                "max_position: 10\nmin_balance: 100.5\n",
                ConfigFormat::Yaml,
            )
            .unwrap();
        assert_eq!(value["max_position"], 10);
        assert_eq!(value["min_balance"], 100.5);
    }

    #[test]
    fn strategy_requires_name() {
        let r = registry();
        assert!(r
            .validate(ConfigType::Strategy, r#"{"params": {}}"#, ConfigFormat::Json)
            .is_err());
        assert!(r
            .validate(
                ConfigType::Strategy,
                r#"{"name": "momentum", "params": {"window": 20}}"#,
                ConfigFormat::Json
            )
            .is_ok());
    }

    #[test]
    fn risk_limit_bounds() {
        let r = registry();
        assert!(r
            .validate(
                ConfigType::RiskLimit,
                r#"{"max_drawdown_pct": 150}"#,
                ConfigFormat::Json
            )
            .is_err());
        assert!(r
            .validate(
                ConfigType::RiskLimit,
                r#"{"min_balance": -1}"#,
                ConfigFormat::Json
            )
            .is_err());
        assert!(r
            .validate(
                ConfigType::RiskLimit,
                r#"{"max_drawdown_pct": 20, "max_position_size": 5}"#,
                ConfigFormat::Json
            )
            .is_ok());
    }

    #[test]
    fn trading_pair_symbol_rules() {
        let r = registry();
        assert!(r
            .validate(
                ConfigType::TradingPair,
                r#"{"symbol": "btcusdt"}"#,
                ConfigFormat::Json
            )
            .is_err());
        assert!(r
            .validate(
                ConfigType::TradingPair,
                r#"{"symbol": "BTCUSDT", "tick_size": 0.1}"#,
                ConfigFormat::Json
            )
            .is_ok());
        assert!(r
            .validate(
                ConfigType::TradingPair,
                r#"{"symbol": "BTCUSDT", "tick_size": 0}"#,
                ConfigFormat::Json
            )
            .is_err());
    }

    #[test]
    fn system_rejects_empty_object() {
        let r = registry();
        assert!(r
            .validate(ConfigType::System, "{}", ConfigFormat::Json)
            .is_err());
        assert!(r
            .validate(
                ConfigType::System,
                r#"{"reconcile_interval_secs": 5}"#,
                ConfigFormat::Json
            )
            .is_ok());
    }

    #[test]
    fn canonical_value_round_trips() {
        let r = registry();
        let raw = r#"{"name":"momentum","params":{"window":20,"threshold":0.5}}"#;
        let value = r
            .validate(ConfigType::Strategy, raw, ConfigFormat::Json)
            .unwrap();
        let serialized = serde_json::to_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(value, reparsed);
    }
}
