// =============================================================================
// Configuration model — rows, audit actions, update events
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Configuration families, each with its own schema validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    Strategy,
    RiskLimit,
    TradingPair,
    System,
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strategy => write!(f, "strategy"),
            Self::RiskLimit => write!(f, "risk_limit"),
            Self::TradingPair => write!(f, "trading_pair"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for ConfigType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategy" => Ok(Self::Strategy),
            "risk_limit" => Ok(Self::RiskLimit),
            "trading_pair" => Ok(Self::TradingPair),
            "system" => Ok(Self::System),
            other => Err(ConfigError::UnknownType(other.to_string())),
        }
    }
}

/// Source format of the submitted value blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

impl std::str::FromStr for ConfigFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            other => Err(ConfigError::Validation(format!("unknown format: {other}"))),
        }
    }
}

/// Mutation kinds recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Activate,
    Deactivate,
    Delete,
    Rollback,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Activate => write!(f, "activate"),
            Self::Deactivate => write!(f, "deactivate"),
            Self::Delete => write!(f, "delete"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// A live configuration row. The stored value is canonical JSON regardless
/// of the submitted format, so it round-trips bit-exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub id: Uuid,
    pub key: String,
    pub config_type: ConfigType,
    pub value: serde_json::Value,
    pub format: ConfigFormat,
    pub version: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

/// Immutable snapshot of a prior (key, version), retained for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub id: Uuid,
    pub config_id: Uuid,
    pub version: i32,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// One append-only audit row, written in the same transaction as the
/// mutation it records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub config_id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    #[serde(default)]
    pub old_value: Option<serde_json::Value>,
    #[serde(default)]
    pub new_value: Option<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Who performed a mutation, for the audit trail.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ActorContext {
    pub fn service(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ip: None,
            user_agent: None,
        }
    }
}

/// Event published on `config.updates.{type}` after every committed
/// mutation. Delivery is at-most-once; subscribers also poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateEvent {
    pub id: Uuid,
    pub key: String,
    pub config_type: ConfigType,
    pub value: serde_json::Value,
    pub format: ConfigFormat,
    pub version: i32,
    pub action: AuditAction,
    /// Milliseconds since the UNIX epoch.
    pub timestamp_ms: i64,
}

impl ConfigUpdateEvent {
    pub fn from_configuration(config: &Configuration, action: AuditAction) -> Self {
        Self {
            id: config.id,
            key: config.key.clone(),
            config_type: config.config_type,
            value: config.value.clone(),
            format: config.format,
            version: config.version,
            action,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Filters for the paginated list operation.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub config_type: Option<ConfigType>,
    pub active: Option<bool>,
    pub key_prefix: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_type_round_trips_through_strings() {
        for (ty, s) in [
            (ConfigType::Strategy, "strategy"),
            (ConfigType::RiskLimit, "risk_limit"),
            (ConfigType::TradingPair, "trading_pair"),
            (ConfigType::System, "system"),
        ] {
            assert_eq!(ty.to_string(), s);
            assert_eq!(s.parse::<ConfigType>().unwrap(), ty);
        }
        assert!("metrics".parse::<ConfigType>().is_err());
    }

    #[test]
    fn update_event_mirrors_configuration() {
        let config = Configuration {
            id: Uuid::new_v4(),
            key: "risk_limits".to_string(),
            config_type: ConfigType::RiskLimit,
            value: serde_json::json!({"max_position": 10}),
            format: ConfigFormat::Json,
            version: 3,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: "ops".to_string(),
            updated_by: "ops".to_string(),
        };
        let event = ConfigUpdateEvent::from_configuration(&config, AuditAction::Rollback);
        assert_eq!(event.version, 3);
        assert_eq!(event.action, AuditAction::Rollback);
        assert_eq!(event.value, config.value);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["config_type"], "risk_limit");
        assert_eq!(json["action"], "rollback");
    }
}
