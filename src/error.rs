// =============================================================================
// Error taxonomy — domain errors at each I/O boundary
// =============================================================================
//
// Transient failures are retried at the boundary and converted into these
// domain errors for the caller. External payloads carry kind + message only;
// cause chains stay internal.
// =============================================================================

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the exchange adapter (REST + WebSocket).
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure. Retryable with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Request timestamp fell outside the exchange recv window. Retryable
    /// after a server-time re-sync.
    #[error("request timestamp outside recv window")]
    TimestampSkew,

    /// REST endpoints are geo/legally blocked (HTTP 451 class). The
    /// WebSocket path keeps running; REST health degrades.
    #[error("rest endpoint blocked (HTTP {status})")]
    RestBlocked { status: u16 },

    /// Bad key or secret. Fatal for the signed call, does not tear down
    /// the connection.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Exchange rejected the request with an application error code.
    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    /// Response body could not be decoded.
    #[error("malformed exchange payload: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Whether retrying the same request (possibly after a time re-sync)
    /// can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::TimestampSkew => true,
            Self::RestBlocked { .. } | Self::Auth(_) | Self::Malformed(_) => false,
            // Exchange -1003 (too many requests) and 5xx-mapped codes come
            // back after a pause; order-level rejections do not.
            Self::Api { code, .. } => matches!(code, -1003 | -1001 | -1016),
        }
    }

    /// Map a Binance-style error code onto the taxonomy.
    pub fn from_api_code(code: i64, message: String) -> Self {
        match code {
            -1021 => Self::TimestampSkew,
            -2014 | -2015 => Self::Auth(message),
            _ => Self::Api { code, message },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors surfaced by the order gateway to submitters.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found: {0}")]
    UnknownOrder(String),

    #[error("order {client_id} is terminal ({state})")]
    Terminal { client_id: String, state: String },

    #[error("invalid order: {0}")]
    Validation(String),

    #[error("order has no exchange id yet")]
    NotSubmitted,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Errors surfaced by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration not found: {0}")]
    NotFound(Uuid),

    #[error("an active configuration already exists for key '{0}'")]
    DuplicateKey(String),

    #[error("unknown configuration type: {0}")]
    UnknownType(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version {version} not found for configuration {config_id}")]
    VersionMissing { config_id: Uuid, version: i32 },

    #[error("configuration {0} is referenced by another active configuration")]
    Referenced(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_skew_are_retryable() {
        assert!(ExchangeError::Transport("reset".into()).is_retryable());
        assert!(ExchangeError::TimestampSkew.is_retryable());
    }

    #[test]
    fn auth_and_block_are_terminal() {
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::RestBlocked { status: 451 }.is_retryable());
    }

    #[test]
    fn api_code_mapping() {
        assert!(matches!(
            ExchangeError::from_api_code(-1021, "skew".into()),
            ExchangeError::TimestampSkew
        ));
        assert!(matches!(
            ExchangeError::from_api_code(-2015, "key".into()),
            ExchangeError::Auth(_)
        ));
        let rejected = ExchangeError::from_api_code(-2010, "insufficient balance".into());
        assert!(!rejected.is_retryable());
    }
}
