use thiserror::Error;

/// Configuration problems. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid factor weights: {0}")]
    Weights(String),

    #[error("invalid risk thresholds: {0}")]
    Thresholds(String),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors from the external stores (rules, history, trends, audit).
///
/// Cloneable so a single failed history read can be shared by every
/// calculator of one evaluation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregatorError {
    #[error("window of {window_seconds}s is not tracked for field {field}")]
    WindowNotTracked { field: String, window_seconds: u64 },

    #[error("unsupported aggregation {0}")]
    UnsupportedAggregation(String),
}

/// A calculator could not produce its factor. The dispatcher substitutes the
/// calculator's default and marks the assessment degraded.
#[derive(Debug, Error)]
pub enum FactorError {
    #[error("history unavailable: {0}")]
    History(#[from] StoreError),

    #[error("aggregator unavailable: {0}")]
    Aggregator(#[from] AggregatorError),
}

/// A rule definition that cannot be compiled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule {rule_id}: {reason}")]
    Invalid { rule_id: String, reason: String },

    #[error("duplicate rule id {0}")]
    DuplicateId(String),
}

/// Why no rule snapshot can be used for an evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RulesUnavailable {
    #[error("rule set has never been loaded")]
    NeverLoaded,

    #[error("rule set is stale ({age_seconds}s old, limit {limit_seconds}s)")]
    Stale { age_seconds: i64, limit_seconds: u64 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rules(#[from] RuleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_from_json() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let store: StoreError = err.into();
        assert!(matches!(store, StoreError::Malformed(_)));
    }

    #[test]
    fn engine_error_is_transparent() {
        let err = EngineError::from(RuleError::DuplicateId("r1".into()));
        assert_eq!(err.to_string(), "duplicate rule id r1");
    }
}
