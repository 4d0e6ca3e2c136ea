use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::core::{RuleAction, TrendDimension};
use crate::error::ConfigError;
use crate::signals::factors::FACTOR_NAMES;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub scoring: ScoringConfig,
    pub factors: FactorConfig,
    pub aggregator: AggregatorConfig,
    pub rules: RulesConfig,
    pub anomaly: AnomalyConfig,
    pub database: DatabaseConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard deadline for one evaluation.
    pub deadline_ms: u64,
    pub fail_policy: FailPolicy,
    /// Local offset used by the time factor when a context carries none.
    pub default_utc_offset_minutes: i32,
}

/// What to do when the rule engine cannot run.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    #[default]
    Open,
    Review,
    Closed,
}

impl FailPolicy {
    pub fn fallback_action(&self) -> RuleAction {
        match self {
            FailPolicy::Open => RuleAction::Allow,
            FailPolicy::Review => RuleAction::Review,
            FailPolicy::Closed => RuleAction::Block,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: HashMap<String, f64>,
    pub thresholds: LevelThresholds,
    pub level_actions: LevelActions,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LevelThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

/// Floor action implied by each risk level on its own.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LevelActions {
    pub medium: RuleAction,
    pub high: RuleAction,
    pub critical: RuleAction,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FactorConfig {
    pub velocity_window_seconds: u64,
    /// Currency units per velocity window.
    pub velocity_ceiling: f64,
    pub location_radius_km: f64,
    /// Transactions needed before the user's hour histogram is trusted.
    pub time_min_history: u64,
    pub unusual_hour_start: u32,
    pub unusual_hour_end: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AggregatorConfig {
    pub max_entries: usize,
    pub member_set_capacity: usize,
    pub member_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RulesConfig {
    pub refresh_interval_seconds: u64,
    /// 0 disables the staleness limit.
    pub max_staleness_seconds: u64,
    pub max_window_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnomalyConfig {
    pub enabled: bool,
    pub dimensions: Vec<TrendDimension>,
    pub window_seconds: u64,
    pub bucket_seconds: u64,
    pub z_threshold: f64,
    /// Against a zero-variance baseline, how far (relative to its mean) a
    /// bucket must move to count as anomalous.
    pub min_relative_deviation: f64,
    pub rebuild_interval_seconds: u64,
    pub escalation_action: RuleAction,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub fraud_lookback_days: i64,
    pub known_value_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 300,
            fail_policy: FailPolicy::Open,
            default_utc_offset_minutes: 0,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let weights = [
            ("amount", 0.25),
            ("velocity", 0.20),
            ("device", 0.15),
            ("location", 0.15),
            ("time", 0.10),
            ("fraud_history", 0.15),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            weights,
            thresholds: LevelThresholds::default(),
            level_actions: LevelActions::default(),
        }
    }
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            critical: 0.8,
            high: 0.6,
            medium: 0.4,
        }
    }
}

impl Default for LevelActions {
    fn default() -> Self {
        Self {
            medium: RuleAction::Allow,
            high: RuleAction::Allow,
            critical: RuleAction::Review,
        }
    }
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            velocity_window_seconds: 3600,
            velocity_ceiling: 10_000.0,
            location_radius_km: 100.0,
            time_min_history: 10,
            unusual_hour_start: 1,
            unusual_hour_end: 5,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            member_set_capacity: 20,
            member_ttl_seconds: 30 * 86_400,
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 60,
            max_staleness_seconds: 900,
            max_window_seconds: 7 * 86_400,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: vec![TrendDimension::Volume, TrendDimension::Frequency],
            window_seconds: 30 * 86_400,
            bucket_seconds: 86_400,
            z_threshold: 2.0,
            min_relative_deviation: 1.0,
            rebuild_interval_seconds: 900,
            escalation_action: RuleAction::Notify,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/momoguard.db".into(),
            fraud_lookback_days: 90,
            known_value_limit: 50,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't
    /// exist; a file that exists but cannot be read or parsed is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        tracing::info!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Reject settings that would silently produce wrong scores.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_weights()?;

        let t = &self.scoring.thresholds;
        if !(0.0 < t.medium && t.medium < t.high && t.high < t.critical && t.critical <= 1.0) {
            return Err(ConfigError::Thresholds(format!(
                "expected 0 < medium < high < critical <= 1, got {} / {} / {}",
                t.medium, t.high, t.critical
            )));
        }

        let la = &self.scoring.level_actions;
        if [la.medium, la.high, la.critical].contains(&RuleAction::Block) {
            return Err(ConfigError::Invalid {
                key: "scoring.level_actions",
                reason: "a risk level alone may not block; only a matched rule can".into(),
            });
        }

        if self.engine.deadline_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.deadline_ms",
                reason: "must be positive".into(),
            });
        }
        if self.factors.velocity_window_seconds == 0 || self.factors.velocity_ceiling <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "factors.velocity",
                reason: "window and ceiling must be positive".into(),
            });
        }
        if self.factors.location_radius_km <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "factors.location_radius_km",
                reason: "must be positive".into(),
            });
        }
        if self.factors.unusual_hour_start >= self.factors.unusual_hour_end
            || self.factors.unusual_hour_end > 24
        {
            return Err(ConfigError::Invalid {
                key: "factors.unusual_hour_start",
                reason: "expected start < end <= 24".into(),
            });
        }
        if self.factors.velocity_window_seconds > self.rules.max_window_seconds {
            return Err(ConfigError::Invalid {
                key: "factors.velocity_window_seconds",
                reason: format!("exceeds rules.max_window_seconds ({})", self.rules.max_window_seconds),
            });
        }
        if self.aggregator.member_set_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "aggregator.member_set_capacity",
                reason: "must be positive".into(),
            });
        }

        let a = &self.anomaly;
        if a.z_threshold <= 0.0 || a.bucket_seconds == 0 || a.window_seconds < a.bucket_seconds {
            return Err(ConfigError::Invalid {
                key: "anomaly",
                reason: "z_threshold and bucket_seconds must be positive and window_seconds >= bucket_seconds".into(),
            });
        }
        if !a.min_relative_deviation.is_finite() || a.min_relative_deviation < 0.0 {
            return Err(ConfigError::Invalid {
                key: "anomaly.min_relative_deviation",
                reason: "must be a non-negative number".into(),
            });
        }
        if matches!(a.escalation_action, RuleAction::Block) {
            return Err(ConfigError::Invalid {
                key: "anomaly.escalation_action",
                reason: "anomalies are advisory and may not block".into(),
            });
        }
        Ok(())
    }

    fn validate_weights(&self) -> Result<(), ConfigError> {
        let weights = &self.scoring.weights;
        for name in weights.keys() {
            if !FACTOR_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::Weights(format!("unknown factor {name}")));
            }
        }
        let mut total = 0.0;
        for name in FACTOR_NAMES {
            match weights.get(name) {
                Some(w) if *w > 0.0 && *w <= 1.0 => total += w,
                Some(w) => {
                    return Err(ConfigError::Weights(format!("{name} weight {w} not in (0, 1]")));
                }
                None => return Err(ConfigError::Weights(format!("missing weight for {name}"))),
            }
        }
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Weights(format!("weights sum to {total}, expected 1.0")));
        }
        Ok(())
    }
}
