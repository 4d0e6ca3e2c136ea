pub mod dispatcher;
pub mod pipeline;

use std::fmt;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LevelThresholds;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Deposit,
    Withdrawal,
    Payment,
    BillPayment,
    Airtime,
    Login,
    SensitiveAction,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Payment => "payment",
            TransactionType::BillPayment => "bill_payment",
            TransactionType::Airtime => "airtime",
            TransactionType::Login => "login",
            TransactionType::SensitiveAction => "sensitive_action",
        }
    }
}

/// The immutable input of one evaluation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(default = "Uuid::new_v4")]
    pub evaluation_id: Uuid,
    pub user_id: String,
    pub amount: f64,
    pub transaction_type: TransactionType,
    pub ip: String,
    pub device_fingerprint: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Offset of the user's local time from UTC, when the channel reports it.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl EvaluationContext {
    /// The entities this context is accounted against, user first.
    pub fn entities(&self) -> [EntityKey; 3] {
        [
            EntityKey::user(&self.user_id),
            EntityKey::new(EntityKind::Ip, &self.ip),
            EntityKey::new(EntityKind::Device, &self.device_fingerprint),
        ]
    }

    /// Local hour of day (0-23). Falls back to `default_offset_minutes` when
    /// the context carries no offset.
    pub fn local_hour(&self, default_offset_minutes: i32) -> u32 {
        let minutes = self.utc_offset_minutes.unwrap_or(default_offset_minutes);
        match FixedOffset::east_opt(minutes * 60) {
            Some(offset) => self.timestamp.with_timezone(&offset).hour(),
            None => self.timestamp.hour(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    User,
    Ip,
    Device,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Ip => "ip",
            EntityKind::Device => "device",
        }
    }
}

/// Subject of risk evaluation: a user, an IP or a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityKind::User, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// One weighted behavioral signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: f64,
    pub value: f64,
    pub details: String,
    /// True when `value` is a substituted default after a calculator failure.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64, thresholds: &LevelThresholds) -> Self {
        if score >= thresholds.critical {
            RiskLevel::Critical
        } else if score >= thresholds.high {
            RiskLevel::High
        } else if score >= thresholds.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
    pub degraded: bool,
}

/// Action requested of the transaction pipeline. Ordered from least to most
/// restrictive, so `max` picks the winner on a tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Notify,
    Review,
    Block,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Notify => "notify",
            RuleAction::Review => "review",
            RuleAction::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// How a single condition resolved, kept so the trail explains itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTrace {
    pub field: String,
    pub operator: String,
    pub expected: serde_json::Value,
    pub actual: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub rule_name: String,
    pub matched: bool,
    pub severity: Severity,
    pub action: RuleAction,
    pub details: Vec<ConditionTrace>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDimension {
    Volume,
    Frequency,
    Recipient,
    Category,
    Time,
    Location,
}

impl TrendDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDimension::Volume => "volume",
            TrendDimension::Frequency => "frequency",
            TrendDimension::Recipient => "recipient",
            TrendDimension::Category => "category",
            TrendDimension::Time => "time",
            TrendDimension::Location => "location",
        }
    }
}

/// Time-bucketed statistic for one trend dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendBucket {
    pub dimension: TrendDimension,
    pub start: DateTime<Utc>,
    pub value: f64,
}

/// A trend bucket that deviates from the baseline of its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub entity_id: String,
    pub dimension: TrendDimension,
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// `None` when the baseline has zero variance.
    pub z_score: Option<f64>,
    /// Whether the bucket is the most recent one in the window.
    pub latest: bool,
}

/// The single object returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub evaluation_id: Uuid,
    pub action: RuleAction,
    /// Highest severity among matched rules.
    pub severity: Option<Severity>,
    pub risk_assessment: RiskAssessment,
    pub evaluations: Vec<RuleEvaluation>,
    pub anomalies: Vec<Anomaly>,
    pub degraded: bool,
    pub degradations: Vec<String>,
    pub context: EvaluationContext,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Verdict,
    RuleStoreUnavailable,
    FactorDegraded,
    RulesReloadFailed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Verdict => "verdict",
            AuditKind::RuleStoreUnavailable => "rule_store_unavailable",
            AuditKind::FactorDegraded => "factor_degraded",
            AuditKind::RulesReloadFailed => "rules_reload_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub evaluation_id: Option<Uuid>,
    pub severity: Severity,
    pub kind: AuditKind,
    pub message: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            evaluation_id: None,
            severity,
            kind,
            message: message.into(),
            payload: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn for_evaluation(mut self, id: Uuid) -> Self {
        self.evaluation_id = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// The full verdict as an audit record, at the severity of the worst
    /// matched rule or of the action, whichever is higher.
    pub fn from_verdict(verdict: &Verdict) -> Self {
        let by_action = match verdict.action {
            RuleAction::Block => Severity::High,
            RuleAction::Review => Severity::Medium,
            _ => Severity::Low,
        };
        let severity = verdict.severity.map_or(by_action, |s| s.max(by_action));
        let payload = serde_json::to_value(verdict).unwrap_or(serde_json::Value::Null);
        Self::new(
            AuditKind::Verdict,
            severity,
            format!("{} (score {:.3})", verdict.action.as_str(), verdict.risk_assessment.score),
        )
        .for_evaluation(verdict.evaluation_id)
        .with_payload(payload)
    }
}
