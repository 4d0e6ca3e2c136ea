//! Declarative fraud rules.
//!
//! Rules arrive from an external store as plain data. Before use they are
//! compiled into a [`RuleSet`]: operators and aggregations are resolved,
//! regexes built and windows bounded, so that an invalid definition is
//! refused at load time instead of surfacing mid-evaluation.
//!
//! Conditions within a rule combine with AND only.

pub mod book;
pub mod engine;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregator::{Aggregation, AMOUNT_FIELD};
use crate::config::RulesConfig;
use crate::core::{EntityKind, EvaluationContext, RuleAction, Severity};
use crate::error::RuleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRule {
    pub id: String,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub severity: Severity,
    pub action: RuleAction,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_seconds: Option<u64>,
    /// Entity an aggregated condition is accounted against.
    #[serde(default)]
    pub entity: EntityKind,
}

impl RuleCondition {
    pub fn simple(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
            aggregation: None,
            time_window_seconds: None,
            entity: EntityKind::User,
        }
    }

    pub fn aggregated(
        field: &str,
        aggregation: Aggregation,
        window_seconds: u64,
        operator: ConditionOperator,
        value: Value,
    ) -> Self {
        Self {
            aggregation: Some(aggregation),
            time_window_seconds: Some(window_seconds),
            ..Self::simple(field, operator, value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex,
    /// `custom:<name>`, resolved against registered [`CustomOperator`]s.
    Custom(String),
    Unsupported(String),
}

impl From<String> for ConditionOperator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "eq" => ConditionOperator::Eq,
            "neq" => ConditionOperator::Neq,
            "gt" => ConditionOperator::Gt,
            "gte" => ConditionOperator::Gte,
            "lt" => ConditionOperator::Lt,
            "lte" => ConditionOperator::Lte,
            "in" => ConditionOperator::In,
            "nin" => ConditionOperator::Nin,
            "regex" => ConditionOperator::Regex,
            other => match other.strip_prefix("custom:") {
                Some(name) => ConditionOperator::Custom(name.to_string()),
                None => ConditionOperator::Unsupported(s),
            },
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(op: ConditionOperator) -> Self {
        op.to_string()
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionOperator::Eq => f.write_str("eq"),
            ConditionOperator::Neq => f.write_str("neq"),
            ConditionOperator::Gt => f.write_str("gt"),
            ConditionOperator::Gte => f.write_str("gte"),
            ConditionOperator::Lt => f.write_str("lt"),
            ConditionOperator::Lte => f.write_str("lte"),
            ConditionOperator::In => f.write_str("in"),
            ConditionOperator::Nin => f.write_str("nin"),
            ConditionOperator::Regex => f.write_str("regex"),
            ConditionOperator::Custom(name) => write!(f, "custom:{name}"),
            ConditionOperator::Unsupported(name) => f.write_str(name),
        }
    }
}

/// A field a simple condition can read from the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    Amount,
    TransactionType,
    UserId,
    Ip,
    DeviceFingerprint,
    RecipientId,
    Category,
    Latitude,
    Longitude,
    LocalHour,
}

impl ContextField {
    pub fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "amount" => ContextField::Amount,
            "transaction_type" | "transactionType" => ContextField::TransactionType,
            "user_id" | "userId" => ContextField::UserId,
            "ip" => ContextField::Ip,
            "device_fingerprint" | "deviceFingerprint" => ContextField::DeviceFingerprint,
            "recipient_id" | "recipientId" => ContextField::RecipientId,
            "category" => ContextField::Category,
            "location.lat" | "latitude" => ContextField::Latitude,
            "location.lng" | "longitude" => ContextField::Longitude,
            "hour" | "local_hour" => ContextField::LocalHour,
            _ => return None,
        };
        Some(field)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ContextField::Amount
            | ContextField::Latitude
            | ContextField::Longitude
            | ContextField::LocalHour => ValueKind::Number,
            ContextField::TransactionType
            | ContextField::UserId
            | ContextField::Ip
            | ContextField::DeviceFingerprint
            | ContextField::RecipientId
            | ContextField::Category => ValueKind::Text,
        }
    }

    pub fn resolve(&self, ctx: &EvaluationContext, default_utc_offset_minutes: i32) -> FieldValue {
        match self {
            ContextField::Amount => FieldValue::Number(ctx.amount),
            ContextField::TransactionType => FieldValue::Text(ctx.transaction_type.as_str().to_string()),
            ContextField::UserId => FieldValue::Text(ctx.user_id.clone()),
            ContextField::Ip => FieldValue::Text(ctx.ip.clone()),
            ContextField::DeviceFingerprint => FieldValue::Text(ctx.device_fingerprint.clone()),
            ContextField::RecipientId => ctx.recipient_id.clone().map_or(FieldValue::Missing, FieldValue::Text),
            ContextField::Category => ctx.category.clone().map_or(FieldValue::Missing, FieldValue::Text),
            ContextField::Latitude => ctx.location.map_or(FieldValue::Missing, |p| FieldValue::Number(p.lat)),
            ContextField::Longitude => ctx.location.map_or(FieldValue::Missing, |p| FieldValue::Number(p.lng)),
            ContextField::LocalHour => {
                FieldValue::Number(ctx.local_hour(default_utc_offset_minutes) as f64)
            }
        }
    }
}

/// Type of value a condition source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Text,
}

impl ValueKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::Number => value.is_number(),
            ValueKind::Text => value.is_string(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Number => f.write_str("number"),
            ValueKind::Text => f.write_str("text"),
        }
    }
}

/// Value a condition is tested against.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Missing,
}

impl FieldValue {
    pub fn to_json(&self) -> Option<Value> {
        match self {
            FieldValue::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
            FieldValue::Text(s) => Some(Value::String(s.clone())),
            FieldValue::Missing => None,
        }
    }

    fn equals(&self, expected: &Value) -> bool {
        match (self, expected) {
            (FieldValue::Number(a), Value::Number(b)) => {
                b.as_f64().is_some_and(|b| (a - b).abs() < 1e-9)
            }
            (FieldValue::Text(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

/// Escape hatch for predicates the closed operator set can't express.
pub trait CustomOperator: Send + Sync {
    /// Check `expected` once at load time.
    fn validate(&self, expected: &Value) -> Result<(), String>;
    fn matches(&self, actual: &FieldValue, expected: &Value) -> bool;
}

/// `custom:prefix` — text starts with any of the given prefixes
/// (phone ranges, IP blocks).
pub struct PrefixOperator;

impl CustomOperator for PrefixOperator {
    fn validate(&self, expected: &Value) -> Result<(), String> {
        match expected {
            Value::String(_) => Ok(()),
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(()),
            _ => Err("prefix expects a string or an array of strings".into()),
        }
    }

    fn matches(&self, actual: &FieldValue, expected: &Value) -> bool {
        let FieldValue::Text(text) = actual else {
            return false;
        };
        match expected {
            Value::String(p) => text.starts_with(p.as_str()),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .any(|p| text.starts_with(p)),
            _ => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct CustomOperators {
    operators: HashMap<String, Arc<dyn CustomOperator>>,
}

impl CustomOperators {
    pub fn with_builtins() -> Self {
        let mut ops = Self::default();
        ops.register("prefix", Arc::new(PrefixOperator));
        ops
    }

    pub fn register(&mut self, name: &str, op: Arc<dyn CustomOperator>) {
        self.operators.insert(name.to_string(), op);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomOperator>> {
        self.operators.get(name).cloned()
    }
}

/// Operator with everything it needs pre-resolved.
#[derive(Clone)]
pub enum Matcher {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex(Regex),
    Custom(Arc<dyn CustomOperator>),
    /// Only reachable for sets built without `compile`.
    Unsupported(String),
}

impl Matcher {
    /// `Err` carries a configuration problem; the condition then fails closed.
    pub fn matches(&self, actual: &FieldValue, expected: &Value) -> Result<bool, String> {
        if let FieldValue::Missing = actual {
            return Ok(false);
        }
        let ordered = |cmp: fn(f64, f64) -> bool| match (actual, expected.as_f64()) {
            (FieldValue::Number(a), Some(b)) => Ok(cmp(*a, b)),
            (FieldValue::Number(_), None) => Err(format!("expected a number, found {expected}")),
            (FieldValue::Text(_), _) => Err("ordered comparison on a text field".to_string()),
            (FieldValue::Missing, _) => Ok(false),
        };
        let list = || match expected {
            Value::Array(items) => Ok(items.iter().any(|v| actual.equals(v))),
            _ => Err(format!("expected a list, found {expected}")),
        };

        match self {
            Matcher::Eq => Ok(actual.equals(expected)),
            Matcher::Neq => Ok(!actual.equals(expected)),
            Matcher::Gt => ordered(|a, b| a > b),
            Matcher::Gte => ordered(|a, b| a >= b),
            Matcher::Lt => ordered(|a, b| a < b),
            Matcher::Lte => ordered(|a, b| a <= b),
            Matcher::In => list(),
            Matcher::Nin => list().map(|found| !found),
            Matcher::Regex(re) => Ok(match actual {
                FieldValue::Text(s) => re.is_match(s),
                FieldValue::Number(n) => re.is_match(&n.to_string()),
                FieldValue::Missing => false,
            }),
            Matcher::Custom(op) => Ok(op.matches(actual, expected)),
            Matcher::Unsupported(name) => Err(format!("unsupported operator {name}")),
        }
    }
}

#[derive(Clone)]
pub enum ConditionSource {
    Context(ContextField),
    Aggregate {
        entity: EntityKind,
        field: String,
        aggregation: Aggregation,
        window_seconds: u64,
    },
}

impl ConditionSource {
    pub fn kind(&self) -> ValueKind {
        match self {
            ConditionSource::Context(field) => field.kind(),
            ConditionSource::Aggregate { .. } => ValueKind::Number,
        }
    }
}

#[derive(Clone)]
pub struct CompiledCondition {
    pub definition: RuleCondition,
    pub source: ConditionSource,
    pub matcher: Matcher,
}

#[derive(Clone)]
pub struct CompiledRule {
    pub rule: FraudRule,
    pub conditions: Vec<CompiledCondition>,
}

/// An immutable, validated snapshot of the rule store.
#[derive(Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    loaded_at: DateTime<Utc>,
}

/// Fields the aggregator accounts; aggregated conditions may only read these.
const AGGREGATE_FIELDS: [&str; 1] = [AMOUNT_FIELD];

impl RuleSet {
    pub fn compile(
        rules: Vec<FraudRule>,
        custom: &CustomOperators,
        limits: &RulesConfig,
        loaded_at: DateTime<Utc>,
    ) -> Result<Self, RuleError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateId(rule.id));
            }
            compiled.push(compile_rule(rule, custom, limits)?);
        }
        Ok(Self {
            rules: compiled,
            loaded_at,
        })
    }

    /// Build a set without validation, for callers that assemble rules in code.
    pub fn from_compiled(rules: Vec<CompiledRule>, loaded_at: DateTime<Utc>) -> Self {
        Self { rules, loaded_at }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn active(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|r| r.rule.is_active)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every `(field, window)` an aggregated condition reads.
    pub fn windows(&self) -> BTreeSet<(String, u64)> {
        self.rules
            .iter()
            .flat_map(|r| r.conditions.iter())
            .filter_map(|c| match &c.source {
                ConditionSource::Aggregate {
                    field,
                    window_seconds,
                    ..
                } => Some((field.clone(), *window_seconds)),
                ConditionSource::Context(_) => None,
            })
            .collect()
    }
}

fn compile_rule(
    rule: FraudRule,
    custom: &CustomOperators,
    limits: &RulesConfig,
) -> Result<CompiledRule, RuleError> {
    let invalid = |reason: String| RuleError::Invalid {
        rule_id: rule.id.clone(),
        reason,
    };
    if rule.conditions.is_empty() {
        return Err(invalid("rule has no conditions".into()));
    }

    let mut conditions = Vec::with_capacity(rule.conditions.len());
    for (i, cond) in rule.conditions.iter().enumerate() {
        let compiled = compile_condition(cond, custom, limits)
            .map_err(|reason| invalid(format!("condition {i} ({}): {reason}", cond.field)))?;
        conditions.push(compiled);
    }
    Ok(CompiledRule { rule, conditions })
}

fn compile_condition(
    cond: &RuleCondition,
    custom: &CustomOperators,
    limits: &RulesConfig,
) -> Result<CompiledCondition, String> {
    let source = match (&cond.aggregation, cond.time_window_seconds) {
        (None, None) => ConditionSource::Context(
            ContextField::parse(&cond.field).ok_or_else(|| format!("unknown field {}", cond.field))?,
        ),
        (None, Some(_)) => return Err("time window without an aggregation".into()),
        (Some(_), None) => return Err("aggregation without a time window".into()),
        (Some(Aggregation::Unsupported(name)), Some(_)) => {
            return Err(format!("unsupported aggregation {name}"));
        }
        (Some(aggregation), Some(window)) => {
            if window == 0 || window > limits.max_window_seconds {
                return Err(format!(
                    "window {window}s outside 1..={}s",
                    limits.max_window_seconds
                ));
            }
            if !AGGREGATE_FIELDS.contains(&cond.field.as_str()) {
                return Err(format!("field {} is not aggregated", cond.field));
            }
            ConditionSource::Aggregate {
                entity: cond.entity,
                field: cond.field.clone(),
                aggregation: aggregation.clone(),
                window_seconds: window,
            }
        }
    };

    let kind = source.kind();
    let typed = |v: &Value| {
        if kind.accepts(v) {
            Ok(())
        } else {
            Err(format!("{} on a {kind} field expects a {kind} value, found {v}", cond.operator))
        }
    };
    let ordered = |v: &Value| {
        if kind != ValueKind::Number {
            return Err(format!("{} needs a number field, {} is {kind}", cond.operator, cond.field));
        }
        typed(v)
    };
    let list = |v: &Value| match v {
        Value::Array(items) => items.iter().try_for_each(typed),
        _ => Err(format!("{} expects a list, found {v}", cond.operator)),
    };

    let matcher = match &cond.operator {
        ConditionOperator::Eq => typed(&cond.value).map(|_| Matcher::Eq)?,
        ConditionOperator::Neq => typed(&cond.value).map(|_| Matcher::Neq)?,
        ConditionOperator::Gt => ordered(&cond.value).map(|_| Matcher::Gt)?,
        ConditionOperator::Gte => ordered(&cond.value).map(|_| Matcher::Gte)?,
        ConditionOperator::Lt => ordered(&cond.value).map(|_| Matcher::Lt)?,
        ConditionOperator::Lte => ordered(&cond.value).map(|_| Matcher::Lte)?,
        ConditionOperator::In => list(&cond.value).map(|_| Matcher::In)?,
        ConditionOperator::Nin => list(&cond.value).map(|_| Matcher::Nin)?,
        ConditionOperator::Regex => {
            let pattern = cond
                .value
                .as_str()
                .ok_or_else(|| format!("regex expects a string, found {}", cond.value))?;
            Matcher::Regex(Regex::new(pattern).map_err(|e| format!("bad regex: {e}"))?)
        }
        ConditionOperator::Custom(name) => {
            let op = custom
                .get(name)
                .ok_or_else(|| format!("custom operator {name} is not registered"))?;
            op.validate(&cond.value)?;
            Matcher::Custom(op)
        }
        ConditionOperator::Unsupported(name) => {
            return Err(format!("unsupported operator {name}"));
        }
    };

    Ok(CompiledCondition {
        definition: cond.clone(),
        source,
        matcher,
    })
}
