//! Fakes shared by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::core::{AuditEvent, EvaluationContext, GeoPoint, TransactionType, TrendBucket, TrendDimension};
use crate::error::StoreError;
use crate::rules::FraudRule;
use crate::sources::{AuditSink, EntityHistory, HistoryReader, RuleStore, TrendSource, TrendWindow};

pub fn t0() -> DateTime<Utc> {
    "2026-03-01T10:00:00Z".parse().unwrap()
}

pub fn context(user_id: &str, amount: f64) -> EvaluationContext {
    EvaluationContext {
        evaluation_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        amount,
        transaction_type: TransactionType::Transfer,
        ip: "10.0.0.1".to_string(),
        device_fingerprint: "dev-1".to_string(),
        location: Some(GeoPoint::new(4.0511, 9.7679)),
        recipient_id: Some("r-1".to_string()),
        category: None,
        utc_offset_minutes: None,
        timestamp: t0(),
    }
}

#[derive(Default)]
pub struct StaticHistory {
    history: EntityHistory,
    calls: AtomicUsize,
}

impl StaticHistory {
    pub fn new(history: EntityHistory) -> Self {
        Self {
            history,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryReader for StaticHistory {
    async fn entity_history(&self, _entity_id: &str) -> Result<EntityHistory, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.history.clone())
    }
}

pub struct FailingHistory;

#[async_trait]
impl HistoryReader for FailingHistory {
    async fn entity_history(&self, _entity_id: &str) -> Result<EntityHistory, StoreError> {
        Err(StoreError::Unavailable("history service down".into()))
    }
}

/// Daily buckets ending at `t0()`, oldest first.
pub struct StaticTrends {
    values: Vec<f64>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticTrends {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrendSource for StaticTrends {
    async fn trend_buckets(
        &self,
        _entity_id: &str,
        dimension: TrendDimension,
        _window: TrendWindow,
        _now: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("trend store down".into()));
        }
        let n = self.values.len() as i64;
        Ok(self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| TrendBucket {
                dimension,
                start: t0() - Duration::days(n - 1 - i as i64),
                value: *v,
            })
            .collect())
    }
}

pub struct MemoryRuleStore {
    rules: Mutex<Vec<FraudRule>>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<FraudRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load_rules(&self) -> Result<Vec<FraudRule>, StoreError> {
        Ok(self.rules.lock().unwrap().clone())
    }
}

pub struct FailingRuleStore;

#[async_trait]
impl RuleStore for FailingRuleStore {
    async fn load_rules(&self) -> Result<Vec<FraudRule>, StoreError> {
        Err(StoreError::Unavailable("rule store unreachable".into()))
    }
}

/// Fails the first `failures` writes, then records.
#[derive(Default)]
pub struct RecordingAudit {
    pub events: Mutex<Vec<AuditEvent>>,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl RecordingAudit {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("audit store busy".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
