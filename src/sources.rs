//! Narrow interfaces to the collaborators the engine reads from and writes to.
//!
//! The engine never owns these stores; the composition root injects them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AuditEvent, EvaluationContext, GeoPoint, RuleAction, TrendBucket, TrendDimension};
use crate::error::StoreError;
use crate::rules::FraudRule;

/// Behavioral summary of an entity, as recorded by the transaction platform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityHistory {
    pub avg_amount: f64,
    pub max_amount: f64,
    pub transaction_count: u64,
    pub known_devices: Vec<String>,
    pub known_locations: Vec<GeoPoint>,
    /// Confirmed fraud events inside the store's lookback window.
    pub fraud_event_count: u32,
    /// Transactions per local hour of day.
    pub hourly_activity: [u64; 24],
}

/// Span and granularity of a trend baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendWindow {
    pub window_seconds: u64,
    pub bucket_seconds: u64,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<FraudRule>, StoreError>;
}

#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn entity_history(&self, entity_id: &str) -> Result<EntityHistory, StoreError>;
}

#[async_trait]
pub trait TrendSource: Send + Sync {
    /// Non-empty buckets in `[now - window, now]`, oldest first.
    async fn trend_buckets(
        &self,
        entity_id: &str,
        dimension: TrendDimension,
        window: TrendWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>, StoreError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError>;
}

/// Where the transaction pipeline writes back what it decided.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn record_transaction(
        &self,
        ctx: &EvaluationContext,
        action: RuleAction,
        local_hour: u32,
    ) -> Result<(), StoreError>;
}
