pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::DatabaseConfig;
use crate::core::{
    AuditEvent, EvaluationContext, GeoPoint, RuleAction, TrendBucket, TrendDimension,
};
use crate::error::StoreError;
use crate::rules::{FraudRule, RuleCondition};
use crate::sources::{
    AuditSink, EntityHistory, HistoryReader, RuleStore, TransactionLog, TrendSource, TrendWindow,
};

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database. Blocking SQLite calls are moved off
/// the async workers with `spawn_blocking`.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
    fraud_lookback_days: i64,
    known_value_limit: usize,
}

impl SharedDatabase {
    pub fn open(path: &Path, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
            fraud_lookback_days: config.fraud_lookback_days,
            known_value_limit: config.known_value_limit,
        })
    }

    fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let db = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
        f(&db)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with(f)).await?
    }

    /// Insert or replace a rule definition.
    pub fn upsert_rule(&self, rule: &FraudRule) -> Result<(), StoreError> {
        self.with(|db| db.upsert_rule(rule))
    }

    /// Record a confirmed fraud event against a user.
    pub fn record_fraud_event(&self, user_id: &str, kind: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with(|db| db.record_fraud_event(user_id, kind, at))
    }

    pub fn insert_transaction(
        &self,
        ctx: &EvaluationContext,
        action: RuleAction,
        local_hour: u32,
    ) -> Result<(), StoreError> {
        self.with(|db| db.insert_transaction(ctx, action, local_hour))
    }

    /// History with the fraud lookback measured back from `now`.
    pub fn history_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<EntityHistory, StoreError> {
        let since = self.fraud_since(now);
        let limit = self.known_value_limit;
        self.with(|db| db.entity_history(user_id, since, limit))
    }

    fn fraud_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.fraud_lookback_days)
    }

    /// Most recent audit events, newest first.
    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        self.with(|db| db.recent_audit_events(limit))
    }

    pub fn transaction_count(&self) -> Result<usize, StoreError> {
        self.with(|db| db.transaction_count())
    }
}

#[async_trait]
impl RuleStore for SharedDatabase {
    async fn load_rules(&self) -> Result<Vec<FraudRule>, StoreError> {
        self.blocking(|db| db.load_rules()).await
    }
}

#[async_trait]
impl HistoryReader for SharedDatabase {
    async fn entity_history(&self, entity_id: &str) -> Result<EntityHistory, StoreError> {
        let user_id = entity_id.to_string();
        // Fraud confirmations are stamped by the store, so the lookback runs
        // on the wall clock rather than the transaction's own timestamp.
        let since = self.fraud_since(Utc::now());
        let limit = self.known_value_limit;
        self.blocking(move |db| db.entity_history(&user_id, since, limit))
            .await
    }
}

#[async_trait]
impl TrendSource for SharedDatabase {
    async fn trend_buckets(
        &self,
        entity_id: &str,
        dimension: TrendDimension,
        window: TrendWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        let user_id = entity_id.to_string();
        self.blocking(move |db| db.trend_buckets(&user_id, dimension, window, now))
            .await
    }
}

#[async_trait]
impl AuditSink for SharedDatabase {
    async fn record(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.blocking(move |db| db.insert_audit_event(&event)).await
    }
}

#[async_trait]
impl TransactionLog for SharedDatabase {
    async fn record_transaction(
        &self,
        ctx: &EvaluationContext,
        action: RuleAction,
        local_hour: u32,
    ) -> Result<(), StoreError> {
        let ctx = ctx.clone();
        self.blocking(move |db| db.insert_transaction(&ctx, action, local_hour))
            .await
    }
}

/// Read a lowercase enum (severity, action) stored as plain text.
fn parse_label<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|e| StoreError::Malformed(format!("{text:?}: {e}")))
}

fn label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// SQL expression that reduces one bucket of transactions for a dimension.
fn dimension_expr(dimension: TrendDimension) -> &'static str {
    match dimension {
        TrendDimension::Volume => "SUM(amount)",
        TrendDimension::Frequency => "COUNT(*)",
        TrendDimension::Recipient => "COUNT(DISTINCT recipient_id)",
        TrendDimension::Category => "COUNT(DISTINCT category)",
        TrendDimension::Time => "AVG(local_hour)",
        TrendDimension::Location => {
            "COUNT(DISTINCT CAST(ROUND(latitude, 1) AS TEXT) || ',' || CAST(ROUND(longitude, 1) AS TEXT))"
        }
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn upsert_rule(&self, rule: &FraudRule) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&rule.conditions)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO fraud_rules (id, name, conditions, severity, action, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            rusqlite::params![
                rule.id,
                rule.name,
                conditions,
                label(&rule.severity),
                label(&rule.action),
                rule.is_active as i32
            ],
        )?;
        Ok(())
    }

    /// All rules, active or not. The engine skips inactive ones.
    pub fn load_rules(&self) -> Result<Vec<FraudRule>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, conditions, severity, action, is_active FROM fraud_rules ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i32>(5)?,
            ))
        })?;

        let mut rules = Vec::new();
        for row in rows {
            let (id, name, conditions, severity, action, is_active) = row?;
            let conditions: Vec<RuleCondition> = serde_json::from_str(&conditions)
                .map_err(|e| StoreError::Malformed(format!("rule {id}: {e}")))?;
            rules.push(FraudRule {
                severity: parse_label(&severity)?,
                action: parse_label(&action)?,
                id,
                name,
                conditions,
                is_active: is_active != 0,
            });
        }
        Ok(rules)
    }

    pub fn insert_transaction(
        &self,
        ctx: &EvaluationContext,
        action: RuleAction,
        local_hour: u32,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO transactions (evaluation_id, user_id, amount, transaction_type, ip,
                device_fingerprint, latitude, longitude, recipient_id, category, local_hour, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                ctx.evaluation_id.to_string(),
                ctx.user_id,
                ctx.amount,
                ctx.transaction_type.as_str(),
                ctx.ip,
                ctx.device_fingerprint,
                ctx.location.map(|p| p.lat),
                ctx.location.map(|p| p.lng),
                ctx.recipient_id,
                ctx.category,
                local_hour,
                action.as_str(),
                ctx.timestamp.timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn record_fraud_event(&self, user_id: &str, kind: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO fraud_events (user_id, kind, confirmed_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, kind, at.timestamp()],
        )?;
        Ok(())
    }

    /// Behavioral summary built from non-blocked transactions. Fraud events
    /// older than `fraud_since` are ignored.
    pub fn entity_history(
        &self,
        user_id: &str,
        fraud_since: DateTime<Utc>,
        known_limit: usize,
    ) -> Result<EntityHistory, StoreError> {
        let (count, avg_amount, max_amount) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(amount), 0), COALESCE(MAX(amount), 0)
             FROM transactions WHERE user_id = ?1 AND action != 'block'",
            rusqlite::params![user_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?)),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT device_fingerprint FROM transactions
             WHERE user_id = ?1 AND action != 'block'
             GROUP BY device_fingerprint ORDER BY MAX(created_at) DESC LIMIT ?2",
        )?;
        let known_devices = stmt
            .query_map(rusqlite::params![user_id, known_limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT AVG(latitude), AVG(longitude) FROM transactions
             WHERE user_id = ?1 AND action != 'block' AND latitude IS NOT NULL AND longitude IS NOT NULL
             GROUP BY ROUND(latitude, 2), ROUND(longitude, 2) ORDER BY MAX(created_at) DESC LIMIT ?2",
        )?;
        let known_locations = stmt
            .query_map(rusqlite::params![user_id, known_limit as i64], |row| {
                Ok(GeoPoint::new(row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let fraud_event_count = self.conn.query_row(
            "SELECT COUNT(*) FROM fraud_events WHERE user_id = ?1 AND confirmed_at >= ?2",
            rusqlite::params![user_id, fraud_since.timestamp()],
            |row| row.get::<_, i64>(0),
        )?;

        let mut hourly_activity = [0u64; 24];
        let mut stmt = self.conn.prepare(
            "SELECT local_hour, COUNT(*) FROM transactions
             WHERE user_id = ?1 AND action != 'block' GROUP BY local_hour",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (hour, n) = row?;
            let slot = usize::try_from(hour)
                .ok()
                .and_then(|h| hourly_activity.get_mut(h))
                .ok_or_else(|| StoreError::Malformed(format!("local_hour {hour} out of range")))?;
            *slot = n as u64;
        }

        Ok(EntityHistory {
            avg_amount,
            max_amount,
            transaction_count: count as u64,
            known_devices,
            known_locations,
            fraud_event_count: fraud_event_count as u32,
            hourly_activity,
        })
    }

    /// Non-empty buckets aligned so the newest one ends at `now`, oldest first.
    pub fn trend_buckets(
        &self,
        user_id: &str,
        dimension: TrendDimension,
        window: TrendWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        if window.bucket_seconds == 0 {
            return Err(StoreError::Malformed("bucket width of 0s".into()));
        }
        let start = now.timestamp() - window.window_seconds as i64;
        let width = window.bucket_seconds as i64;
        let sql = format!(
            "SELECT (?4 - created_at) / ?3 AS age, {}
             FROM transactions
             WHERE user_id = ?1 AND created_at > ?2 AND created_at <= ?4
             GROUP BY age ORDER BY age DESC",
            dimension_expr(dimension)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![user_id, start, width, now.timestamp()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?)),
        )?;

        let mut buckets = Vec::new();
        for row in rows {
            let (age, value) = row?;
            let bucket_start = DateTime::from_timestamp(now.timestamp() - (age + 1) * width, 0)
                .ok_or_else(|| StoreError::Malformed(format!("bucket {age} out of range")))?;
            buckets.push(TrendBucket {
                dimension,
                start: bucket_start,
                value: value.unwrap_or(0.0),
            });
        }
        Ok(buckets)
    }

    pub fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn.execute(
            "INSERT INTO audit_events (evaluation_id, kind, severity, message, payload, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                event.evaluation_id.map(|id| id.to_string()),
                event.kind.as_str(),
                event.severity.as_str(),
                event.message,
                payload,
                event.at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT evaluation_id, kind, severity, message, payload, at
             FROM audit_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (evaluation_id, kind, severity, message, payload, at) = row?;
            let evaluation_id = evaluation_id
                .map(|id| id.parse())
                .transpose()
                .map_err(|e| StoreError::Malformed(format!("evaluation id: {e}")))?;
            let at = DateTime::parse_from_rfc3339(&at)
                .map_err(|e| StoreError::Malformed(format!("audit time {at:?}: {e}")))?
                .with_timezone(&Utc);
            events.push(AuditEvent {
                evaluation_id,
                kind: parse_label(&kind)?,
                severity: parse_label(&severity)?,
                message,
                payload: match payload {
                    Some(p) => serde_json::from_str(&p)?,
                    None => serde_json::Value::Null,
                },
                at,
            });
        }
        Ok(events)
    }

    pub fn transaction_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get::<_, i64>(0))?;
        Ok(count as usize)
    }
}
