pub mod members;
pub mod trend;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::AggregatorConfig;
use crate::core::{EntityKey, GeoPoint};
use crate::error::AggregatorError;
use members::{MemberKind, MemberSets};
use trend::TrendCache;

/// Field every transaction amount is accounted under.
pub const AMOUNT_FIELD: &str = "amount";

/// How a window's counters are reduced for a rule condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    /// Name read from the rule store that we don't know how to compute.
    Unsupported(String),
}

impl From<String> for Aggregation {
    fn from(s: String) -> Self {
        match s.as_str() {
            "count" => Aggregation::Count,
            "sum" => Aggregation::Sum,
            "avg" => Aggregation::Avg,
            _ => Aggregation::Unsupported(s),
        }
    }
}

impl From<Aggregation> for String {
    fn from(a: Aggregation) -> Self {
        a.to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Count => f.write_str("count"),
            Aggregation::Sum => f.write_str("sum"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Unsupported(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub entity: EntityKey,
    pub field: String,
    pub window_seconds: u64,
}

/// Counters for one fixed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateValue {
    pub count: u64,
    pub sum: f64,
    pub window_start: DateTime<Utc>,
}

impl AggregateValue {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            window_start: now,
        }
    }

    fn expired(&self, window_seconds: u64, now: DateTime<Utc>) -> bool {
        now - self.window_start > Duration::seconds(window_seconds as i64)
    }

    fn reduce(&self, aggregation: &Aggregation) -> f64 {
        match aggregation {
            Aggregation::Count => self.count as f64,
            Aggregation::Sum => self.sum,
            Aggregation::Avg if self.count == 0 => 0.0,
            Aggregation::Avg => self.sum / self.count as f64,
            Aggregation::Unsupported(_) => 0.0,
        }
    }
}

/// Per-entity expiring counters, plus the bounded member sets and trend
/// baselines that back the device/location factors and anomaly detection.
///
/// Windows are fixed: a window opens on the first observation and is reset
/// lazily by the next read or write that finds it older than its span.
/// Nothing runs on a timer.
pub struct RollingAggregator {
    counters: DashMap<AggregateKey, AggregateValue>,
    windows: DashMap<String, BTreeSet<u64>>,
    max_entries: usize,
    members: MemberSets,
    trends: TrendCache,
}

impl RollingAggregator {
    pub fn new(config: &AggregatorConfig, trend_rebuild_seconds: u64) -> Self {
        Self {
            counters: DashMap::new(),
            windows: DashMap::new(),
            max_entries: config.max_entries,
            members: MemberSets::new(config.member_set_capacity, config.member_ttl_seconds),
            trends: TrendCache::new(trend_rebuild_seconds, config.max_entries),
        }
    }

    /// Start tracking `field` over a window of `window_seconds`. Idempotent.
    pub fn register_window(&self, field: &str, window_seconds: u64) {
        let added = self
            .windows
            .entry(field.to_string())
            .or_default()
            .insert(window_seconds);
        if added {
            tracing::debug!(field, window_seconds, "Aggregator tracking new window");
        }
    }

    pub fn is_tracked(&self, field: &str, window_seconds: u64) -> bool {
        self.windows
            .get(field)
            .is_some_and(|w| w.contains(&window_seconds))
    }

    /// Account one observation in every tracked window of `field`.
    pub fn observe(&self, entity: &EntityKey, field: &str, amount: f64, now: DateTime<Utc>) {
        let windows: Vec<u64> = match self.windows.get(field) {
            Some(w) => w.iter().copied().collect(),
            None => return,
        };

        for window_seconds in windows {
            let key = AggregateKey {
                entity: entity.clone(),
                field: field.to_string(),
                window_seconds,
            };
            // The entry guard holds the shard lock, so reset + increment is one step.
            let mut entry = self
                .counters
                .entry(key)
                .or_insert_with(|| AggregateValue::fresh(now));
            if entry.expired(window_seconds, now) {
                *entry = AggregateValue::fresh(now);
            }
            entry.count += 1;
            entry.sum += amount;
        }

        if self.counters.len() > self.max_entries {
            self.prune_expired(now);
        }
    }

    pub fn query(
        &self,
        entity: &EntityKey,
        field: &str,
        aggregation: &Aggregation,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<f64, AggregatorError> {
        if let Aggregation::Unsupported(name) = aggregation {
            return Err(AggregatorError::UnsupportedAggregation(name.clone()));
        }
        if !self.is_tracked(field, window_seconds) {
            return Err(AggregatorError::WindowNotTracked {
                field: field.to_string(),
                window_seconds,
            });
        }

        let key = AggregateKey {
            entity: entity.clone(),
            field: field.to_string(),
            window_seconds,
        };
        let current = self.counters.get(&key).map(|v| *v);
        match current {
            Some(value) if !value.expired(window_seconds, now) => Ok(value.reduce(aggregation)),
            Some(_) => {
                self.counters
                    .remove_if(&key, |_, v| v.expired(window_seconds, now));
                Ok(0.0)
            }
            None => Ok(0.0),
        }
    }

    /// Raw counters for a window, if it is live at `now`.
    pub fn snapshot(
        &self,
        entity: &EntityKey,
        field: &str,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> Option<AggregateValue> {
        let key = AggregateKey {
            entity: entity.clone(),
            field: field.to_string(),
            window_seconds,
        };
        self.counters
            .get(&key)
            .map(|v| *v)
            .filter(|v| !v.expired(window_seconds, now))
    }

    /// Drop every expired window.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|key, value| !value.expired(key.window_seconds, now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired aggregate windows");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn remember_device(&self, user: &EntityKey, fingerprint: &str, now: DateTime<Utc>) {
        self.members
            .remember(user, MemberKind::Device, fingerprint, now);
    }

    pub fn knows_device(&self, user: &EntityKey, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.members
            .contains(user, MemberKind::Device, fingerprint, now)
    }

    pub fn remember_location(&self, user: &EntityKey, point: GeoPoint, now: DateTime<Utc>) {
        self.members
            .remember(user, MemberKind::Location, &members::encode_point(point), now);
    }

    pub fn recent_locations(&self, user: &EntityKey, now: DateTime<Utc>) -> Vec<GeoPoint> {
        self.members
            .members(user, MemberKind::Location, now)
            .iter()
            .filter_map(|m| members::decode_point(m))
            .collect()
    }

    pub fn trends(&self) -> &TrendCache {
        &self.trends
    }
}
