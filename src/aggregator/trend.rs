use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::core::{TrendBucket, TrendDimension};
use crate::error::StoreError;
use crate::sources::{TrendSource, TrendWindow};

#[derive(Debug, Clone)]
struct CachedTrend {
    built_at: DateTime<Utc>,
    buckets: Arc<Vec<TrendBucket>>,
}

/// Trend baselines per `(entity, dimension)`, rebuilt from the trend source
/// at most once per rebuild interval instead of on every transaction.
pub struct TrendCache {
    entries: DashMap<(String, TrendDimension), CachedTrend>,
    rebuild_interval: Duration,
    max_entries: usize,
}

impl TrendCache {
    pub fn new(rebuild_interval_seconds: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            rebuild_interval: Duration::seconds(rebuild_interval_seconds as i64),
            max_entries,
        }
    }

    pub async fn buckets(
        &self,
        source: &dyn TrendSource,
        entity_id: &str,
        dimension: TrendDimension,
        window: TrendWindow,
        now: DateTime<Utc>,
    ) -> Result<Arc<Vec<TrendBucket>>, StoreError> {
        let key = (entity_id.to_string(), dimension);
        let cached = self.entries.get(&key).map(|e| e.clone());
        if let Some(entry) = &cached {
            if now - entry.built_at < self.rebuild_interval {
                return Ok(Arc::clone(&entry.buckets));
            }
        }

        match source.trend_buckets(entity_id, dimension, window, now).await {
            Ok(buckets) => {
                let buckets = Arc::new(buckets);
                self.entries.insert(
                    key,
                    CachedTrend {
                        built_at: now,
                        buckets: Arc::clone(&buckets),
                    },
                );
                if self.entries.len() > self.max_entries {
                    self.evict_stale(now);
                }
                Ok(buckets)
            }
            Err(e) => match cached {
                Some(entry) => {
                    tracing::warn!(entity_id, dimension = dimension.as_str(), "Trend rebuild failed, serving stale baseline: {e}");
                    Ok(entry.buckets)
                }
                None => Err(e),
            },
        }
    }

    fn evict_stale(&self, now: DateTime<Utc>) {
        let interval = self.rebuild_interval;
        self.entries.retain(|_, e| now - e.built_at < interval);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{t0, StaticTrends};

    fn window() -> TrendWindow {
        TrendWindow {
            window_seconds: 10 * 86_400,
            bucket_seconds: 86_400,
        }
    }

    #[tokio::test]
    async fn serves_cache_until_rebuild_interval() {
        let source = StaticTrends::new(vec![10.0, 10.0, 10.0, 100.0]);
        let cache = TrendCache::new(600, 100);
        let first = cache
            .buckets(&source, "u1", TrendDimension::Volume, window(), t0())
            .await
            .unwrap();
        assert_eq!(first.len(), 4);
        cache
            .buckets(&source, "u1", TrendDimension::Volume, window(), t0() + Duration::seconds(599))
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        cache
            .buckets(&source, "u1", TrendDimension::Volume, window(), t0() + Duration::seconds(600))
            .await
            .unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn stale_cache_survives_source_failure() {
        let source = StaticTrends::new(vec![1.0, 2.0]);
        let cache = TrendCache::new(60, 100);
        cache
            .buckets(&source, "u1", TrendDimension::Frequency, window(), t0())
            .await
            .unwrap();
        source.set_failing(true);
        let stale = cache
            .buckets(&source, "u1", TrendDimension::Frequency, window(), t0() + Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(stale.len(), 2);
        let missing = cache
            .buckets(&source, "u2", TrendDimension::Frequency, window(), t0())
            .await;
        assert!(missing.is_err());
    }
}
