use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::aggregator::RollingAggregator;
use crate::config::AnomalyConfig;
use crate::core::{Anomaly, RuleAction, TrendBucket, TrendDimension};
use crate::error::StoreError;
use crate::sources::{TrendSource, TrendWindow};

/// Population mean and standard deviation.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Flag buckets that sit more than `z_threshold` standard deviations away
/// from the baseline formed by the other buckets.
///
/// A baseline needs at least two buckets, so fewer than three buckets yields
/// nothing. Against a flat baseline there is no z-score; a bucket is flagged
/// only if it departs from the baseline mean by more than
/// `min_relative_deviation` times that mean (taken as at least 1).
pub fn detect_anomalies(
    entity_id: &str,
    buckets: &[TrendBucket],
    z_threshold: f64,
    min_relative_deviation: f64,
) -> Vec<Anomaly> {
    if buckets.len() < 3 {
        return Vec::new();
    }
    let values: Vec<f64> = buckets.iter().map(|b| b.value).collect();
    let last = buckets.len() - 1;

    let mut anomalies = Vec::new();
    let mut baseline = Vec::with_capacity(values.len() - 1);
    for (i, bucket) in buckets.iter().enumerate() {
        baseline.clear();
        baseline.extend(
            values
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, v)| *v),
        );
        let (mean, std_dev) = mean_std(&baseline);
        let deviation = bucket.value - mean;

        let (flagged, z_score) = if std_dev > f64::EPSILON {
            let z = deviation / std_dev;
            (z.abs() > z_threshold, Some(z))
        } else {
            let floor = min_relative_deviation * mean.abs().max(1.0);
            (deviation.abs() > floor, None)
        };

        if flagged {
            anomalies.push(Anomaly {
                entity_id: entity_id.to_string(),
                dimension: bucket.dimension,
                bucket_start: bucket.start,
                value: bucket.value,
                mean,
                std_dev,
                z_score,
                latest: i == last,
            });
        }
    }
    anomalies
}

/// Action floor implied by a set of anomalies: only a deviation in the
/// current bucket escalates, and never past `ceiling`.
pub fn escalation(anomalies: &[Anomaly], ceiling: RuleAction) -> RuleAction {
    if anomalies.iter().any(|a| a.latest) {
        ceiling.min(RuleAction::Review)
    } else {
        RuleAction::Allow
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyScan {
    pub anomalies: Vec<Anomaly>,
    /// Dimensions whose baseline could not be built.
    pub failures: Vec<String>,
}

pub struct AnomalyDetector {
    source: Arc<dyn TrendSource>,
    aggregator: Arc<RollingAggregator>,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(source: Arc<dyn TrendSource>, aggregator: Arc<RollingAggregator>, config: AnomalyConfig) -> Self {
        Self {
            source,
            aggregator,
            config,
        }
    }

    pub fn window(&self) -> TrendWindow {
        TrendWindow {
            window_seconds: self.config.window_seconds,
            bucket_seconds: self.config.bucket_seconds,
        }
    }

    pub fn escalation_ceiling(&self) -> RuleAction {
        self.config.escalation_action
    }

    pub async fn detect(
        &self,
        entity_id: &str,
        dimension: TrendDimension,
        window: TrendWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>, StoreError> {
        let buckets = self
            .aggregator
            .trends()
            .buckets(self.source.as_ref(), entity_id, dimension, window, now)
            .await?;
        let mut anomalies = detect_anomalies(
            entity_id,
            &buckets,
            self.config.z_threshold,
            self.config.min_relative_deviation,
        );

        // The newest stored bucket only counts as current if it reaches `now`,
        // allowing for a baseline served from cache.
        let horizon = Duration::seconds((window.bucket_seconds + self.config.rebuild_interval_seconds) as i64);
        for a in anomalies.iter_mut() {
            a.latest = a.latest && now - a.bucket_start <= horizon;
        }
        Ok(anomalies)
    }

    /// Every configured dimension for one entity. Failures are collected,
    /// not propagated, since anomalies are advisory.
    pub async fn scan(&self, entity_id: &str, now: DateTime<Utc>) -> AnomalyScan {
        let mut scan = AnomalyScan::default();
        if !self.config.enabled {
            return scan;
        }
        let window = self.window();
        for dimension in &self.config.dimensions {
            match self.detect(entity_id, *dimension, window, now).await {
                Ok(found) => {
                    for a in &found {
                        tracing::info!(
                            entity_id,
                            dimension = dimension.as_str(),
                            value = a.value,
                            mean = a.mean,
                            "Trend anomaly"
                        );
                    }
                    scan.anomalies.extend(found);
                }
                Err(e) => {
                    tracing::warn!(entity_id, dimension = dimension.as_str(), "Trend baseline unavailable: {e}");
                    scan.failures.push(format!("anomaly {}: {e}", dimension.as_str()));
                }
            }
        }
        scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use crate::testing::{t0, StaticTrends};

    fn buckets(values: &[f64]) -> Vec<TrendBucket> {
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TrendBucket {
                dimension: TrendDimension::Volume,
                start: t0() - Duration::days(n - 1 - i as i64),
                value: *v,
            })
            .collect()
    }

    fn detect(values: &[f64]) -> Vec<Anomaly> {
        let config = AnomalyConfig::default();
        detect_anomalies("u1", &buckets(values), config.z_threshold, config.min_relative_deviation)
    }

    fn detector(trends: Arc<StaticTrends>) -> AnomalyDetector {
        let aggregator = Arc::new(RollingAggregator::new(&AggregatorConfig::default(), 900));
        let config = AnomalyConfig {
            dimensions: vec![TrendDimension::Volume],
            ..AnomalyConfig::default()
        };
        AnomalyDetector::new(trends, aggregator, config)
    }

    #[test]
    fn population_statistics() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn spike_is_flagged() {
        let found = detect(&[10.0, 10.0, 10.0, 100.0]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 100.0);
        assert_eq!(found[0].mean, 10.0);
        assert!(found[0].latest);
        // Baseline has zero variance.
        assert_eq!(found[0].z_score, None);
    }

    #[test]
    fn insufficient_buckets_is_not_an_error() {
        assert!(detect(&[]).is_empty());
        assert!(detect(&[500.0]).is_empty());
        // One bucket is no baseline for the other.
        assert!(detect(&[500.0, 501.0]).is_empty());
        assert!(detect(&[10.0, 1_000.0]).is_empty());
    }

    #[test]
    fn small_step_off_flat_baseline_is_not_flagged() {
        assert!(detect(&[10.0, 10.0, 10.0, 11.0]).is_empty());
        assert!(detect(&[1.0, 1.0, 1.0, 1.0, 2.0]).is_empty());
        // A flat zero baseline still needs more than one unit of movement.
        assert!(detect(&[0.0, 0.0, 0.0, 1.0]).is_empty());
        assert_eq!(detect(&[0.0, 0.0, 0.0, 5.0]).len(), 1);
    }

    #[test]
    fn flat_baseline_floor_is_configurable() {
        let b = buckets(&[10.0, 10.0, 10.0, 11.0]);
        assert!(detect_anomalies("u1", &b, 2.0, 1.0).is_empty());
        let found = detect_anomalies("u1", &b, 2.0, 0.05);
        assert_eq!(found.len(), 1);
        assert!(found[0].latest);
    }

    #[test]
    fn steady_series_has_no_anomalies() {
        let found = detect(&[100.0, 101.0, 100.0, 101.0, 100.0, 101.0]);
        assert!(found.is_empty());
    }

    #[test]
    fn z_score_reported_for_noisy_baseline() {
        let found = detect(&[10.0, 12.0, 8.0, 11.0, 9.0, 60.0]);
        assert_eq!(found.len(), 1);
        let z = found[0].z_score.unwrap();
        assert!(z > 2.0, "z = {z}");
    }

    #[test]
    fn old_spike_does_not_escalate() {
        let found = detect(&[10.0, 100.0, 10.0, 10.0, 10.0]);
        assert_eq!(found.len(), 1);
        assert!(!found[0].latest);
        assert_eq!(escalation(&found, RuleAction::Notify), RuleAction::Allow);
    }

    #[test]
    fn escalation_never_blocks() {
        let found = detect(&[10.0, 10.0, 10.0, 100.0]);
        assert_eq!(escalation(&found, RuleAction::Notify), RuleAction::Notify);
        assert_eq!(escalation(&found, RuleAction::Block), RuleAction::Review);
    }

    #[tokio::test]
    async fn scan_uses_cached_baseline() {
        let trends = Arc::new(StaticTrends::new(vec![10.0, 10.0, 10.0, 100.0]));
        let detector = detector(trends.clone());
        let first = detector.scan("u1", t0()).await;
        assert_eq!(first.anomalies.len(), 1);
        let second = detector.scan("u1", t0()).await;
        assert_eq!(first, second);
        assert_eq!(trends.calls(), 1);
    }

    #[tokio::test]
    async fn scan_reports_source_failure() {
        let trends = Arc::new(StaticTrends::new(vec![10.0, 100.0]));
        trends.set_failing(true);
        let scan = detector(trends).scan("u1", t0()).await;
        assert!(scan.anomalies.is_empty());
        assert_eq!(scan.failures.len(), 1);
    }

    #[tokio::test]
    async fn disabled_detector_does_nothing() {
        let trends = Arc::new(StaticTrends::new(vec![10.0, 10.0, 10.0, 100.0]));
        let aggregator = Arc::new(RollingAggregator::new(&AggregatorConfig::default(), 900));
        let config = AnomalyConfig {
            enabled: false,
            ..AnomalyConfig::default()
        };
        let scan = AnomalyDetector::new(trends.clone(), aggregator, config)
            .scan("u1", t0())
            .await;
        assert!(scan.anomalies.is_empty());
        assert_eq!(trends.calls(), 0);
    }
}
