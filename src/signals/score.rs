use crate::config::LevelThresholds;
use crate::core::{RiskAssessment, RiskFactor, RiskLevel};

/// Compute the composite score (0-1) as the weighted mean of factor values.
///
/// Normalised by the total weight present, so adding or removing a factor
/// never requires touching callers.
pub fn compute_composite(factors: &[RiskFactor]) -> f64 {
    let total_weighted: f64 = factors.iter().map(|f| f.weight * f.value).sum();
    let total_weight: f64 = factors.iter().map(|f| f.weight).sum();

    if total_weight <= 0.0 {
        return 0.0;
    }

    (total_weighted / total_weight).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    thresholds: LevelThresholds,
}

impl RiskScorer {
    pub fn new(thresholds: LevelThresholds) -> Self {
        Self { thresholds }
    }

    pub fn score(&self, factors: Vec<RiskFactor>) -> RiskAssessment {
        let score = compute_composite(&factors);
        RiskAssessment {
            score,
            level: RiskLevel::from_score(score, &self.thresholds),
            degraded: factors.iter().any(|f| f.degraded),
            factors,
        }
    }
}
