pub mod factors;
pub mod score;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::aggregator::RollingAggregator;
use crate::config::Config;
use crate::core::{EvaluationContext, RiskAssessment, RiskFactor};
use crate::error::{FactorError, StoreError};
use crate::sources::{EntityHistory, HistoryReader};
use score::RiskScorer;

/// Raw output of a calculator before weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorReading {
    pub value: f64,
    pub details: String,
}

impl FactorReading {
    pub fn new(value: f64, details: impl Into<String>) -> Self {
        Self {
            value,
            details: details.into(),
        }
    }
}

/// A risk signal computed independently of the others.
///
/// Missing data is not an error: the calculator returns its documented value
/// for that case. `Err` is reserved for failures of the underlying reads, after
/// which the engine falls back to `default_value`.
#[async_trait]
pub trait FactorCalculator: Send + Sync {
    fn name(&self) -> &'static str;
    fn default_value(&self) -> f64;
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError>;
}

/// Entity history read at most once per evaluation, shared by all calculators.
pub struct HistoryView {
    entity_id: String,
    reader: Arc<dyn HistoryReader>,
    cell: OnceCell<Result<Arc<EntityHistory>, StoreError>>,
}

impl HistoryView {
    pub fn new(entity_id: impl Into<String>, reader: Arc<dyn HistoryReader>) -> Self {
        Self {
            entity_id: entity_id.into(),
            reader,
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Arc<EntityHistory>, StoreError> {
        self.cell
            .get_or_init(|| async {
                self.reader
                    .entity_history(&self.entity_id)
                    .await
                    .map(Arc::new)
            })
            .await
            .clone()
    }
}

/// Everything a calculator may read for one evaluation.
pub struct FactorInputs {
    pub context: Arc<EvaluationContext>,
    pub history: HistoryView,
    pub aggregator: Arc<RollingAggregator>,
}

impl FactorInputs {
    pub fn new(
        context: Arc<EvaluationContext>,
        reader: Arc<dyn HistoryReader>,
        aggregator: Arc<RollingAggregator>,
    ) -> Self {
        let history = HistoryView::new(context.user_id.clone(), reader);
        Self {
            context,
            history,
            aggregator,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FactorOutcome {
    pub assessment: RiskAssessment,
    /// One entry per calculator that fell back to its default.
    pub failures: Vec<String>,
}

/// Runs every calculator concurrently and combines the results.
pub struct SignalEngine {
    calculators: Vec<Arc<dyn FactorCalculator>>,
    weights: HashMap<String, f64>,
    scorer: RiskScorer,
}

impl SignalEngine {
    pub fn new(config: &Config) -> Self {
        Self::with_calculators(
            factors::default_calculators(config),
            config.scoring.weights.clone(),
            RiskScorer::new(config.scoring.thresholds.clone()),
        )
    }

    pub fn with_calculators(
        calculators: Vec<Arc<dyn FactorCalculator>>,
        weights: HashMap<String, f64>,
        scorer: RiskScorer,
    ) -> Self {
        Self {
            calculators,
            weights,
            scorer,
        }
    }

    pub async fn assess(&self, inputs: Arc<FactorInputs>, deadline: Instant) -> FactorOutcome {
        let handles: Vec<_> = self
            .calculators
            .iter()
            .map(|calc| {
                let task_calc = Arc::clone(calc);
                let task_inputs = Arc::clone(&inputs);
                let handle = tokio::spawn(async move { task_calc.compute(&task_inputs).await });
                (Arc::clone(calc), handle)
            })
            .collect();

        let mut factors = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (calc, mut handle) in handles {
            let name = calc.name();
            let weight = self.weights.get(name).copied().unwrap_or(0.0);
            let result = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(reading))) => Ok(reading),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(join_err)) => Err(format!("calculator task failed: {join_err}")),
                Err(_) => {
                    handle.abort();
                    Err("deadline exceeded".to_string())
                }
            };

            let factor = match result {
                Ok(reading) => {
                    tracing::debug!(factor = name, value = reading.value, "{}", reading.details);
                    RiskFactor {
                        name: name.to_string(),
                        weight,
                        value: reading.value.clamp(0.0, 1.0),
                        details: reading.details,
                        degraded: false,
                    }
                }
                Err(reason) => {
                    tracing::warn!(factor = name, "Risk factor degraded: {reason}");
                    failures.push(format!("{name}: {reason}"));
                    RiskFactor {
                        name: name.to_string(),
                        weight,
                        value: calc.default_value().clamp(0.0, 1.0),
                        details: format!("default {:.2} substituted ({reason})", calc.default_value()),
                        degraded: true,
                    }
                }
            };
            factors.push(factor);
        }

        FactorOutcome {
            assessment: self.scorer.score(factors),
            failures,
        }
    }
}
