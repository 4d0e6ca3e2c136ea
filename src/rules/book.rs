use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};

use crate::aggregator::RollingAggregator;
use crate::config::RulesConfig;
use crate::error::{EngineError, RuleError, RulesUnavailable};
use crate::rules::{CustomOperators, FraudRule, RuleSet};
use crate::sources::RuleStore;

/// Holds the current rule snapshot.
///
/// Readers take an `Arc` to whatever set is current when their evaluation
/// starts and keep it to the end, so a reload never changes the rules
/// halfway through an evaluation. A failed reload leaves the previous
/// snapshot in place until it goes stale.
pub struct RuleBook {
    current: ArcSwapOption<RuleSet>,
    custom: CustomOperators,
    limits: RulesConfig,
    aggregator: Arc<RollingAggregator>,
}

impl RuleBook {
    pub fn new(limits: RulesConfig, custom: CustomOperators, aggregator: Arc<RollingAggregator>) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            custom,
            limits,
            aggregator,
        }
    }

    /// Compile and publish `rules`. Windows are registered with the aggregator
    /// before the swap so no published rule reads an untracked window.
    pub fn install(&self, rules: Vec<FraudRule>, now: DateTime<Utc>) -> Result<usize, RuleError> {
        let set = RuleSet::compile(rules, &self.custom, &self.limits, now)?;
        for (field, window) in set.windows() {
            self.aggregator.register_window(&field, window);
        }
        let count = set.len();
        self.current.store(Some(Arc::new(set)));
        Ok(count)
    }

    pub async fn reload(&self, store: &dyn RuleStore, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let rules = store.load_rules().await?;
        let count = self.install(rules, now)?;
        tracing::info!(rules = count, "Rule set loaded");
        Ok(count)
    }

    /// Current set, unless it is older than the staleness limit.
    ///
    /// `now` must come from the same wall clock that stamped the load, never
    /// from a transaction timestamp.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<Arc<RuleSet>, RulesUnavailable> {
        let set = self.current.load_full().ok_or(RulesUnavailable::NeverLoaded)?;
        let age_seconds = (now - set.loaded_at()).num_seconds();
        let limit = self.limits.max_staleness_seconds;
        if limit > 0 && age_seconds > limit as i64 {
            return Err(RulesUnavailable::Stale {
                age_seconds,
                limit_seconds: limit,
            });
        }
        Ok(set)
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.current.load_full().map(|s| s.loaded_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregation, AMOUNT_FIELD};
    use crate::config::AggregatorConfig;
    use crate::core::{RuleAction, Severity};
    use crate::rules::{ConditionOperator, RuleCondition};
    use crate::testing::{t0, FailingRuleStore, MemoryRuleStore};
    use chrono::Duration;
    use serde_json::json;

    fn book() -> (RuleBook, Arc<RollingAggregator>) {
        let aggregator = Arc::new(RollingAggregator::new(&AggregatorConfig::default(), 900));
        let book = RuleBook::new(RulesConfig::default(), CustomOperators::with_builtins(), aggregator.clone());
        (book, aggregator)
    }

    fn velocity_rule(id: &str, window: u64) -> FraudRule {
        FraudRule {
            id: id.to_string(),
            name: "velocity".into(),
            conditions: vec![RuleCondition::aggregated(
                AMOUNT_FIELD,
                Aggregation::Sum,
                window,
                ConditionOperator::Gt,
                json!(10_000),
            )],
            severity: Severity::High,
            action: RuleAction::Block,
            is_active: true,
        }
    }

    #[test]
    fn never_loaded_is_unavailable() {
        let (book, _) = book();
        assert_eq!(book.snapshot(t0()).err(), Some(RulesUnavailable::NeverLoaded));
    }

    #[test]
    fn install_registers_windows() {
        let (book, aggregator) = book();
        assert_eq!(book.install(vec![velocity_rule("v", 1800)], t0()).unwrap(), 1);
        assert!(aggregator.is_tracked(AMOUNT_FIELD, 1800));
        assert_eq!(book.snapshot(t0()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let (book, _) = book();
        let store = MemoryRuleStore::new(vec![velocity_rule("v", 3600)]);
        book.reload(&store, t0()).await.unwrap();

        let later = t0() + Duration::seconds(60);
        assert!(book.reload(&FailingRuleStore, later).await.is_err());
        let snapshot = book.snapshot(later).unwrap();
        assert_eq!(snapshot.rules()[0].rule.id, "v");
        assert_eq!(book.loaded_at(), Some(t0()));
    }

    #[tokio::test]
    async fn invalid_rules_keep_previous_snapshot() {
        let (book, _) = book();
        book.install(vec![velocity_rule("v", 3600)], t0()).unwrap();
        let bad = MemoryRuleStore::new(vec![velocity_rule("v", 3600), velocity_rule("v", 60)]);
        let err = book.reload(&bad, t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::Rules(RuleError::DuplicateId(_))));
        assert_eq!(book.snapshot(t0()).unwrap().len(), 1);
    }

    #[test]
    fn stale_snapshot_is_unavailable() {
        let (book, _) = book();
        book.install(vec![velocity_rule("v", 3600)], t0()).unwrap();
        let limit = RulesConfig::default().max_staleness_seconds as i64;
        assert!(book.snapshot(t0() + Duration::seconds(limit)).is_ok());
        assert!(matches!(
            book.snapshot(t0() + Duration::seconds(limit + 1)),
            Err(RulesUnavailable::Stale { .. })
        ));
    }

    #[test]
    fn held_snapshot_survives_swap() {
        let (book, _) = book();
        book.install(vec![velocity_rule("old", 3600)], t0()).unwrap();
        let held = book.snapshot(t0()).unwrap();
        book.install(vec![velocity_rule("new", 3600)], t0()).unwrap();
        assert_eq!(held.rules()[0].rule.id, "old");
        assert_eq!(book.snapshot(t0()).unwrap().rules()[0].rule.id, "new");
    }
}
