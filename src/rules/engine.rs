use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::aggregator::RollingAggregator;
use crate::core::{
    ConditionTrace, EntityKey, EntityKind, EvaluationContext, RuleAction, RuleEvaluation, Severity,
};
use crate::rules::{CompiledCondition, CompiledRule, ConditionSource, FieldValue, RuleSet};

/// Result of running one rule set against one context.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// One entry per active rule, matched or not.
    pub evaluations: Vec<RuleEvaluation>,
    /// Most restrictive action among matched rules.
    pub action: RuleAction,
    pub severity: Option<Severity>,
}

impl RuleOutcome {
    pub fn matched(&self) -> impl Iterator<Item = &RuleEvaluation> {
        self.evaluations.iter().filter(|e| e.matched)
    }
}

/// Most restrictive action wins: block > review > notify > allow.
pub fn merge_actions(actions: impl IntoIterator<Item = RuleAction>) -> RuleAction {
    actions.into_iter().max().unwrap_or(RuleAction::Allow)
}

pub struct RuleEngine {
    aggregator: Arc<RollingAggregator>,
    default_utc_offset_minutes: i32,
}

impl RuleEngine {
    pub fn new(aggregator: Arc<RollingAggregator>, default_utc_offset_minutes: i32) -> Self {
        Self {
            aggregator,
            default_utc_offset_minutes,
        }
    }

    pub fn evaluate(&self, ctx: &EvaluationContext, rules: &RuleSet, now: DateTime<Utc>) -> RuleOutcome {
        let evaluations: Vec<RuleEvaluation> = rules
            .active()
            .map(|rule| self.evaluate_rule(ctx, rule, now))
            .collect();

        let action = merge_actions(evaluations.iter().filter(|e| e.matched).map(|e| e.action));
        let severity = evaluations
            .iter()
            .filter(|e| e.matched)
            .map(|e| e.severity)
            .max();

        RuleOutcome {
            evaluations,
            action,
            severity,
        }
    }

    fn evaluate_rule(&self, ctx: &EvaluationContext, rule: &CompiledRule, now: DateTime<Utc>) -> RuleEvaluation {
        // Every condition is traced, even after the first miss.
        let details: Vec<ConditionTrace> = rule
            .conditions
            .iter()
            .map(|cond| self.evaluate_condition(ctx, &rule.rule.id, cond, now))
            .collect();
        let matched = details.iter().all(|d| d.matched);

        if matched {
            tracing::info!(
                rule = %rule.rule.id,
                user = %ctx.user_id,
                action = rule.rule.action.as_str(),
                "Rule matched"
            );
        }

        RuleEvaluation {
            rule_id: rule.rule.id.clone(),
            rule_name: rule.rule.name.clone(),
            matched,
            severity: rule.rule.severity,
            action: rule.rule.action,
            details,
            timestamp: now,
        }
    }

    fn evaluate_condition(
        &self,
        ctx: &EvaluationContext,
        rule_id: &str,
        cond: &CompiledCondition,
        now: DateTime<Utc>,
    ) -> ConditionTrace {
        let def = &cond.definition;
        let mut trace = ConditionTrace {
            field: def.field.clone(),
            operator: def.operator.to_string(),
            expected: def.value.clone(),
            actual: None,
            aggregation: def.aggregation.as_ref().map(|a| a.to_string()),
            window_seconds: def.time_window_seconds,
            matched: false,
            note: None,
        };

        let actual = match &cond.source {
            ConditionSource::Context(field) => field.resolve(ctx, self.default_utc_offset_minutes),
            ConditionSource::Aggregate {
                entity,
                field,
                aggregation,
                window_seconds,
            } => {
                let key = entity_key(ctx, *entity);
                match self
                    .aggregator
                    .query(&key, field, aggregation, *window_seconds, now)
                {
                    Ok(value) => FieldValue::Number(value),
                    Err(e) => {
                        tracing::error!(rule = rule_id, "Aggregate unavailable, condition fails closed: {e}");
                        trace.note = Some(e.to_string());
                        return trace;
                    }
                }
            }
        };

        if actual == FieldValue::Missing {
            tracing::debug!(rule = rule_id, field = %def.field, "Field missing from context");
            trace.note = Some("field missing".to_string());
            return trace;
        }
        trace.actual = actual.to_json();

        match cond.matcher.matches(&actual, &def.value) {
            Ok(matched) => trace.matched = matched,
            Err(reason) => {
                tracing::error!(rule = rule_id, field = %def.field, "Condition misconfigured: {reason}");
                trace.note = Some(reason);
            }
        }
        trace
    }
}

fn entity_key(ctx: &EvaluationContext, kind: EntityKind) -> EntityKey {
    let id = match kind {
        EntityKind::User => &ctx.user_id,
        EntityKind::Ip => &ctx.ip,
        EntityKind::Device => &ctx.device_fingerprint,
    };
    EntityKey::new(kind, id.clone())
}
