use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{RollingAggregator, AMOUNT_FIELD};
use crate::anomaly::{self, AnomalyDetector, AnomalyScan};
use crate::audit::AuditHandle;
use crate::config::{Config, EngineConfig, LevelActions};
use crate::core::{
    AuditEvent, AuditKind, EntityKey, EvaluationContext, RiskLevel, RuleAction, Severity, Verdict,
};
use crate::error::EngineError;
use crate::rules::book::RuleBook;
use crate::rules::engine::{RuleEngine, RuleOutcome};
use crate::rules::CustomOperators;
use crate::signals::{FactorInputs, SignalEngine};
use crate::sources::{HistoryReader, RuleStore, TrendSource};

/// Lifecycle of one evaluation. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Pending,
    FactorsComputed,
    RulesEvaluated,
    Decided,
}

struct StageTracker<'a> {
    evaluation_id: &'a uuid::Uuid,
    stage: Stage,
}

impl<'a> StageTracker<'a> {
    fn start(evaluation_id: &'a uuid::Uuid) -> Self {
        debug!(%evaluation_id, stage = ?Stage::Pending, "Evaluation started");
        Self {
            evaluation_id,
            stage: Stage::Pending,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "{:?} -> {next:?}", self.stage);
        self.stage = next;
        debug!(evaluation_id = %self.evaluation_id, stage = ?next, "Evaluation advanced");
    }
}

/// Composition root of one engine instance. Every collaborator is injected;
/// nothing is global.
pub struct DecisionEngine {
    engine: EngineConfig,
    level_actions: LevelActions,
    aggregator: Arc<RollingAggregator>,
    signals: Arc<SignalEngine>,
    rules: Arc<RuleEngine>,
    book: RuleBook,
    anomalies: Arc<AnomalyDetector>,
    history: Arc<dyn HistoryReader>,
    audit: AuditHandle,
}

impl DecisionEngine {
    pub fn new(
        config: &Config,
        history: Arc<dyn HistoryReader>,
        trends: Arc<dyn TrendSource>,
        audit: AuditHandle,
        custom: CustomOperators,
    ) -> Self {
        let aggregator = Arc::new(RollingAggregator::new(
            &config.aggregator,
            config.anomaly.rebuild_interval_seconds,
        ));
        aggregator.register_window(AMOUNT_FIELD, config.factors.velocity_window_seconds);

        Self {
            engine: config.engine.clone(),
            level_actions: config.scoring.level_actions.clone(),
            signals: Arc::new(SignalEngine::new(config)),
            rules: Arc::new(RuleEngine::new(
                aggregator.clone(),
                config.engine.default_utc_offset_minutes,
            )),
            book: RuleBook::new(config.rules.clone(), custom, aggregator.clone()),
            anomalies: Arc::new(AnomalyDetector::new(
                trends,
                aggregator.clone(),
                config.anomaly.clone(),
            )),
            aggregator,
            history,
            audit,
        }
    }

    /// Replace the factor calculators, e.g. to add deployment-specific ones.
    pub fn with_signal_engine(mut self, signals: SignalEngine) -> Self {
        self.signals = Arc::new(signals);
        self
    }

    pub fn aggregator(&self) -> &Arc<RollingAggregator> {
        &self.aggregator
    }

    pub fn rule_book(&self) -> &RuleBook {
        &self.book
    }

    pub fn default_utc_offset_minutes(&self) -> i32 {
        self.engine.default_utc_offset_minutes
    }

    /// Load the rule store and publish the new set. On failure the previous
    /// set stays in force and an audit event records the failure.
    pub async fn reload_rules(&self, store: &dyn RuleStore) -> Result<usize, EngineError> {
        match self.book.reload(store, Utc::now()).await {
            Ok(count) => Ok(count),
            Err(e) => {
                error!("Rule reload failed, keeping previous rule set: {e}");
                self.audit.emit(
                    AuditEvent::new(AuditKind::RulesReloadFailed, Severity::High, e.to_string())
                        .with_payload(json!({ "loaded_at": self.book.loaded_at() })),
                );
                Err(e)
            }
        }
    }

    /// Decide on one context. Never fails: internal problems show up as
    /// `degraded` plus an entry in `degradations`.
    pub async fn evaluate(&self, ctx: EvaluationContext) -> Verdict {
        let deadline = Instant::now() + Duration::from_millis(self.engine.deadline_ms);
        let now = ctx.timestamp;
        let evaluation_id = ctx.evaluation_id;
        let mut stage = StageTracker::start(&evaluation_id);

        // The current transaction counts toward its own windows.
        for entity in ctx.entities() {
            self.aggregator.observe(&entity, AMOUNT_FIELD, ctx.amount, now);
        }
        let ctx = Arc::new(ctx);

        // Rule age runs on the wall clock that stamped the reload.
        let rules_task = match self.book.snapshot(Utc::now()) {
            Ok(set) => {
                let engine = Arc::clone(&self.rules);
                let task_ctx = Arc::clone(&ctx);
                Ok(tokio::spawn(async move { engine.evaluate(&task_ctx, &set, now) }))
            }
            Err(unavailable) => Err(unavailable.to_string()),
        };
        let anomaly_task = {
            let detector = Arc::clone(&self.anomalies);
            let user_id = ctx.user_id.clone();
            tokio::spawn(async move { detector.scan(&user_id, now).await })
        };

        let inputs = Arc::new(FactorInputs::new(
            Arc::clone(&ctx),
            Arc::clone(&self.history),
            Arc::clone(&self.aggregator),
        ));
        let factors = self.signals.assess(inputs, deadline).await;
        stage.advance(Stage::FactorsComputed);

        let mut degradations = factors.failures.clone();
        if !factors.failures.is_empty() {
            self.audit.emit(
                AuditEvent::new(
                    AuditKind::FactorDegraded,
                    Severity::Medium,
                    format!("{} risk factor(s) fell back to defaults", factors.failures.len()),
                )
                .for_evaluation(evaluation_id)
                .with_payload(json!({ "failures": factors.failures })),
            );
        }

        let rule_outcome = match rules_task {
            Ok(handle) => join_before(handle, deadline).await,
            Err(reason) => Err(reason),
        };
        stage.advance(Stage::RulesEvaluated);

        let (rule_action, severity, evaluations) = match rule_outcome {
            Ok(RuleOutcome {
                evaluations,
                action,
                severity,
            }) => (action, severity, evaluations),
            Err(reason) => {
                let fallback = self.engine.fail_policy.fallback_action();
                error!(
                    %evaluation_id,
                    policy = ?self.engine.fail_policy,
                    "Rule engine unavailable, falling back to {}: {reason}",
                    fallback.as_str()
                );
                self.audit.emit(
                    AuditEvent::new(
                        AuditKind::RuleStoreUnavailable,
                        Severity::Critical,
                        format!("rules unavailable, applied {}: {reason}", fallback.as_str()),
                    )
                    .for_evaluation(evaluation_id)
                    .with_payload(json!({ "policy": format!("{:?}", self.engine.fail_policy) })),
                );
                degradations.push(format!("rules: {reason}"));
                (fallback, None, Vec::new())
            }
        };

        let scan = match join_before(anomaly_task, deadline).await {
            Ok(scan) => scan,
            Err(reason) => AnomalyScan {
                anomalies: Vec::new(),
                failures: vec![format!("anomaly: {reason}")],
            },
        };
        degradations.extend(scan.failures);

        let level_floor = self.level_floor(factors.assessment.level);
        let anomaly_floor = anomaly::escalation(&scan.anomalies, self.anomalies.escalation_ceiling());
        let action = rule_action.max(level_floor).max(anomaly_floor);
        stage.advance(Stage::Decided);

        if action != RuleAction::Block {
            self.remember(&ctx, now);
        }

        let verdict = Verdict {
            evaluation_id,
            action,
            severity,
            degraded: factors.assessment.degraded || !degradations.is_empty(),
            risk_assessment: factors.assessment,
            evaluations,
            anomalies: scan.anomalies,
            degradations,
            context: Arc::unwrap_or_clone(ctx),
            decided_at: Utc::now(),
        };

        if verdict.action != RuleAction::Allow || verdict.degraded {
            info!(
                %evaluation_id,
                user = %verdict.context.user_id,
                action = verdict.action.as_str(),
                score = verdict.risk_assessment.score,
                degraded = verdict.degraded,
                "Verdict"
            );
        }
        self.audit.emit(AuditEvent::from_verdict(&verdict));
        verdict
    }

    fn level_floor(&self, level: RiskLevel) -> RuleAction {
        match level {
            RiskLevel::Low => RuleAction::Allow,
            RiskLevel::Medium => self.level_actions.medium,
            RiskLevel::High => self.level_actions.high,
            RiskLevel::Critical => self.level_actions.critical,
        }
    }

    fn remember(&self, ctx: &EvaluationContext, now: DateTime<Utc>) {
        let user = EntityKey::user(&ctx.user_id);
        self.aggregator
            .remember_device(&user, &ctx.device_fingerprint, now);
        if let Some(point) = ctx.location {
            self.aggregator.remember_location(&user, point, now);
        }
    }
}

async fn join_before<T>(mut handle: JoinHandle<T>, deadline: Instant) -> Result<T, String> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(format!("task failed: {join_err}")),
        Err(_) => {
            handle.abort();
            Err("deadline exceeded".to_string())
        }
    }
}

#[cfg(unix)]
type Hangup = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type Hangup = Option<()>;

#[cfg(unix)]
fn install_hangup() -> Hangup {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            warn!("SIGHUP reload unavailable: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
fn install_hangup() -> Hangup {
    None
}

#[cfg(unix)]
async fn hangup_received(hangup: &mut Hangup) {
    match hangup {
        Some(sig) => {
            if sig.recv().await.is_none() {
                *hangup = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn hangup_received(_hangup: &mut Hangup) {
    std::future::pending().await
}

/// Reload rules every `every`, and on SIGHUP. Expired aggregate windows are
/// pruned on the same schedule.
pub fn spawn_rule_refresher(
    engine: Arc<DecisionEngine>,
    store: Arc<dyn RuleStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate; startup has already loaded.
        ticker.tick().await;
        let mut hangup = install_hangup();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.aggregator().prune_expired(Utc::now());
                }
                _ = hangup_received(&mut hangup) => {
                    info!("SIGHUP received, reloading rules");
                }
            }
            // Failures are logged and audited inside.
            let _ = engine.reload_rules(store.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregation;
    use crate::config::{FailPolicy, LevelThresholds};
    use crate::core::TrendDimension;
    use crate::error::FactorError;
    use crate::rules::{ConditionOperator, FraudRule, RuleCondition};
    use crate::signals::factors::VELOCITY;
    use crate::signals::score::RiskScorer;
    use crate::signals::{FactorCalculator, FactorReading};
    use crate::sources::EntityHistory;
    use crate::testing::{context, t0, FailingHistory, FailingRuleStore, StaticHistory, StaticTrends};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settled_history() -> EntityHistory {
        let mut hourly = [0u64; 24];
        hourly[10] = 40;
        EntityHistory {
            avg_amount: 900.0,
            max_amount: 1_500.0,
            transaction_count: 40,
            known_devices: vec!["dev-1".into()],
            known_locations: vec![crate::core::GeoPoint::new(4.0511, 9.7679)],
            fraud_event_count: 0,
            hourly_activity: hourly,
        }
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.anomaly.dimensions = vec![TrendDimension::Volume];
        config
    }

    fn build(config: &Config, history: Arc<dyn HistoryReader>, trends: Vec<f64>) -> (DecisionEngine, UnboundedReceiver<AuditEvent>) {
        let (audit, rx) = AuditHandle::channel();
        let engine = DecisionEngine::new(
            config,
            history,
            Arc::new(StaticTrends::new(trends)),
            audit,
            CustomOperators::with_builtins(),
        );
        (engine, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<AuditEvent>) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn hourly_ceiling_rule() -> FraudRule {
        FraudRule {
            id: "hourly-ceiling".into(),
            name: "More than 10000 in an hour".into(),
            conditions: vec![RuleCondition::aggregated(
                AMOUNT_FIELD,
                Aggregation::Sum,
                3600,
                ConditionOperator::Gt,
                json!(10_000),
            )],
            severity: Severity::High,
            action: RuleAction::Block,
            is_active: true,
        }
    }

    struct Fixed(f64);

    #[async_trait]
    impl FactorCalculator for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn default_value(&self) -> f64 {
            0.5
        }
        async fn compute(&self, _inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
            Ok(FactorReading::new(self.0, "fixed"))
        }
    }

    fn fixed_signals(value: f64) -> SignalEngine {
        SignalEngine::with_calculators(
            vec![Arc::new(Fixed(value))],
            [("fixed".to_string(), 1.0)].into_iter().collect(),
            RiskScorer::new(LevelThresholds::default()),
        )
    }

    #[tokio::test]
    async fn rule_store_outage_fails_open() {
        let config = quiet_config();
        let (engine, mut rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        assert!(engine.reload_rules(&FailingRuleStore).await.is_err());
        drain(&mut rx);

        let verdict = engine.evaluate(context("u1", 100.0)).await;
        assert_eq!(verdict.action, RuleAction::Allow);
        assert!(verdict.degraded);
        assert!(verdict.evaluations.is_empty());

        let events = drain(&mut rx);
        let critical: Vec<_> = events
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].kind, AuditKind::RuleStoreUnavailable);
        assert_eq!(critical[0].evaluation_id, Some(verdict.evaluation_id));
        assert!(events.iter().any(|e| e.kind == AuditKind::Verdict));
    }

    #[tokio::test]
    async fn fail_policy_is_configurable() {
        let mut config = quiet_config();
        config.engine.fail_policy = FailPolicy::Closed;
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        let verdict = engine.evaluate(context("u1", 100.0)).await;
        assert_eq!(verdict.action, RuleAction::Block);
        assert!(verdict.degraded);

        config.engine.fail_policy = FailPolicy::Review;
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        assert_eq!(engine.evaluate(context("u1", 100.0)).await.action, RuleAction::Review);
    }

    #[tokio::test]
    async fn eleventh_transfer_hits_hourly_ceiling() {
        let config = quiet_config();
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        engine.rule_book().install(vec![hourly_ceiling_rule()], Utc::now()).unwrap();

        for i in 1..=10 {
            let verdict = engine.evaluate(context("u1", 1_000.0)).await;
            assert!(!verdict.evaluations[0].matched, "transfer {i} matched early");
            assert_ne!(verdict.action, RuleAction::Block);
        }
        let eleventh = engine.evaluate(context("u1", 1_000.0)).await;
        assert!(eleventh.evaluations[0].matched);
        assert_eq!(eleventh.action, RuleAction::Block);
        assert_eq!(eleventh.severity, Some(Severity::High));
        assert!(!eleventh.degraded);
    }

    #[tokio::test]
    async fn future_dated_context_keeps_rules_fresh() {
        let config = quiet_config();
        let (engine, mut rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        let mut rule = hourly_ceiling_rule();
        rule.conditions = vec![RuleCondition::simple("amount", ConditionOperator::Gt, json!(5_000))];
        engine.rule_book().install(vec![rule], Utc::now()).unwrap();

        let mut ctx = context("u1", 9_000.0);
        ctx.timestamp = Utc::now() + chrono::Duration::minutes(16);
        let verdict = engine.evaluate(ctx).await;
        assert_eq!(verdict.action, RuleAction::Block);
        assert!(verdict.degradations.iter().all(|d| !d.starts_with("rules")));
        assert!(!drain(&mut rx).iter().any(|e| e.kind == AuditKind::RuleStoreUnavailable));
    }

    #[tokio::test]
    async fn verdict_audit_carries_rule_severity() {
        let config = quiet_config();
        let (engine, mut rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        let rule = FraudRule {
            id: "watch-large".into(),
            name: "Large transfer".into(),
            conditions: vec![RuleCondition::simple("amount", ConditionOperator::Gt, json!(500))],
            severity: Severity::Critical,
            action: RuleAction::Notify,
            is_active: true,
        };
        engine.rule_book().install(vec![rule], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 800.0)).await;
        assert_eq!(verdict.action, RuleAction::Notify);
        assert_eq!(verdict.severity, Some(Severity::Critical));
        let events = drain(&mut rx);
        let audited = events.iter().find(|e| e.kind == AuditKind::Verdict).unwrap();
        assert_eq!(audited.severity, Severity::Critical);
    }

    struct Explodes;

    impl crate::rules::CustomOperator for Explodes {
        fn validate(&self, _expected: &serde_json::Value) -> Result<(), String> {
            Ok(())
        }
        fn matches(&self, _actual: &crate::rules::FieldValue, _expected: &serde_json::Value) -> bool {
            panic!("operator bug")
        }
    }

    #[tokio::test]
    async fn panicking_rule_task_applies_fail_policy() {
        let mut config = quiet_config();
        config.engine.fail_policy = FailPolicy::Review;
        let mut custom = CustomOperators::with_builtins();
        custom.register("explode", Arc::new(Explodes));
        let (audit, mut rx) = AuditHandle::channel();
        let engine = DecisionEngine::new(
            &config,
            Arc::new(StaticHistory::new(settled_history())),
            Arc::new(StaticTrends::new(vec![])),
            audit,
            custom,
        );
        let rule = FraudRule {
            id: "broken".into(),
            name: "Broken operator".into(),
            conditions: vec![RuleCondition::simple("ip", ConditionOperator::Custom("explode".into()), json!("x"))],
            severity: Severity::High,
            action: RuleAction::Block,
            is_active: true,
        };
        engine.rule_book().install(vec![rule], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 100.0)).await;
        assert_eq!(verdict.action, RuleAction::Review);
        assert!(verdict.degraded);
        assert!(verdict.evaluations.is_empty());
        let critical: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].kind, AuditKind::RuleStoreUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn task_past_deadline_is_aborted() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, Ordering::SeqCst);
            RuleAction::Block
        });
        let deadline = Instant::now() + Duration::from_millis(EngineConfig::default().deadline_ms);

        let err = join_before(slow, deadline).await.unwrap_err();
        assert_eq!(err, "deadline exceeded");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn two_bucket_trend_does_not_escalate() {
        let config = quiet_config();
        let (engine, _rx) = build(
            &config,
            Arc::new(StaticHistory::new(settled_history())),
            vec![500.0, 501.0],
        );
        engine.rule_book().install(vec![], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 10.0)).await;
        assert!(verdict.anomalies.is_empty());
        assert_eq!(verdict.action, RuleAction::Allow);
    }

    #[tokio::test]
    async fn failing_history_degrades_but_decides() {
        let config = quiet_config();
        let (engine, mut rx) = build(&config, Arc::new(FailingHistory), vec![]);
        engine.rule_book().install(vec![hourly_ceiling_rule()], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 50.0)).await;
        assert!(verdict.degraded);
        assert!(verdict.risk_assessment.degraded);
        assert_eq!(verdict.evaluations.len(), 1);
        // Velocity reads only the aggregator, so it still computes.
        let velocity = verdict
            .risk_assessment
            .factors
            .iter()
            .find(|f| f.name == VELOCITY)
            .unwrap();
        assert!(!velocity.degraded);
        assert!(drain(&mut rx).iter().any(|e| e.kind == AuditKind::FactorDegraded));
    }

    #[tokio::test]
    async fn critical_score_reviews_but_never_blocks() {
        let config = quiet_config();
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::default()), vec![]);
        let engine = engine.with_signal_engine(fixed_signals(0.95));
        engine.rule_book().install(vec![hourly_ceiling_rule()], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 10.0)).await;
        assert_eq!(verdict.risk_assessment.level, RiskLevel::Critical);
        assert_eq!(verdict.action, RuleAction::Review);
    }

    #[tokio::test]
    async fn current_anomaly_escalates_to_notify() {
        let config = quiet_config();
        let (engine, _rx) = build(
            &config,
            Arc::new(StaticHistory::new(settled_history())),
            vec![10.0, 10.0, 10.0, 100.0],
        );
        engine.rule_book().install(vec![hourly_ceiling_rule()], Utc::now()).unwrap();

        let verdict = engine.evaluate(context("u1", 10.0)).await;
        assert_eq!(verdict.anomalies.len(), 1);
        assert_eq!(verdict.action, RuleAction::Notify);
    }

    #[tokio::test]
    async fn blocked_device_is_not_remembered() {
        let config = quiet_config();
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::default()), vec![]);
        let mut rule = hourly_ceiling_rule();
        rule.conditions = vec![RuleCondition::simple("amount", ConditionOperator::Gt, json!(5_000))];
        engine.rule_book().install(vec![rule], Utc::now()).unwrap();

        let user = EntityKey::user("u1");
        let mut blocked = context("u1", 9_000.0);
        blocked.device_fingerprint = "dev-stolen".into();
        assert_eq!(engine.evaluate(blocked).await.action, RuleAction::Block);
        assert!(!engine.aggregator().knows_device(&user, "dev-stolen", t0()));

        engine.evaluate(context("u1", 20.0)).await;
        assert!(engine.aggregator().knows_device(&user, "dev-1", t0()));
    }

    #[tokio::test]
    async fn repeated_evaluation_scores_the_same() {
        let config = quiet_config();
        let (engine, _rx) = build(&config, Arc::new(StaticHistory::new(settled_history())), vec![]);
        engine.rule_book().install(vec![hourly_ceiling_rule()], Utc::now()).unwrap();

        let ctx = context("u1", 300.0);
        let first = engine.evaluate(ctx.clone()).await;
        let second = engine.evaluate(ctx).await;
        let stable = |v: &Verdict| {
            v.risk_assessment
                .factors
                .iter()
                .filter(|f| f.name != VELOCITY)
                .map(|f| (f.name.clone(), f.value))
                .collect::<Vec<_>>()
        };
        assert_eq!(stable(&first), stable(&second));
        assert_eq!(first.evaluation_id, second.evaluation_id);
    }
}
