use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core::dispatcher::DecisionEngine;
use crate::core::{EvaluationContext, Verdict};
use crate::sources::TransactionLog;

/// What the pipeline hands back for each input line.
#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Verdict(Box<Verdict>),
    Rejected { line: u64, reason: String },
}

/// Parse one JSON line into a context, rejecting values no rule could
/// reason about.
pub fn parse_context(line: &str) -> Result<EvaluationContext, String> {
    let ctx: EvaluationContext = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if ctx.user_id.trim().is_empty() {
        return Err("user_id is empty".to_string());
    }
    if !ctx.amount.is_finite() || ctx.amount < 0.0 {
        return Err(format!("amount {} is not a non-negative number", ctx.amount));
    }
    Ok(ctx)
}

/// Run the pipeline: receive context lines, evaluate each on its own task,
/// record the outcome and forward the verdict.
///
/// Verdicts are forwarded as they complete, so their order may differ from
/// the input order. Returns once the input is closed and every evaluation
/// has finished.
pub async fn run_pipeline(
    mut rx: mpsc::UnboundedReceiver<String>,
    out: mpsc::UnboundedSender<PipelineOutput>,
    engine: Arc<DecisionEngine>,
    log: Arc<dyn TransactionLog>,
) {
    let mut line_count: u64 = 0;
    let mut rejected: u64 = 0;
    let mut tasks = JoinSet::new();

    info!("Pipeline started, waiting for transactions...");

    while let Some(line) = rx.recv().await {
        line_count += 1;
        if line.trim().is_empty() {
            continue;
        }

        let ctx = match parse_context(&line) {
            Ok(ctx) => ctx,
            Err(reason) => {
                rejected += 1;
                debug!(line = line_count, "Rejected input: {reason}");
                if out
                    .send(PipelineOutput::Rejected {
                        line: line_count,
                        reason,
                    })
                    .is_err()
                {
                    info!("Output channel closed, stopping pipeline");
                    break;
                }
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        let log = Arc::clone(&log);
        let out = out.clone();
        tasks.spawn(async move {
            let verdict = engine.evaluate(ctx).await;
            let hour = verdict
                .context
                .local_hour(engine.default_utc_offset_minutes());
            if let Err(e) = log
                .record_transaction(&verdict.context, verdict.action, hour)
                .await
            {
                warn!(evaluation_id = %verdict.evaluation_id, "Failed to record transaction: {e}");
            }
            let _ = out.send(PipelineOutput::Verdict(Box::new(verdict)));
        });

        // Reap finished evaluations so the set doesn't grow unbounded.
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!("Evaluation task failed: {e}");
            }
        }

        if line_count % 1000 == 0 {
            info!("Pipeline processed {line_count} lines, {rejected} rejected");
        }
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            warn!("Evaluation task failed: {e}");
        }
    }
    info!("Pipeline finished: {line_count} lines, {rejected} rejected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditHandle;
    use crate::config::Config;
    use crate::core::RuleAction;
    use crate::error::StoreError;
    use crate::rules::CustomOperators;
    use crate::testing::{context, StaticHistory, StaticTrends};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        rows: Mutex<Vec<(String, RuleAction, u32)>>,
    }

    #[async_trait]
    impl TransactionLog for MemoryLog {
        async fn record_transaction(
            &self,
            ctx: &EvaluationContext,
            action: RuleAction,
            local_hour: u32,
        ) -> Result<(), StoreError> {
            self.rows
                .lock()
                .unwrap()
                .push((ctx.user_id.clone(), action, local_hour));
            Ok(())
        }
    }

    fn engine() -> Arc<DecisionEngine> {
        let (audit, _rx) = AuditHandle::channel();
        let engine = DecisionEngine::new(
            &Config::default(),
            Arc::new(StaticHistory::default()),
            Arc::new(StaticTrends::new(vec![])),
            audit,
            CustomOperators::with_builtins(),
        );
        engine.rule_book().install(vec![], chrono::Utc::now()).unwrap();
        Arc::new(engine)
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_context("not json").is_err());
        let mut ctx = context("u1", 10.0);
        ctx.amount = -5.0;
        assert!(parse_context(&serde_json::to_string(&ctx).unwrap()).is_err());
        ctx.amount = 5.0;
        ctx.user_id = " ".into();
        assert!(parse_context(&serde_json::to_string(&ctx).unwrap()).is_err());
    }

    #[test]
    fn parse_fills_evaluation_id() {
        let line = r#"{"user_id":"u1","amount":25.5,"transaction_type":"airtime",
            "ip":"10.0.0.9","device_fingerprint":"d-9","timestamp":"2026-03-01T10:00:00Z"}"#;
        let ctx = parse_context(line).unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert!(ctx.location.is_none());
        assert!(!ctx.evaluation_id.is_nil());
    }

    #[tokio::test]
    async fn every_line_gets_an_answer() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let log = Arc::new(MemoryLog::default());

        for amount in [10.0, 20.0, 30.0] {
            in_tx
                .send(serde_json::to_string(&context("u1", amount)).unwrap())
                .unwrap();
        }
        in_tx.send("{broken".to_string()).unwrap();
        drop(in_tx);

        run_pipeline(in_rx, out_tx, engine(), log.clone()).await;

        let mut verdicts = 0;
        let mut rejected = Vec::new();
        while let Ok(output) = out_rx.try_recv() {
            match output {
                PipelineOutput::Verdict(_) => verdicts += 1,
                PipelineOutput::Rejected { line, .. } => rejected.push(line),
            }
        }
        assert_eq!(verdicts, 3);
        assert_eq!(rejected, vec![4]);
        let rows = log.rows.lock().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|(user, _, hour)| user == "u1" && *hour == 10));
    }
}
