use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use momoguard::audit::{run_audit_worker, AuditHandle};
use momoguard::config::Config;
use momoguard::core::dispatcher::{spawn_rule_refresher, DecisionEngine};
use momoguard::core::pipeline::{run_pipeline, PipelineOutput};
use momoguard::db::SharedDatabase;
use momoguard::error::{EngineError, StoreError};
use momoguard::rules::CustomOperators;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries verdicts.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("momoguard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("momoguard starting...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Refusing to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!("Config: {:?}", config);

    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create database directory {}: {e}", parent.display());
            return ExitCode::FAILURE;
        }
    }
    let db = match SharedDatabase::open(db_path, &config.database) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open database {}: {e}", config.database.path);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Database opened at {}", config.database.path);

    let (audit, audit_rx) = AuditHandle::channel();
    let audit_worker = tokio::spawn(run_audit_worker(
        audit_rx,
        Arc::new(db.clone()),
        config.audit.clone(),
    ));

    let engine = Arc::new(DecisionEngine::new(
        &config,
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        audit,
        CustomOperators::with_builtins(),
    ));

    // Invalid rules are a configuration error. An unreachable store is an
    // outage, and the fail policy covers it until a refresh succeeds.
    match engine.reload_rules(&db).await {
        Ok(count) => tracing::info!("Loaded {count} fraud rules"),
        Err(e @ (EngineError::Rules(_) | EngineError::Store(StoreError::Malformed(_)))) => {
            tracing::error!("Refusing to start with an invalid rule set: {e}");
            return ExitCode::FAILURE;
        }
        Err(e) => tracing::warn!(
            policy = ?config.engine.fail_policy,
            "Starting without rules, fail policy applies: {e}"
        ),
    }

    let refresher = spawn_rule_refresher(
        Arc::clone(&engine),
        Arc::new(db.clone()),
        Duration::from_secs(config.rules.refresh_interval_seconds),
    );

    // stdin → pipeline
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });

    // pipeline → stdout
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PipelineOutput>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = out_rx.recv().await {
            let json = match output {
                PipelineOutput::Verdict(verdict) => serde_json::to_string(&verdict),
                PipelineOutput::Rejected { line, reason } => {
                    serde_json::to_string(&serde_json::json!({ "line": line, "error": reason }))
                }
            };
            let mut json = match json {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize output: {e}");
                    continue;
                }
            };
            json.push('\n');
            if let Err(e) = stdout.write_all(json.as_bytes()).await {
                tracing::error!("Failed to write stdout: {e}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    run_pipeline(line_rx, out_tx, Arc::clone(&engine), Arc::new(db.clone())).await;
    let _ = writer.await;

    // Dropping the last engine handle closes the audit channel so the
    // worker can flush and exit.
    refresher.abort();
    let _ = refresher.await;
    drop(engine);
    match tokio::time::timeout(Duration::from_secs(10), audit_worker).await {
        Ok(Ok(delivered)) => tracing::info!("Audit trail flushed ({delivered} events)"),
        Ok(Err(e)) => tracing::warn!("Audit worker failed: {e}"),
        Err(_) => tracing::warn!("Audit worker did not finish in time, events may be lost"),
    }

    ExitCode::SUCCESS
}
