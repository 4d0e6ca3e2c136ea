use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AuditConfig;
use crate::core::AuditEvent;
use crate::sources::AuditSink;

/// Cheap, cloneable sender side of the audit trail.
///
/// Emitting never waits on the sink, so a slow or failing audit store cannot
/// hold up a verdict.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!(kind = e.0.kind.as_str(), "Audit channel closed, event dropped");
        }
    }
}

/// Drain audit events into `sink` until every handle is dropped.
/// Returns how many events were delivered.
pub async fn run_audit_worker(
    mut rx: mpsc::UnboundedReceiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
) -> u64 {
    let mut delivered: u64 = 0;
    let mut dropped: u64 = 0;

    while let Some(event) = rx.recv().await {
        if deliver(sink.as_ref(), &event, &config).await {
            delivered += 1;
        } else {
            dropped += 1;
        }
        if (delivered + dropped) % 1000 == 0 {
            tracing::info!(delivered, dropped, "Audit worker progress");
        }
    }

    tracing::info!(delivered, dropped, "Audit worker stopped");
    delivered
}

async fn deliver(sink: &dyn AuditSink, event: &AuditEvent, config: &AuditConfig) -> bool {
    let mut attempt: u32 = 0;
    loop {
        match sink.record(event).await {
            Ok(()) => return true,
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                tracing::debug!(attempt, kind = event.kind.as_str(), "Audit write failed, retrying: {e}");
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms * attempt as u64)).await;
            }
            Err(e) => {
                tracing::error!(
                    kind = event.kind.as_str(),
                    evaluation_id = ?event.evaluation_id,
                    "Audit event lost after {} attempts: {e}",
                    attempt + 1
                );
                return false;
            }
        }
    }
}
