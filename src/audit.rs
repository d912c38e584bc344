use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    error::Result,
    extraction::ExtractionResult,
    storage::{models::AuditRecord, Database},
};

/// Receives one record per successful extraction. Raw capture text never reaches it.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

pub fn audit_record(system_id: &str, result: &ExtractionResult) -> AuditRecord {
    AuditRecord {
        system_id: system_id.to_string(),
        username: result.username.clone(),
        password: result.password.clone(),
        expires_at: result.expires_at.clone(),
        method: result.method,
        raw_digest: result.raw_digest.clone(),
        recorded_at: Utc::now(),
    }
}

/// Writes audit records into the `audit_log` table.
pub struct DatabaseAuditSink {
    db: Arc<Mutex<Database>>,
}

impl DatabaseAuditSink {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DatabaseAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.db.lock().await.save_audit_record(record)
    }
}

/// Emits audit records as structured log events, password withheld.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            system = %record.system_id,
            username = %record.username,
            expires_at = record.expires_at.as_deref().unwrap_or("-"),
            method = %record.method,
            raw_digest = %record.raw_digest,
            "credential extracted"
        );
        Ok(())
    }
}
