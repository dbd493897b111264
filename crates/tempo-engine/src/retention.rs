//! Age-based trimming of the LLM audit log and the chat transcript.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use tempo_core::store::Store;

use crate::error::EngineError;

/// Rows removed by one trim pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetentionReport {
    pub llm_calls_deleted: usize,
    pub chat_messages_deleted: usize,
}

/// Deletes audit and transcript rows older than the retention horizon.
/// Idempotent: a second pass over the same horizon deletes nothing.
pub struct RetentionJob {
    store: Arc<Store>,
    retention_days: i64,
}

impl RetentionJob {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Trim with the configured horizon.
    pub async fn run(&self) -> Result<RetentionReport, EngineError> {
        self.trim(self.retention_days).await
    }

    /// Trim with an explicit horizon (the on-demand surface).
    pub async fn trim(&self, days: i64) -> Result<RetentionReport, EngineError> {
        let llm_calls_deleted = self.store.delete_llm_calls_older_than(days).await?;
        let chat_messages_deleted = self.store.delete_chat_messages_older_than(days).await?;
        let report = RetentionReport {
            llm_calls_deleted,
            chat_messages_deleted,
        };
        info!(
            days,
            llm_calls = report.llm_calls_deleted,
            chat_messages = report.chat_messages_deleted,
            "retention trim completed"
        );
        Ok(report)
    }
}
