//! Backup and restore of the store as a JSON document.
//!
//! The document always writes every section; restore tolerates documents
//! from older versions where `settings`, `chat_messages`, or a task's
//! `needs_scheduling` are absent. Task ids and `created_at` are re-issued
//! on restore.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use tempo_core::store::Store;
use tempo_core::time::{encode_ts, now_local, safe_parse_iso};
use tempo_core::types::{Task, TaskSnapshot};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    pub backup_time: String,
    pub tasks: Vec<BackupTask>,
    pub global_context: Option<BackupContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BackupSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_messages: Option<Vec<BackupChatMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub scheduled_start: Option<String>,
    #[serde(default)]
    pub scheduled_end: Option<String>,
    #[serde(default)]
    pub actual_start: Option<String>,
    #[serde(default)]
    pub actual_end: Option<String>,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub needs_scheduling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupContext {
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub llm_model: String,
    pub max_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupChatMessage {
    pub user_message: String,
    pub assistant_response: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Counts from one restore pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreReport {
    pub tasks_restored: usize,
    pub chat_messages_restored: usize,
    pub context_restored: bool,
    pub settings_restored: bool,
}

// ---------------------------------------------------------------------------
// Export / restore
// ---------------------------------------------------------------------------

/// Snapshot the whole store into a document.
pub async fn export(store: &Store) -> Result<BackupDocument, EngineError> {
    let tasks = store.get_all_tasks().await?;
    let context = store.get_or_create_context().await?;
    let settings = store.get_or_create_settings().await?;
    // The transcript is bounded by retention; a generous cap keeps the
    // export single-pass. Reads come back newest-first, the document keeps
    // chronological order so a restore replays turns in sequence.
    let mut chat = store.get_recent_chat_messages(100_000).await?;
    chat.reverse();

    let document = BackupDocument {
        backup_time: encode_ts(&now_local()),
        tasks: tasks.iter().map(task_to_backup).collect(),
        global_context: Some(BackupContext {
            context: context.context,
        }),
        settings: Some(BackupSettings {
            llm_model: settings.llm_model,
            max_tokens: settings.max_tokens,
        }),
        chat_messages: Some(
            chat.iter()
                .map(|m| BackupChatMessage {
                    user_message: m.user_message.clone(),
                    assistant_response: m.assistant_response.clone(),
                    created_at: Some(encode_ts(&m.created_at)),
                })
                .collect(),
        ),
    };
    info!(tasks = document.tasks.len(), "exported backup document");
    Ok(document)
}

/// Load a document into the store. Existing rows are left in place; this
/// is an additive restore, matching its use against a fresh database.
pub async fn restore(store: &Store, document: &BackupDocument) -> Result<RestoreReport, EngineError> {
    let mut report = RestoreReport::default();

    if let Some(ctx) = &document.global_context {
        store.update_context(ctx.context.clone()).await?;
        report.context_restored = true;
    }
    if let Some(settings) = &document.settings {
        store
            .update_settings(settings.llm_model.clone(), settings.max_tokens)
            .await?;
        report.settings_restored = true;
    }
    for task in &document.tasks {
        store.insert_task_snapshot(backup_to_snapshot(task)).await?;
        report.tasks_restored += 1;
    }
    if let Some(messages) = &document.chat_messages {
        for message in messages {
            store
                .create_chat_message(
                    message.user_message.clone(),
                    message.assistant_response.clone(),
                )
                .await?;
            report.chat_messages_restored += 1;
        }
    }

    info!(
        tasks = report.tasks_restored,
        chat_messages = report.chat_messages_restored,
        "restored backup document"
    );
    Ok(report)
}

fn task_to_backup(task: &Task) -> BackupTask {
    BackupTask {
        title: task.title.clone(),
        description: task.description.clone(),
        context: task.context.clone(),
        due_date: task.due_date.as_ref().map(encode_ts),
        scheduled_start: task.scheduled_start.as_ref().map(encode_ts),
        scheduled_end: task.scheduled_end.as_ref().map(encode_ts),
        actual_start: task.actual_start.as_ref().map(encode_ts),
        actual_end: task.actual_end.as_ref().map(encode_ts),
        priority: task.priority,
        completed: task.completed,
        needs_scheduling: task.needs_scheduling,
    }
}

fn backup_to_snapshot(task: &BackupTask) -> TaskSnapshot {
    TaskSnapshot {
        title: task.title.clone(),
        description: task.description.clone(),
        context: task.context.clone(),
        due_date: parse_opt(&task.due_date),
        scheduled_start: parse_opt(&task.scheduled_start),
        scheduled_end: parse_opt(&task.scheduled_end),
        actual_start: parse_opt(&task.actual_start),
        actual_end: parse_opt(&task.actual_end),
        priority: task.priority,
        completed: task.completed,
        needs_scheduling: task.needs_scheduling,
    }
}

fn parse_opt(raw: &Option<String>) -> Option<NaiveDateTime> {
    raw.as_deref().and_then(safe_parse_iso)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
