//! Task lifecycle engine.
//!
//! The only write path for task state the HTTP and chat surfaces see.
//! Creation is deliberately fast: lengths are validated, the deterministic
//! fallback window is stamped, and the row is persisted with
//! `needs_scheduling = true` for the reconciler to pick up; no LLM call on
//! this path. Transition guards live in the store's transactional
//! operations; this layer translates their failures into the closed
//! [`EngineError`] taxonomy.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::info;

use tempo_core::store::Store;
use tempo_core::time::{now_local, FallbackWindow};
use tempo_core::types::{
    GlobalContext, NewTask, SettingsRow, Task, GLOBAL_CONTEXT_MAX_CHARS, TEXT_MAX_CHARS,
    TITLE_MAX_CHARS,
};

use crate::error::EngineError;

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    pub context: String,
    pub due_date: Option<NaiveDateTime>,
}

/// Synchronous task API shared by the HTTP handlers, the chat orchestrator,
/// and the CLI.
pub struct TaskEngine {
    store: Arc<Store>,
    fallback: FallbackWindow,
}

impl TaskEngine {
    pub fn new(store: Arc<Store>, fallback: FallbackWindow) -> Self {
        Self { store, fallback }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a task with fallback times. Fast path: returns as soon as the
    /// row is committed.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, EngineError> {
        validate_task_fields(&request)?;
        let (start, end) = self.fallback.window(now_local());
        let task = self
            .store
            .create_task(NewTask {
                title: request.title,
                description: request.description,
                context: request.context,
                due_date: request.due_date,
                scheduled_start: Some(start),
                scheduled_end: Some(end),
                priority: 0.0,
                needs_scheduling: true,
            })
            .await?;
        info!(task_id = task.id, "task created with fallback window");
        Ok(task)
    }

    /// Start a task. Fails with an illegal-transition error naming the
    /// currently active task when there is one.
    pub async fn start_task(&self, id: i64) -> Result<Task, EngineError> {
        Ok(self.store.start_task(id).await?)
    }

    /// Return an active task to pending.
    pub async fn stop_task(&self, id: i64) -> Result<Task, EngineError> {
        Ok(self.store.stop_task(id).await?)
    }

    /// Complete an active task.
    pub async fn complete_task(&self, id: i64) -> Result<Task, EngineError> {
        Ok(self.store.complete_task(id).await?)
    }

    /// Delete a task in any state.
    pub async fn delete_task(&self, id: i64) -> Result<(), EngineError> {
        if self.store.delete_task(id).await? {
            Ok(())
        } else {
            Err(EngineError::NotFound(id))
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, id: i64) -> Result<Task, EngineError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn get_all_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.get_all_tasks().await?)
    }

    pub async fn get_scheduled_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.get_scheduled_tasks().await?)
    }

    pub async fn get_active_task(&self) -> Result<Option<Task>, EngineError> {
        Ok(self.store.get_active_task().await?)
    }

    pub async fn get_completed_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.get_completed_tasks().await?)
    }

    // -----------------------------------------------------------------------
    // Global context & settings
    // -----------------------------------------------------------------------

    pub async fn get_context(&self) -> Result<GlobalContext, EngineError> {
        Ok(self.store.get_or_create_context().await?)
    }

    pub async fn update_context(&self, context: String) -> Result<GlobalContext, EngineError> {
        if context.chars().count() > GLOBAL_CONTEXT_MAX_CHARS {
            return Err(EngineError::Validation(format!(
                "global context exceeds {GLOBAL_CONTEXT_MAX_CHARS} characters"
            )));
        }
        Ok(self.store.update_context(context).await?)
    }

    pub async fn get_settings(&self) -> Result<SettingsRow, EngineError> {
        Ok(self.store.get_or_create_settings().await?)
    }

    pub async fn update_settings(
        &self,
        llm_model: String,
        max_tokens: i64,
    ) -> Result<SettingsRow, EngineError> {
        if !llm_model.contains('/') {
            return Err(EngineError::Validation(format!(
                "'{llm_model}' is not of the form provider/model"
            )));
        }
        if max_tokens <= 0 {
            return Err(EngineError::Validation(
                "max_tokens must be positive".into(),
            ));
        }
        Ok(self.store.update_settings(llm_model, max_tokens).await?)
    }
}

fn validate_task_fields(request: &CreateTaskRequest) -> Result<(), EngineError> {
    if request.title.trim().is_empty() {
        return Err(EngineError::Validation("title must not be empty".into()));
    }
    if request.title.chars().count() > TITLE_MAX_CHARS {
        return Err(EngineError::Validation(format!(
            "title exceeds {TITLE_MAX_CHARS} characters"
        )));
    }
    if request.description.chars().count() > TEXT_MAX_CHARS {
        return Err(EngineError::Validation(format!(
            "description exceeds {TEXT_MAX_CHARS} characters"
        )));
    }
    if request.context.chars().count() > TEXT_MAX_CHARS {
        return Err(EngineError::Validation(format!(
            "context exceeds {TEXT_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
