use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Maximum length of a task title.
pub const TITLE_MAX_CHARS: usize = 200;
/// Maximum length of a task description or task context.
pub const TEXT_MAX_CHARS: usize = 1000;
/// Maximum length of the global context blob.
pub const GLOBAL_CONTEXT_MAX_CHARS: usize = 5000;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of user work.
///
/// Scheduling fields (`scheduled_*`) hold either LLM-derived times or the
/// deterministic fallback window; `needs_scheduling` marks the latter so the
/// reconciler knows to replace them. Lifecycle state is derived from
/// `actual_start` / `completed`, not stored separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub context: String,
    pub due_date: Option<NaiveDateTime>,
    pub scheduled_start: Option<NaiveDateTime>,
    pub scheduled_end: Option<NaiveDateTime>,
    pub actual_start: Option<NaiveDateTime>,
    pub actual_end: Option<NaiveDateTime>,
    pub priority: f64,
    pub completed: bool,
    pub needs_scheduling: bool,
    pub created_at: NaiveDateTime,
}

impl Task {
    /// Derive the lifecycle state from the stored fields.
    pub fn state(&self) -> TaskState {
        if self.completed {
            TaskState::Completed
        } else if self.actual_start.is_some() {
            TaskState::Active
        } else {
            TaskState::Pending
        }
    }

    /// Whether this task is the (at most one) active task.
    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }
}

/// Lifecycle state derived from a task's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Completed,
}

/// Insert payload for a new task. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub context: String,
    pub due_date: Option<NaiveDateTime>,
    pub scheduled_start: Option<NaiveDateTime>,
    pub scheduled_end: Option<NaiveDateTime>,
    pub priority: f64,
    pub needs_scheduling: bool,
}

/// Full-field task row for restore: everything but `id` and `created_at`,
/// which are re-issued on insert.
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    pub title: String,
    pub description: String,
    pub context: String,
    pub due_date: Option<NaiveDateTime>,
    pub scheduled_start: Option<NaiveDateTime>,
    pub scheduled_end: Option<NaiveDateTime>,
    pub actual_start: Option<NaiveDateTime>,
    pub actual_end: Option<NaiveDateTime>,
    pub priority: f64,
    pub completed: bool,
    pub needs_scheduling: bool,
}

// ---------------------------------------------------------------------------
// Singletons
// ---------------------------------------------------------------------------

/// Singleton free-text blob of user preferences fed to every LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalContext {
    pub id: i64,
    pub context: String,
    pub updated_at: NaiveDateTime,
}

/// Singleton runtime settings: the active model and its token cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRow {
    pub id: i64,
    pub llm_model: String,
    pub max_tokens: i64,
    pub updated_at: NaiveDateTime,
}

/// Default model identifier used when the settings row is first created.
pub const DEFAULT_LLM_MODEL: &str = "deepseek/deepseek-v3.2-exp";
/// Default completion token cap.
pub const DEFAULT_MAX_TOKENS: i64 = 2000;

// ---------------------------------------------------------------------------
// Chat transcript
// ---------------------------------------------------------------------------

/// One chat turn: the user's message and the assistant's final response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub user_message: String,
    pub assistant_response: String,
    pub created_at: NaiveDateTime,
}

// ---------------------------------------------------------------------------
// LLM audit log
// ---------------------------------------------------------------------------

/// Durable record of one logical LLM call (terminal success or failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub id: i64,
    pub module_name: String,
    pub inputs: String,
    pub outputs: String,
    pub duration_ms: f64,
    pub created_at: NaiveDateTime,
}

/// Insert payload for an audit record.
#[derive(Debug, Clone)]
pub struct NewLlmCall {
    pub module_name: String,
    pub inputs: String,
    pub outputs: String,
    pub duration_ms: f64,
}
