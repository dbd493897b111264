//! Chat orchestrator: one user utterance in, at most one task action out.
//!
//! The assistant's structured reply is dispatched through the task engine;
//! a failed side-effect becomes a note appended to the natural-language
//! response rather than an error to the caller, and every turn, successful
//! or not, persists exactly one transcript row.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use tempo_core::store::Store;
use tempo_core::types::ChatMessage;
use tempo_llm::{AssistantActInput, AssistantAction, LlmClient};

use crate::error::EngineError;
use crate::task_engine::{CreateTaskRequest, TaskEngine};

/// Reply used when the assistant call itself fails terminally. The user
/// still gets a complete turn.
const ASSISTANT_UNAVAILABLE: &str =
    "Sorry, I couldn't process that request right now. Please try again in a moment.";

pub struct ChatOrchestrator {
    engine: Arc<TaskEngine>,
    llm: Arc<LlmClient>,
    store: Arc<Store>,
}

impl ChatOrchestrator {
    pub fn new(engine: Arc<TaskEngine>, llm: Arc<LlmClient>, store: Arc<Store>) -> Self {
        Self { engine, llm, store }
    }

    /// Process one chat turn: snapshot state, consult the assistant,
    /// dispatch its action, persist the exchange.
    pub async fn process_message(&self, user_message: &str) -> Result<ChatMessage, EngineError> {
        let task_list = self.task_list_json().await?;
        let context_row = self.store.get_or_create_context().await?;
        let global_context = if context_row.context.is_empty() {
            "No global context set".to_string()
        } else {
            context_row.context
        };

        let reply = match self
            .llm
            .assistant_act(AssistantActInput {
                user_message: user_message.to_string(),
                task_list,
                global_context,
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "assistant call failed, returning degraded turn");
                tempo_llm::AssistantReply {
                    action: AssistantAction::Chat,
                    response: ASSISTANT_UNAVAILABLE.to_string(),
                    ..Default::default()
                }
            }
        };

        let mut final_response = reply.response.clone();
        if let Some(note) = self.dispatch(&reply).await {
            final_response.push_str("\n\nNote: ");
            final_response.push_str(&note);
        }

        let message = self
            .store
            .create_chat_message(user_message.to_string(), final_response)
            .await?;
        Ok(message)
    }

    /// Execute the assistant's action. Returns `Some(note)` describing a
    /// failure; `None` on success or for response-only actions.
    async fn dispatch(&self, reply: &tempo_llm::AssistantReply) -> Option<String> {
        match reply.action {
            AssistantAction::CreateTask => {
                let title = reply
                    .title
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| "Untitled Task".to_string());
                match self
                    .engine
                    .create_task(CreateTaskRequest {
                        title,
                        description: reply.description.clone().unwrap_or_default(),
                        context: reply.context.clone().unwrap_or_default(),
                        due_date: None,
                    })
                    .await
                {
                    Ok(task) => {
                        info!(task_id = task.id, "assistant created task");
                        None
                    }
                    Err(err) => Some(err.to_string()),
                }
            }
            AssistantAction::StartTask
            | AssistantAction::StopTask
            | AssistantAction::CompleteTask
            | AssistantAction::DeleteTask => {
                let Some(id) = reply.task_id else {
                    return Some("no task id was provided for that action".to_string());
                };
                let outcome = match reply.action {
                    AssistantAction::StartTask => self.engine.start_task(id).await.map(|_| ()),
                    AssistantAction::StopTask => self.engine.stop_task(id).await.map(|_| ()),
                    AssistantAction::CompleteTask => {
                        self.engine.complete_task(id).await.map(|_| ())
                    }
                    AssistantAction::DeleteTask => self.engine.delete_task(id).await,
                    _ => unreachable!("outer match restricts the action"),
                };
                match outcome {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(task_id = id, action = ?reply.action, error = %err, "assistant action failed");
                        Some(err.to_string())
                    }
                }
            }
            // Response-only: the assistant's text stands on its own.
            AssistantAction::UpdateTask
            | AssistantAction::ListTasks
            | AssistantAction::GetTask
            | AssistantAction::Chat => None,
        }
    }

    /// Current tasks as the JSON snapshot fed to the assistant.
    async fn task_list_json(&self) -> Result<String, EngineError> {
        let tasks = self.store.get_all_tasks().await?;
        let entries: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "title": t.title,
                    "description": t.description,
                    "context": t.context,
                    "priority": t.priority,
                    "completed": t.completed,
                    "scheduled_start": t.scheduled_start,
                    "scheduled_end": t.scheduled_end,
                    "actual_start": t.actual_start,
                })
            })
            .collect();
        Ok(serde_json::Value::Array(entries).to_string())
    }

    pub async fn get_history(&self, limit: i64) -> Result<Vec<ChatMessage>, EngineError> {
        Ok(self.store.get_recent_chat_messages(limit).await?)
    }

    pub async fn clear_history(&self) -> Result<usize, EngineError> {
        Ok(self.store.delete_all_chat_messages().await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
