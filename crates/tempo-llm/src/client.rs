//! The typed LLM client.
//!
//! One struct, three logical calls. Each call reads the Settings singleton
//! for the active model, assembles its prompt, runs the
//! complete-parse-validate pipeline under the shared retry policy, and
//! brackets the whole thing with `traced`, which appends exactly one audit
//! row per terminal outcome, never one per retry attempt.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use tempo_core::retry::{retry_with_backoff, RetryPolicy};
use tempo_core::store::Store;
use tempo_core::types::NewLlmCall;

use crate::audit::safe_serialize;
use crate::outputs::{self, AssistantReply, PrioritizedTask, ScheduledSlot};
use crate::prompts::{self, ScheduleEntry, TaskForPrioritization};
use crate::provider::{CompletionRequest, LanguageModel, LlmError, PromptMessage};

// ---------------------------------------------------------------------------
// Call inputs
// ---------------------------------------------------------------------------

/// Inputs to `schedule_timeslot`. `existing_schedule` deliberately excludes
/// the task being (re)scheduled.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSlotInput {
    pub task_title: String,
    pub task_context: String,
    pub global_context: String,
    pub current_datetime: String,
    pub existing_schedule: Vec<ScheduleEntry>,
}

/// Inputs to `prioritize`.
#[derive(Debug, Clone, Serialize)]
pub struct PrioritizeInput {
    pub tasks: Vec<TaskForPrioritization>,
    pub global_context: String,
}

/// Inputs to `assistant_act`.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantActInput {
    pub user_message: String,
    pub task_list: String,
    pub global_context: String,
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// Typed facade over the language model, constructed once at startup and
/// injected wherever a call is made.
pub struct LlmClient {
    provider: Arc<dyn LanguageModel>,
    store: Arc<Store>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LanguageModel>, store: Arc<Store>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy (tests use millisecond backoffs).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Choose a fresh timeslot for one task.
    pub async fn schedule_timeslot(
        &self,
        input: ScheduleSlotInput,
    ) -> Result<ScheduledSlot, LlmError> {
        let recorded_inputs = safe_serialize(&input);
        self.traced("scheduleTimeslot", recorded_inputs, async {
            let request = self
                .request_for(prompts::schedule_timeslot_messages(
                    &input.task_title,
                    &input.task_context,
                    &input.global_context,
                    &input.current_datetime,
                    &input.existing_schedule,
                ))
                .await?;
            retry_with_backoff(self.retry, "scheduleTimeslot", || {
                let request = request.clone();
                async move {
                    let response = self.provider.complete(&request).await?;
                    outputs::parse_scheduled_slot(&response.content)
                }
            })
            .await
        })
        .await
    }

    /// Score the whole incomplete set. Rows with out-of-range priorities
    /// invalidate the call, which the retry loop then re-runs.
    pub async fn prioritize(
        &self,
        input: PrioritizeInput,
    ) -> Result<Vec<PrioritizedTask>, LlmError> {
        let recorded_inputs = safe_serialize(&input);
        self.traced("prioritize", recorded_inputs, async {
            let request = self
                .request_for(prompts::prioritize_messages(
                    &input.tasks,
                    &input.global_context,
                ))
                .await?;
            retry_with_backoff(self.retry, "prioritize", || {
                let request = request.clone();
                async move {
                    let response = self.provider.complete(&request).await?;
                    outputs::parse_prioritized_tasks(&response.content)
                }
            })
            .await
        })
        .await
    }

    /// Turn one user utterance into a structured action plus reply.
    pub async fn assistant_act(
        &self,
        input: AssistantActInput,
    ) -> Result<AssistantReply, LlmError> {
        let recorded_inputs = safe_serialize(&input);
        self.traced("assistantAct", recorded_inputs, async {
            let request = self
                .request_for(prompts::assistant_messages(
                    &input.user_message,
                    &input.task_list,
                    &input.global_context,
                ))
                .await?;
            retry_with_backoff(self.retry, "assistantAct", || {
                let request = request.clone();
                async move {
                    let response = self.provider.complete(&request).await?;
                    outputs::parse_assistant_reply(&response.content)
                }
            })
            .await
        })
        .await
    }

    /// Build a request from the Settings singleton (active model + token
    /// cap).
    async fn request_for(
        &self,
        messages: Vec<PromptMessage>,
    ) -> Result<CompletionRequest, LlmError> {
        let settings = self
            .store
            .get_or_create_settings()
            .await
            .map_err(|e| LlmError::Store(e.to_string()))?;
        Ok(CompletionRequest {
            model: settings.llm_model,
            max_tokens: settings.max_tokens,
            messages,
        })
    }

    /// Bracket one logical call: time it, then append a single audit row
    /// for the terminal outcome. Audit failures are logged and swallowed;
    /// a lost audit row must never fail the call it describes.
    async fn traced<T, Fut>(
        &self,
        module: &'static str,
        inputs: String,
        call: Fut,
    ) -> Result<T, LlmError>
    where
        T: Serialize + Debug,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let started = Instant::now();
        let result = call.await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outputs = match &result {
            Ok(value) => safe_serialize(value),
            Err(err) => format!("error: {err}"),
        };
        let record = NewLlmCall {
            module_name: module.to_string(),
            inputs,
            outputs,
            duration_ms,
        };
        if let Err(err) = self.store.create_llm_call(record).await {
            warn!(module, error = %err, "failed to persist llm call audit row");
        }

        match &result {
            Ok(_) => info!(module, duration_ms, "llm call completed"),
            Err(err) => error!(module, duration_ms, error = %err, "llm call failed"),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::AssistantAction;
    use crate::provider::MockLanguageModel;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    async fn client_with(mock: MockLanguageModel) -> (LlmClient, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let client =
            LlmClient::new(Arc::new(mock), store.clone()).with_retry_policy(fast_retry());
        (client, store)
    }

    fn slot_input() -> ScheduleSlotInput {
        ScheduleSlotInput {
            task_title: "write report".into(),
            task_context: "urgent".into(),
            global_context: String::new(),
            current_datetime: "2025-10-01T08:00:00".into(),
            existing_schedule: Vec::new(),
        }
    }

    #[tokio::test]
    async fn schedule_success_emits_one_audit_row() {
        let mock = MockLanguageModel::new().with_content(
            r#"{"start_time": "2025-10-01T09:00:00", "end_time": "2025-10-01T10:30:00", "reasoning": "ok"}"#,
        );
        let (client, store) = client_with(mock).await;

        let slot = client.schedule_timeslot(slot_input()).await.unwrap();
        assert_eq!(slot.start_time.as_deref(), Some("2025-10-01T09:00:00"));

        let calls = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].module_name, "scheduleTimeslot");
        assert!(calls[0].inputs.contains("write report"));
        assert!(calls[0].outputs.contains("2025-10-01T09:00:00"));
        assert!(calls[0].duration_ms >= 0.0);
    }

    #[tokio::test]
    async fn retry_recovers_and_still_emits_one_audit_row() {
        let mock = MockLanguageModel::new()
            .with_content("sorry, I cannot help with that")
            .with_content(r#"{"start_time": "2025-10-01T09:00:00", "end_time": "2025-10-01T10:00:00"}"#);
        let (client, store) = client_with(mock.clone()).await;

        let slot = client.schedule_timeslot(slot_input()).await.unwrap();
        assert!(slot.start_time.is_some());
        assert_eq!(mock.call_count(), 2);

        // One terminal outcome, one audit row; retries never log their own.
        let calls = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_and_record_failure() {
        let mock = MockLanguageModel::new()
            .with_error(LlmError::Timeout)
            .with_error(LlmError::Timeout)
            .with_error(LlmError::Timeout);
        let (client, store) = client_with(mock.clone()).await;

        let err = client.schedule_timeslot(slot_input()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        assert_eq!(mock.call_count(), 3);

        let calls = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].outputs.starts_with("error:"));
    }

    #[tokio::test]
    async fn out_of_range_priority_triggers_retry() {
        let mock = MockLanguageModel::new()
            .with_content(r#"{"prioritized_tasks": [{"id": 1, "priority": 10.0001}]}"#)
            .with_content(r#"{"prioritized_tasks": [{"id": 1, "priority": 10.0, "reasoning": "max"}]}"#);
        let (client, store) = client_with(mock.clone()).await;

        let input = PrioritizeInput {
            tasks: vec![TaskForPrioritization {
                id: 1,
                title: "t".into(),
                description: String::new(),
                due_date: None,
            }],
            global_context: String::new(),
        };
        let scored = client.prioritize(input).await.unwrap();
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].priority, 10.0);
        assert_eq!(mock.call_count(), 2);

        let calls = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].module_name, "prioritize");
    }

    #[tokio::test]
    async fn assistant_act_parses_action_and_records_module() {
        let mock = MockLanguageModel::new().with_content(
            r#"{"action": "create_task", "title": "Buy milk", "response": "Done."}"#,
        );
        let (client, store) = client_with(mock).await;

        let reply = client
            .assistant_act(AssistantActInput {
                user_message: "Add a task called Buy milk".into(),
                task_list: "[]".into(),
                global_context: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(reply.action, AssistantAction::CreateTask);
        assert_eq!(reply.response, "Done.");

        let calls = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].module_name, "assistantAct");
    }

    #[tokio::test]
    async fn requests_use_the_settings_model_and_cap() {
        let mock = MockLanguageModel::new().with_content(r#"{"response": "hi"}"#);
        let (client, store) = client_with(mock.clone()).await;
        store
            .update_settings("openai/gpt-4o-mini".into(), 4321)
            .await
            .unwrap();

        client
            .assistant_act(AssistantActInput {
                user_message: "hello".into(),
                task_list: "[]".into(),
                global_context: String::new(),
            })
            .await
            .unwrap();

        let captured = mock.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].model, "openai/gpt-4o-mini");
        assert_eq!(captured[0].max_tokens, 4321);
    }
}
