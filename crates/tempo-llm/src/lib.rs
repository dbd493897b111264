//! LLM interaction layer.
//!
//! Wraps an opaque [`provider::LanguageModel`] capability with the three
//! typed logical calls the scheduler depends on: `schedule_timeslot`,
//! `prioritize`, and `assistant_act`. Each call assembles a strict-JSON
//! prompt, parses and validates the model's output, retries with backoff,
//! and leaves exactly one durable audit record per terminal outcome.

pub mod audit;
pub mod client;
pub mod outputs;
pub mod prompts;
pub mod provider;

pub use client::{AssistantActInput, LlmClient, PrioritizeInput, ScheduleSlotInput};
pub use prompts::{ScheduleEntry, TaskForPrioritization};
pub use outputs::{AssistantAction, AssistantReply, PrioritizedTask, ScheduledSlot};
pub use provider::{
    CompletionRequest, CompletionResponse, LanguageModel, LlmError, MockLanguageModel,
    OpenRouterProvider, PromptMessage, PromptRole,
};
