//! Application services over the store and the LLM client: the task
//! lifecycle engine, the chat orchestrator, retention, and backup.

pub mod backup;
pub mod chat;
pub mod error;
pub mod retention;
pub mod task_engine;

pub use chat::ChatOrchestrator;
pub use error::EngineError;
pub use retention::{RetentionJob, RetentionReport};
pub use task_engine::{CreateTaskRequest, TaskEngine};
