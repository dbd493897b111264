//! Prompt assembly for the three logical calls.
//!
//! Each call gets a system message that fixes the output contract (one JSON
//! object, no prose) and a user message carrying the serialized inputs. The
//! inputs are also what lands in the audit record, so they are plain
//! serializable structs.

use serde::{Deserialize, Serialize};

use crate::provider::PromptMessage;

/// One already-scheduled task shown to the timeslot scheduler. The task
/// being (re)scheduled is never part of this list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
}

/// One task shown to the prioritizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskForPrioritization {
    pub id: i64,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

pub fn schedule_timeslot_messages(
    task_title: &str,
    task_context: &str,
    global_context: &str,
    current_datetime: &str,
    existing_schedule: &[ScheduleEntry],
) -> Vec<PromptMessage> {
    let system = "You are a scheduling assistant. Choose an optimal start and end time \
                  for the new task, avoiding overlap with the existing schedule and \
                  respecting the user's stated preferences. Respond with exactly one \
                  JSON object, no markdown and no prose:\n\
                  {\"start_time\": \"<ISO-8601 local datetime>\", \
                  \"end_time\": \"<ISO-8601 local datetime>\", \
                  \"reasoning\": \"<one or two sentences>\"}";
    let user = format!(
        "New task: {task_title}\n\
         Task context: {task_context}\n\
         Global context: {global_context}\n\
         Current datetime: {current_datetime}\n\
         Existing schedule: {}",
        serde_json::to_string(existing_schedule).unwrap_or_else(|_| "[]".into()),
    );
    vec![PromptMessage::system(system), PromptMessage::user(user)]
}

pub fn prioritize_messages(
    tasks: &[TaskForPrioritization],
    global_context: &str,
) -> Vec<PromptMessage> {
    let system = "You are a prioritization assistant. Score every task by urgency, \
                  importance, and due date. Respond with exactly one JSON object, no \
                  markdown and no prose:\n\
                  {\"prioritized_tasks\": [{\"id\": <task id>, \
                  \"priority\": <number between 0 and 10>, \
                  \"reasoning\": \"<one sentence>\"}]}\n\
                  Include every task exactly once; never invent ids.";
    let user = format!(
        "Tasks: {}\nGlobal context: {global_context}",
        serde_json::to_string(tasks).unwrap_or_else(|_| "[]".into()),
    );
    vec![PromptMessage::system(system), PromptMessage::user(user)]
}

pub fn assistant_messages(
    user_message: &str,
    task_list_json: &str,
    global_context: &str,
) -> Vec<PromptMessage> {
    let system = "You are a task-management assistant. Read the user's message and \
                  decide on at most one action. Respond with exactly one JSON object, \
                  no markdown and no prose:\n\
                  {\"action\": \"create_task|update_task|delete_task|start_task|\
                  complete_task|stop_task|list_tasks|get_task|chat\", \
                  \"task_id\": <id or null>, \"title\": <string or null>, \
                  \"description\": <string or null>, \"context\": <string or null>, \
                  \"response\": \"<natural language reply to the user>\"}\n\
                  Use \"chat\" when no task action is needed. Operations on a specific \
                  task require its task_id from the task list.";
    let user = format!(
        "User message: {user_message}\n\
         Current tasks: {task_list_json}\n\
         Global context: {global_context}"
    );
    vec![PromptMessage::system(system), PromptMessage::user(user)]
}
