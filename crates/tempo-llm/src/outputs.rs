//! Parsing and validation of model output.
//!
//! Models are asked for bare JSON but routinely wrap it in markdown fences
//! or stray prose; extraction tolerates that. Validation is strict: a
//! priority outside [0, 10] invalidates the whole prioritize call so the
//! retry loop fires.

use serde::{Deserialize, Serialize};

use crate::provider::LlmError;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Timeslot chosen by the model. The datetime fields stay raw strings here;
/// callers parse them with `safe_parse_iso` and fall back on `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledSlot {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// One scored task from the prioritizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizedTask {
    pub id: i64,
    pub priority: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PrioritizeOutput {
    prioritized_tasks: Vec<PrioritizedTask>,
}

/// The closed action set the assistant may emit. Unknown strings degrade to
/// `Chat`, which is response-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantAction {
    CreateTask,
    UpdateTask,
    DeleteTask,
    StartTask,
    CompleteTask,
    StopTask,
    ListTasks,
    GetTask,
    #[default]
    #[serde(other)]
    Chat,
}

/// Structured assistant turn: one action plus the natural-language reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantReply {
    #[serde(default)]
    pub action: AssistantAction,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub response: String,
}

// ---------------------------------------------------------------------------
// Extraction & parsing
// ---------------------------------------------------------------------------

/// Pull the JSON object out of a model reply, tolerating markdown fences and
/// surrounding prose.
fn extract_json(raw: &str) -> Result<&str, LlmError> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    let text = text.trim();
    if text.starts_with('{') && text.ends_with('}') {
        return Ok(text);
    }
    let start = text
        .find('{')
        .ok_or_else(|| LlmError::Parse(format!("no JSON object in reply: {}", preview(raw))))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| LlmError::Parse(format!("unterminated JSON object: {}", preview(raw))))?;
    if end < start {
        return Err(LlmError::Parse(format!(
            "malformed JSON object: {}",
            preview(raw)
        )));
    }
    Ok(&text[start..=end])
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > 120 {
        let cut: String = trimmed.chars().take(120).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

pub fn parse_scheduled_slot(raw: &str) -> Result<ScheduledSlot, LlmError> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| LlmError::Parse(e.to_string()))
}

/// Parse and validate a prioritize reply. Every returned priority must lie
/// inside [0, 10]; a single out-of-range row rejects the whole call.
pub fn parse_prioritized_tasks(raw: &str) -> Result<Vec<PrioritizedTask>, LlmError> {
    let json = extract_json(raw)?;
    let output: PrioritizeOutput =
        serde_json::from_str(json).map_err(|e| LlmError::Parse(e.to_string()))?;
    for task in &output.prioritized_tasks {
        if !task.priority.is_finite() || task.priority < 0.0 || task.priority > 10.0 {
            return Err(LlmError::Invalid(format!(
                "priority {} for task {} is outside [0, 10]",
                task.priority, task.id
            )));
        }
    }
    Ok(output.prioritized_tasks)
}

pub fn parse_assistant_reply(raw: &str) -> Result<AssistantReply, LlmError> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| LlmError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_parses_plain_json() {
        let slot = parse_scheduled_slot(
            r#"{"start_time": "2025-10-01T09:00:00", "end_time": "2025-10-01T10:30:00", "reasoning": "morning focus"}"#,
        )
        .unwrap();
        assert_eq!(slot.start_time.as_deref(), Some("2025-10-01T09:00:00"));
        assert_eq!(slot.end_time.as_deref(), Some("2025-10-01T10:30:00"));
        assert_eq!(slot.reasoning, "morning focus");
    }

    #[test]
    fn slot_parses_fenced_json() {
        let raw = "```json\n{\"start_time\": \"2025-10-01T09:00:00\", \"end_time\": \"2025-10-01T10:00:00\"}\n```";
        let slot = parse_scheduled_slot(raw).unwrap();
        assert_eq!(slot.start_time.as_deref(), Some("2025-10-01T09:00:00"));
    }

    #[test]
    fn slot_parses_json_with_surrounding_prose() {
        let raw = "Here is the slot you asked for: {\"start_time\": \"2025-10-01T09:00:00\", \"end_time\": \"2025-10-01T10:00:00\"} — enjoy!";
        let slot = parse_scheduled_slot(raw).unwrap();
        assert_eq!(slot.end_time.as_deref(), Some("2025-10-01T10:00:00"));
    }

    #[test]
    fn slot_with_missing_fields_defaults_to_none() {
        let slot = parse_scheduled_slot(r#"{"reasoning": "unsure"}"#).unwrap();
        assert!(slot.start_time.is_none());
        assert!(slot.end_time.is_none());
    }

    #[test]
    fn non_json_reply_is_a_parse_error() {
        assert!(matches!(
            parse_scheduled_slot("I cannot schedule that."),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn priorities_in_range_accepted() {
        let tasks = parse_prioritized_tasks(
            r#"{"prioritized_tasks": [
                {"id": 1, "priority": 0.0, "reasoning": "low"},
                {"id": 2, "priority": 10.0, "reasoning": "max"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].priority, 10.0);
    }

    #[test]
    fn priority_just_above_ten_rejects_whole_call() {
        let err = parse_prioritized_tasks(
            r#"{"prioritized_tasks": [
                {"id": 1, "priority": 5.0},
                {"id": 2, "priority": 10.0001}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::Invalid(_)));
    }

    #[test]
    fn negative_priority_rejected() {
        assert!(matches!(
            parse_prioritized_tasks(r#"{"prioritized_tasks": [{"id": 1, "priority": -0.5}]}"#),
            Err(LlmError::Invalid(_))
        ));
    }

    #[test]
    fn assistant_reply_parses_create() {
        let reply = parse_assistant_reply(
            r#"{"action": "create_task", "title": "Buy milk", "response": "Done."}"#,
        )
        .unwrap();
        assert_eq!(reply.action, AssistantAction::CreateTask);
        assert_eq!(reply.title.as_deref(), Some("Buy milk"));
        assert_eq!(reply.response, "Done.");
    }

    #[test]
    fn unknown_action_degrades_to_chat() {
        let reply = parse_assistant_reply(
            r#"{"action": "reschedule_everything", "response": "Sure."}"#,
        )
        .unwrap();
        assert_eq!(reply.action, AssistantAction::Chat);
    }

    #[test]
    fn missing_action_defaults_to_chat() {
        let reply = parse_assistant_reply(r#"{"response": "Hello!"}"#).unwrap();
        assert_eq!(reply.action, AssistantAction::Chat);
        assert!(reply.task_id.is_none());
    }
}
