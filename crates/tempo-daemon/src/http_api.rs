//! HTTP surface over the engine, the chat orchestrator, and retention.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use tempo_core::store::Store;
use tempo_core::time::{now_local, safe_parse_iso};
use tempo_core::types::{ChatMessage, LlmCall, Task};
use tempo_engine::{
    ChatOrchestrator, CreateTaskRequest, EngineError, RetentionJob, RetentionReport, TaskEngine,
};

/// Shared application state for all handlers.
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    pub chat: Arc<ChatOrchestrator>,
    pub retention: Arc<RetentionJob>,
    pub store: Arc<Store>,
    pub scheduler_enabled: bool,
}

/// Build the API router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/scheduled", get(list_scheduled))
        .route("/api/tasks/active", get(get_active))
        .route("/api/tasks/completed", get(list_completed))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}", delete(delete_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/context", get(get_context))
        .route("/api/context", put(put_context))
        .route("/api/settings", get(get_settings))
        .route("/api/settings", put(put_settings))
        .route("/api/chat", post(chat_send))
        .route("/api/chat/history", get(chat_history))
        .route("/api/chat/history", delete(chat_clear))
        .route("/api/inference", get(inference_log))
        .route("/api/retention/trim", post(retention_trim))
        .route("/health", get(health))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::IllegalTransition(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) | EngineError::Gone => StatusCode::NOT_FOUND,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTaskBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    due_date: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextBody {
    context: String,
}

#[derive(Debug, Deserialize)]
struct SettingsBody {
    llm_model: String,
    max_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct TrimBody {
    #[serde(default)]
    days: Option<i64>,
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.engine.get_all_tasks().await?))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let due_date = body.due_date.as_deref().and_then(safe_parse_iso);
    let task = state
        .engine
        .create_task(CreateTaskRequest {
            title: body.title,
            description: body.description,
            context: body.context,
            due_date,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.get_task(id).await?))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.start_task(id).await?))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.stop_task(id).await?))
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.complete_task(id).await?))
}

async fn list_scheduled(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.engine.get_scheduled_tasks().await?))
}

async fn get_active(State(state): State<Arc<AppState>>) -> Result<Json<Option<Task>>, ApiError> {
    Ok(Json(state.engine.get_active_task().await?))
}

async fn list_completed(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.engine.get_completed_tasks().await?))
}

// ---------------------------------------------------------------------------
// Context & settings handlers
// ---------------------------------------------------------------------------

async fn get_context(State(state): State<Arc<AppState>>) -> Result<Json<ContextBody>, ApiError> {
    let row = state.engine.get_context().await?;
    Ok(Json(ContextBody {
        context: row.context,
    }))
}

async fn put_context(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContextBody>,
) -> Result<Json<ContextBody>, ApiError> {
    let row = state.engine.update_context(body.context).await?;
    Ok(Json(ContextBody {
        context: row.context,
    }))
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.engine.get_settings().await?;
    Ok(Json(json!({
        "llm_model": settings.llm_model,
        "max_tokens": settings.max_tokens,
    })))
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SettingsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state
        .engine
        .update_settings(body.llm_model, body.max_tokens)
        .await?;
    Ok(Json(json!({
        "llm_model": settings.llm_model,
        "max_tokens": settings.max_tokens,
    })))
}

// ---------------------------------------------------------------------------
// Chat, inference, retention
// ---------------------------------------------------------------------------

async fn chat_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatMessage>, ApiError> {
    Ok(Json(state.chat.process_message(&body.message).await?))
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.chat.get_history(query.limit).await?))
}

async fn chat_clear(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.chat.clear_history().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn inference_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LlmCall>>, ApiError> {
    let calls = state
        .store
        .get_latest_llm_calls(query.limit)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(calls))
}

async fn retention_trim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TrimBody>,
) -> Result<Json<RetentionReport>, ApiError> {
    let report = match body.days {
        Some(days) => state.retention.trim(days).await?,
        None => state.retention.run().await?,
    };
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = match state.store.get_or_create_settings().await {
        Ok(_) => "healthy".to_string(),
        Err(err) => format!("unhealthy: {err}"),
    };
    let scheduler = if state.scheduler_enabled {
        "enabled"
    } else {
        "disabled"
    };
    let status = if database == "healthy" {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "timestamp": tempo_core::time::format_iso(&now_local()),
        "components": {
            "database": database,
            "scheduler": scheduler,
        },
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempo_core::retry::RetryPolicy;
    use tempo_core::time::FallbackWindow;
    use tempo_llm::{LlmClient, MockLanguageModel};
    use tower::ServiceExt;

    async fn test_app(mock: MockLanguageModel) -> (Router, Arc<AppState>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let engine = Arc::new(TaskEngine::new(
            store.clone(),
            FallbackWindow {
                start_hour: 9,
                duration_hours: 1,
            },
        ));
        let llm = Arc::new(
            LlmClient::new(Arc::new(mock), store.clone()).with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            }),
        );
        let chat = Arc::new(ChatOrchestrator::new(engine.clone(), llm, store.clone()));
        let retention = Arc::new(RetentionJob::new(store.clone(), 30));
        let state = Arc::new(AppState {
            engine,
            chat,
            retention,
            store,
            scheduler_enabled: true,
        });
        (api_router(state.clone()), state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_fetch_task() {
        let (app, _state) = test_app(MockLanguageModel::new()).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                json!({"title": "Write report", "context": "urgent"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["title"], "Write report");
        assert_eq!(created["needs_scheduling"], true);

        let id = created["id"].as_i64().unwrap();
        let response = app
            .oneshot(empty_request("GET", &format!("/api/tasks/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn validation_maps_to_400() {
        let (app, _state) = test_app(MockLanguageModel::new()).await;
        let response = app
            .oneshot(json_request("POST", "/api/tasks", json!({"title": ""})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn start_conflict_maps_to_409() {
        let (app, state) = test_app(MockLanguageModel::new()).await;
        let a = state
            .engine
            .create_task(CreateTaskRequest {
                title: "a".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = state
            .engine
            .create_task(CreateTaskRequest {
                title: "b".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("POST", &format!("/api/tasks/{}/start", a.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(empty_request("POST", &format!("/api/tasks/{}/start", b.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains('a'));
    }

    #[tokio::test]
    async fn missing_task_maps_to_404() {
        let (app, _state) = test_app(MockLanguageModel::new()).await;
        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/tasks/999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request("DELETE", "/api/tasks/999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn context_roundtrip() {
        let (app, _state) = test_app(MockLanguageModel::new()).await;
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/context",
                json!({"context": "prefer mornings"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(empty_request("GET", "/api/context"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["context"], "prefer mornings");
    }

    #[tokio::test]
    async fn chat_endpoint_persists_turn() {
        let mock = MockLanguageModel::new().with_content(
            r#"{"action": "create_task", "title": "Buy milk", "response": "Done."}"#,
        );
        let (app, state) = test_app(mock).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/chat",
                json!({"message": "Add a task called Buy milk"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["assistant_response"], "Done.");

        assert_eq!(state.store.get_all_tasks().await.unwrap().len(), 1);

        let response = app
            .oneshot(empty_request("GET", "/api/chat/history?limit=5"))
            .await
            .unwrap();
        let history = body_json(response).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inference_log_lists_audit_rows() {
        let mock = MockLanguageModel::new()
            .with_content(r#"{"action": "chat", "response": "Hi."}"#);
        let (app, _state) = test_app(mock).await;

        app.clone()
            .oneshot(json_request("POST", "/api/chat", json!({"message": "hi"})))
            .await
            .unwrap();

        let response = app
            .oneshot(empty_request("GET", "/api/inference?limit=10"))
            .await
            .unwrap();
        let body = body_json(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["module_name"], "assistantAct");
    }

    #[tokio::test]
    async fn retention_trim_endpoint() {
        let (app, state) = test_app(MockLanguageModel::new()).await;
        state
            .store
            .create_chat_message("old".into(), "turn".into())
            .await
            .unwrap();

        let response = app
            .oneshot(json_request("POST", "/api/retention/trim", json!({"days": 0})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["chat_messages_deleted"], 1);
    }

    #[tokio::test]
    async fn health_reports_components() {
        let (app, _state) = test_app(MockLanguageModel::new()).await;
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["database"], "healthy");
        assert_eq!(body["components"]["scheduler"], "enabled");
    }
}
