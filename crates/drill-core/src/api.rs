//! HTTP API for the Drill service.
//!
//! # Endpoints
//!
//! - `GET /api/health` - Store connectivity check
//! - `GET /api/ping` - Liveness check
//! - `POST /api/modules` - Import a module
//! - `GET /api/modules` - List modules
//! - `GET /api/modules/:id` - Get a module
//! - `POST /api/sessions` - Start a session
//! - `GET /api/sessions/:id` - Get a session
//! - `PATCH /api/sessions/:id` - Update position, rating or status
//! - `POST /api/sessions/:id/submit` - Submit an answer
//! - `POST /api/sessions/:id/submit/stream` - Submit an answer, streamed as SSE
//! - `POST /api/sessions/:id/hint` - Request a hint
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use drill_core::{create_router, AppState, Config};
//! use drill_llm::AnthropicClient;
//! use drill_store::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(AnthropicClient::new("sk-ant-...")?);
//! let state = AppState::new(Config::default(), Arc::new(MemoryStore::new()), provider);
//!
//! let router = create_router(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use drill_llm::LlmProvider;
use drill_store::{Module, ModuleSummary, PoolStats, Session, Store};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::DrillError;
use crate::evaluation::Evaluator;
use crate::events::SubmissionEvent;
use crate::progression::{
    HintRequest, HintResult, ModuleImport, NewSession, Progression, SessionUpdate, SubmitAnswer,
    SubmissionResult,
};

// ============================================================================
// Response Types
// ============================================================================

/// Response body for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy` when the store answers, `degraded` otherwise.
    pub status: String,
    /// `connected` or `disconnected`.
    pub database: String,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Connection pool usage, for pooled stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

/// Response body for the ping endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    /// Always `pong`.
    pub message: String,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable description.
    pub message: String,
    /// Seconds to wait before retrying, for rate-limit errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,
    /// Progression service over the store and evaluator.
    pub progression: Progression,
}

impl AppState {
    /// Wires the evaluator and progression service from configuration.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>, provider: Arc<dyn LlmProvider>) -> Self {
        let evaluator = Evaluator::new(provider, config.llm.clone(), &config.retry);
        let progression = Progression::new(store, evaluator, config.progression.clone());
        Self {
            config,
            progression,
        }
    }

    fn reject(&self, error: DrillError) -> ApiError {
        ApiError {
            error,
            expose_details: self.config.environment.exposes_details(),
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Internal error type for API handlers.
#[derive(Debug)]
struct ApiError {
    error: DrillError,
    expose_details: bool,
}

/// HTTP status and error code for a service error.
const fn classify(error: &DrillError) -> (StatusCode, &'static str) {
    match error {
        DrillError::SessionNotFound { .. } | DrillError::ModuleNotFound { .. } => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        DrillError::SessionCompleted => (StatusCode::BAD_REQUEST, "session_completed"),
        DrillError::ExerciseOutOfRange { .. } => (StatusCode::BAD_REQUEST, "invalid_exercise"),
        DrillError::AttemptLimitReached { .. } => {
            (StatusCode::BAD_REQUEST, "attempt_limit_reached")
        }
        DrillError::HintsExhausted => (StatusCode::BAD_REQUEST, "hints_exhausted"),
        DrillError::InvalidHintLevel { .. } => (StatusCode::BAD_REQUEST, "invalid_hint_level"),
        DrillError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
        DrillError::InvalidStateTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        DrillError::ConcurrentModification { .. } => (StatusCode::CONFLICT, "conflict"),
        DrillError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
        DrillError::LlmTimeout => (StatusCode::GATEWAY_TIMEOUT, "evaluation_timeout"),
        DrillError::LlmUnavailable { .. } => (StatusCode::BAD_GATEWAY, "evaluation_unavailable"),
        DrillError::MalformedResponse { .. } => (StatusCode::BAD_GATEWAY, "evaluation_failed"),
        DrillError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        DrillError::DatabaseBusy { .. } => (StatusCode::SERVICE_UNAVAILABLE, "database_busy"),
        DrillError::DatabaseTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "database_timeout"),
        DrillError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        DrillError::ConfigParseError { .. } | DrillError::ConfigValidationError { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

/// Client-facing message; internal details only when `expose_details`.
fn client_message(error: &DrillError, expose_details: bool) -> String {
    if expose_details {
        error.to_string()
    } else {
        error.public_message()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.error);
        if status.is_server_error() {
            error!(status = status.as_u16(), code, error = %self.error, "Request failed");
        } else {
            warn!(status = status.as_u16(), code, error = %self.error, "Request rejected");
        }

        let retry_after = self
            .error
            .retry_after()
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0));
        let body = Json(ErrorResponse {
            error: code.to_string(),
            message: client_message(&self.error, self.expose_details),
            retry_after,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all API endpoints.
///
/// Routes are nested under `/api`, with permissive CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/ping", get(handle_ping))
        .route("/modules", post(handle_import_module).get(handle_list_modules))
        .route("/modules/:id", get(handle_get_module))
        .route("/sessions", post(handle_create_session))
        .route(
            "/sessions/:id",
            get(handle_get_session).patch(handle_update_session),
        )
        .route("/sessions/:id/submit", post(handle_submit))
        .route("/sessions/:id/submit/stream", post(handle_submit_stream))
        .route("/sessions/:id/hint", post(handle_hint));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `GET /api/health`.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let connected = state.progression.store_healthy().await;
    Json(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        database: if connected { "connected" } else { "disconnected" }.to_string(),
        timestamp: Utc::now(),
        pool: state.progression.pool_stats(),
    })
}

/// Handler for `GET /api/ping`.
async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "pong".to_string(),
    })
}

/// Handler for `POST /api/modules`.
async fn handle_import_module(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleImport>,
) -> Result<(StatusCode, Json<Module>), ApiError> {
    let module = state
        .progression
        .import_module(request)
        .await
        .map_err(|e| state.reject(e))?;
    Ok((StatusCode::CREATED, Json(module)))
}

/// Handler for `GET /api/modules`.
async fn handle_list_modules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModuleSummary>>, ApiError> {
    let modules = state
        .progression
        .list_modules()
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(modules))
}

/// Handler for `GET /api/modules/:id`.
async fn handle_get_module(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Module>, ApiError> {
    let module = state
        .progression
        .get_module(&id)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(module))
}

/// Handler for `POST /api/sessions`.
async fn handle_create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewSession>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = state
        .progression
        .create_session(request)
        .await
        .map_err(|e| state.reject(e))?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Handler for `GET /api/sessions/:id`.
async fn handle_get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .progression
        .get_session(&id)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(session))
}

/// Handler for `PATCH /api/sessions/:id`.
async fn handle_update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<SessionUpdate>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .progression
        .update_session(&id, update)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(session))
}

/// Handler for `POST /api/sessions/:id/submit`.
///
/// Dropping the request future (client disconnect) drops the provider call.
async fn handle_submit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SubmitAnswer>,
) -> Result<Json<SubmissionResult>, ApiError> {
    info!(session_id = %id, exercise_index = ?request.exercise_index, "Received answer");
    let result = state
        .progression
        .submit(&id, request, &CancellationToken::new())
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(result))
}

/// Handler for `POST /api/sessions/:id/submit/stream`.
///
/// Rule violations are returned as ordinary error responses before the
/// stream opens. Once streaming, failures arrive as a terminal `error` event.
async fn handle_submit_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SubmitAnswer>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    info!(session_id = %id, exercise_index = ?request.exercise_index, "Received streamed answer");
    let pending = state
        .progression
        .begin_submission(&id, request)
        .await
        .map_err(|e| state.reject(e))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let progression = state.progression.clone();
    let expose_details = state.config.environment.exposes_details();

    tokio::spawn(async move {
        let session_id = pending.session_id().to_string();
        match progression.submit_streaming(pending, &tx, &cancel).await {
            Ok(_) => {}
            Err(DrillError::Cancelled) => {
                info!(session_id = %session_id, "Client disconnected; evaluation abandoned");
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Streamed evaluation failed");
                let _ = tx.send(SubmissionEvent::Error {
                    message: client_message(&err, expose_details),
                });
            }
        }
    });

    let events = UnboundedReceiverStream::new(rx)
        .map(|event: SubmissionEvent| Ok(Event::default().data(event.to_json())));
    Ok(Sse::new(CancelOnDrop {
        inner: events,
        _guard: guard,
    })
    .keep_alive(KeepAlive::default()))
}

/// Handler for `POST /api/sessions/:id/hint`.
async fn handle_hint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Option<Json<HintRequest>>,
) -> Result<Json<HintResult>, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let hint = state
        .progression
        .request_hint(&id, request, &CancellationToken::new())
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(hint))
}

/// Event stream that cancels the evaluation when the response is dropped.
struct CancelOnDrop<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S: Stream + Unpin> Stream for CancelOnDrop<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use drill_llm::LlmError;
    use drill_store::MemoryStore;
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::Environment;
    use crate::test_support::{sample_module, ScriptedProvider, GREAT_JOB};

    struct TestApp {
        router: Router,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
    }

    fn test_app(environment: Environment) -> TestApp {
        let mut config = Config::default();
        config.environment = environment;
        config.retry.max_retries = 0;
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(config, store.clone(), provider.clone());
        TestApp {
            router: create_router(state),
            provider,
            store,
        }
    }

    async fn seeded_session(app: &TestApp) -> Session {
        let module = sample_module(2);
        app.store.insert_module(&module).await.unwrap();
        let session = Session::new("learner", module.id);
        app.store.insert_session(&session).await.unwrap();
        session
    }

    fn json_request(method: Method, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn answer_body() -> serde_json::Value {
        serde_json::json!({
            "answer_text": "Demand rose faster than supply could respond.",
            "time_spent_seconds": 40,
            "hints_used": 0
        })
    }

    // ------------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping_returns_pong() {
        let app = test_app(Environment::Development);
        let response = app
            .router
            .oneshot(Request::builder().uri("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "pong");
    }

    #[tokio::test]
    async fn test_health_reports_connected_store() {
        let app = test_app(Environment::Development);
        let response = app
            .router
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["database"], "connected");
        assert!(json.get("pool").is_none());
    }

    // ------------------------------------------------------------------------
    // Modules and sessions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_import_module_then_start_session() {
        let app = test_app(Environment::Development);
        let exercises = serde_json::to_value(sample_module(1).exercises).unwrap();
        let response = app
            .router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/modules",
                &serde_json::json!({
                    "title": "Price Signals",
                    "domain": "economics",
                    "skill_level": "beginner",
                    "exercises": exercises
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let module = body_json(response).await;
        assert_eq!(module["exercises"][0]["type"], "analysis");

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                "/api/sessions",
                &serde_json::json!({"module_id": module["id"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let session = body_json(response).await;
        assert_eq!(session["status"], "in_progress");
        assert_eq!(session["current_exercise_index"], 0);
        assert_eq!(session["owner"], "anonymous");
    }

    #[tokio::test]
    async fn test_unknown_session_returns_404() {
        let app = test_app(Environment::Development);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_reopening_completed_session_returns_409() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        let uri = format!("/api/sessions/{}", session.id);

        let response = app
            .router
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                &uri,
                &serde_json::json!({"status": "completed"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["completed_at"].is_string());

        let response = app
            .router
            .oneshot(json_request(
                Method::PATCH,
                &uri,
                &serde_json::json!({"status": "in_progress"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_empty_session_update_returns_400() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;

        let response = app
            .router
            .oneshot(json_request(
                Method::PATCH,
                &format!("/api/sessions/{}", session.id),
                &serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_request");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("No fields provided for update"));
    }

    // ------------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_submit_returns_evaluation() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        app.provider.push_completion(Ok(GREAT_JOB.to_string()));

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["assessment"], "strong");
        assert_eq!(json["internal_score"], 85);
        assert_eq!(json["attempt_number"], 1);
        assert_eq!(json["should_advance"], true);
        assert_eq!(json["hint_available"], true);
    }

    #[tokio::test]
    async fn test_submit_to_completed_session_returns_400() {
        let app = test_app(Environment::Development);
        let mut session = seeded_session(&app).await;
        session.status = drill_store::SessionStatus::Completed;
        app.store.update_session_state(&session).await.unwrap();

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Session already completed");
        assert!(app.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_evaluation_hides_details_in_production() {
        let app = test_app(Environment::Production);
        let session = seeded_session(&app).await;
        app.provider
            .push_completion(Ok("```json\n{\"assessment\": \"meh\"}\n```".to_string()));

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"], "evaluation_failed");
        assert_eq!(json["message"], "Answer evaluation failed");
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        app.provider.push_completion(Err(LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
            message: "rate_limit_error".into(),
        }));

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        let json = body_json(response).await;
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert_eq!(json["retry_after"], 30);
    }

    #[tokio::test]
    async fn test_provider_timeout_returns_504() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        app.provider
            .push_completion(Err(LlmError::Timeout("deadline elapsed".into())));

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_streamed_submission_frames() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        app.provider.push_stream(&[
            "{\"assessment\":\"strong\",\"internal_score\":85,\"feedback\":\"",
            "Great job!\"}",
        ]);

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit/stream", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events: Vec<serde_json::Value> = String::from_utf8(body.to_vec())
            .unwrap()
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();

        assert_eq!(events[0]["type"], "start");
        let content: String = events
            .iter()
            .filter(|e| e["type"] == "content")
            .map(|e| e["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(content, "Great job!");
        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["attempt_number"], 1);
        assert_eq!(
            app.store.get_session(&session.id).await.unwrap().attempts.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_streamed_submission_reports_error_event() {
        let app = test_app(Environment::Production);
        let session = seeded_session(&app).await;
        app.provider.push_stream(&["{\"feedback\":\"Gre", "at\""]);

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/submit/stream", session.id),
                &answer_body(),
            ))
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#""type":"error""#));
        assert!(text.contains("Answer evaluation failed"));
        assert!(!text.contains(r#""type":"complete""#));
        assert!(app
            .store
            .get_session(&session.id)
            .await
            .unwrap()
            .attempts
            .is_empty());
    }

    // ------------------------------------------------------------------------
    // Hints
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_hint_without_body_defaults_to_level_one() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;
        app.provider
            .push_completion(Ok("Compare the two curves.".to_string()));

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/api/sessions/{}/hint", session.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["hint_level"], 1);
        assert_eq!(json["hints_remaining"], 2);
        assert_eq!(json["hint"], "Compare the two curves.");
    }

    #[tokio::test]
    async fn test_invalid_hint_level_returns_400() {
        let app = test_app(Environment::Development);
        let session = seeded_session(&app).await;

        let response = app
            .router
            .oneshot(json_request(
                Method::POST,
                &format!("/api/sessions/{}/hint", session.id),
                &serde_json::json!({"hint_level": 4}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_hint_level");
    }
}
