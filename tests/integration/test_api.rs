//! End-to-end tests for the Drill HTTP API.
//!
//! Each test runs the real server over a temporary SQLite database, with the
//! Anthropic Messages API replaced by a mock server.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use drill_core::{create_router, AppState, Config};
use drill_llm::AnthropicClient;
use drill_store::{SqliteStore, Store};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// A running server, its mock provider and the directory holding its database.
struct TestServer {
    base_url: String,
    provider: MockServer,
    client: reqwest::Client,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, route: &str) -> String {
        format!("{}/api{route}", self.base_url)
    }

    async fn post(&self, route: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(route))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    async fn get(&self, route: &str) -> reqwest::Response {
        self.client
            .get(self.url(route))
            .send()
            .await
            .expect("Request failed")
    }

    /// Imports a two-exercise module and starts a session on it.
    async fn start_session(&self) -> String {
        let module: Value = self
            .post("/modules", &sample_module())
            .await
            .json()
            .await
            .expect("Invalid module JSON");
        let session: Value = self
            .post("/sessions", &json!({"module_id": module["id"], "owner": "learner-1"}))
            .await
            .json()
            .await
            .expect("Invalid session JSON");
        session["id"].as_str().expect("Session has no id").to_string()
    }
}

/// Spawns the server with `configure` applied to a test configuration.
async fn spawn_test_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let provider = MockServer::start().await;
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut config = Config::default();
    config.database.path = dir.path().join("drill.db").display().to_string();
    config.retry.base_delay_secs = 0.01;
    config.retry.max_delay_secs = 0.05;
    configure(&mut config);

    let store = SqliteStore::open(
        &config.database.path,
        config.database.pool_config(),
        config.database.statement_timeout(),
    )
    .await
    .expect("Failed to open database");
    store.init().await.expect("Failed to create schema");

    let client = AnthropicClient::new("test-key")
        .expect("Failed to build client")
        .with_base_url(provider.uri());

    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");
    let router = create_router(AppState::new(config, Arc::new(store), Arc::new(client)));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base_url: format!("http://{addr}"),
        provider,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

fn sample_module() -> Value {
    json!({
        "title": "Reading Balance Sheets",
        "domain": "finance",
        "skill_level": "intermediate",
        "exercises": [
            {
                "sequence": 1,
                "type": "analysis",
                "prompt": "What does a falling current ratio suggest?",
                "material": "Current ratio fell from 2.1 to 1.2 over two years.",
                "validation_criteria": {"must_mention": ["liquidity"]},
                "model_answer": "Liquidity is weakening.",
                "model_explanation": "Current liabilities grew faster than current assets."
            },
            {
                "sequence": 2,
                "type": "comparative",
                "prompt": "Compare the two firms' leverage.",
                "model_answer": "Firm B is more leveraged."
            }
        ]
    })
}

fn answer() -> Value {
    json!({
        "answer_text": "The firm's short-term liquidity is getting worse.",
        "time_spent_seconds": 95,
        "hints_used": 0
    })
}

fn message_body(text: &str) -> Value {
    json!({"id": "msg_test", "content": [{"type": "text", "text": text}]})
}

/// Renders text chunks as an Anthropic streaming response.
fn sse_body(chunks: &[&str]) -> String {
    let mut body = String::from("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
    for chunk in chunks {
        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": chunk}
        });
        body.push_str(&format!("event: content_block_delta\ndata: {delta}\n\n"));
    }
    body.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    body
}

/// Parses the `data:` lines of a server-sent event body.
fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(|data| serde_json::from_str(data).expect("Invalid event JSON"))
        .collect()
}

async fn mount_completion(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(message_body(text)))
        .mount(server)
        .await;
}

const GREAT_JOB: &str = r#"{"assessment":"strong","internal_score":85,"feedback":"Great job!"}"#;

// ============================================================================
// Probes
// ============================================================================

#[tokio::test]
async fn test_health_reports_database_and_pool() {
    let server = spawn_test_server(|_| {}).await;

    let response = server.get("/health").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["pool"]["max_size"], 10);
}

// ============================================================================
// Submissions
// ============================================================================

#[tokio::test]
async fn test_streamed_submission_end_to_end() {
    let server = spawn_test_server(|_| {}).await;
    let session_id = server.start_session().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&[
                    "{\"assessment\": \"strong\", \"internal_score\": 85, \"feed",
                    "back\": \"Great",
                    " job!\"}",
                ])),
        )
        .expect(1)
        .mount(&server.provider)
        .await;

    let response = server
        .post(&format!("/sessions/{session_id}/submit/stream"), &answer())
        .await;
    assert_eq!(response.status(), 200);
    let events = sse_events(&response.text().await.unwrap());

    assert_eq!(events[0]["type"], "start");
    assert_eq!(events[0]["attempt_number"], 1);
    let feedback: String = events
        .iter()
        .filter(|e| e["type"] == "content")
        .map(|e| e["text"].as_str().unwrap())
        .collect();
    assert_eq!(feedback, "Great job!");

    let complete = events.last().unwrap();
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["assessment"], "strong");
    assert_eq!(complete["internal_score"], 85);
    assert_eq!(complete["should_advance"], true);

    let session: Value = server
        .get(&format!("/sessions/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    let attempts = session["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["feedback"], "Great job!");
}

#[tokio::test]
async fn test_second_submission_is_attempt_two() {
    let server = spawn_test_server(|_| {}).await;
    let session_id = server.start_session().await;
    mount_completion(
        &server.provider,
        r#"{"assessment":"developing","internal_score":55,"feedback":"Mention liquidity."}"#,
    )
    .await;

    let route = format!("/sessions/{session_id}/submit");
    let first: Value = server.post(&route, &answer()).await.json().await.unwrap();
    let second: Value = server.post(&route, &answer()).await.json().await.unwrap();

    assert_eq!(first["attempt_number"], 1);
    assert_eq!(second["attempt_number"], 2);
    assert_eq!(second["should_advance"], false);
}

#[tokio::test]
async fn test_completed_session_rejects_submission() {
    let server = spawn_test_server(|_| {}).await;
    let session_id = server.start_session().await;

    let response = server
        .client
        .patch(server.url(&format!("/sessions/{session_id}")))
        .json(&json!({"status": "completed", "confidence_rating": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .post(&format!("/sessions/{session_id}/submit"), &answer())
        .await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Session already completed");
    assert!(server.provider.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_provider_failure_is_retried() {
    let server = spawn_test_server(|_| {}).await;
    let session_id = server.start_session().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server.provider)
        .await;
    mount_completion(&server.provider, GREAT_JOB).await;

    let response = server
        .post(&format!("/sessions/{session_id}/submit"), &answer())
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(server.provider.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rate_limit_surfaces_retry_after() {
    let server = spawn_test_server(|config| config.retry.max_retries = 0).await;
    let session_id = server.start_session().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_string("rate limited"),
        )
        .mount(&server.provider)
        .await;

    let response = server
        .post(&format!("/sessions/{session_id}/submit"), &answer())
        .await;
    assert_eq!(response.status(), 429);
    assert_eq!(response.headers()["retry-after"], "30");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["retry_after"], 30);
}

#[tokio::test]
async fn test_malformed_evaluation_returns_bad_gateway() {
    let server = spawn_test_server(|_| {}).await;
    let session_id = server.start_session().await;
    mount_completion(&server.provider, "I think the answer is pretty good!").await;

    let response = server
        .post(&format!("/sessions/{session_id}/submit"), &answer())
        .await;
    assert_eq!(response.status(), 502);

    let session: Value = server
        .get(&format!("/sessions/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert!(session["attempts"].as_array().unwrap().is_empty());
}

// ============================================================================
// Hints
// ============================================================================

#[tokio::test]
async fn test_hints_are_generated_once_and_shared() {
    let server = spawn_test_server(|_| {}).await;
    let first_session = server.start_session().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(message_body("  Think about short-term obligations.  ")),
        )
        .expect(1)
        .mount(&server.provider)
        .await;

    let hint: Value = server
        .post(&format!("/sessions/{first_session}/hint"), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(hint["hint"], "Think about short-term obligations.");
    assert_eq!(hint["hint_level"], 1);
    assert_eq!(hint["hints_remaining"], 2);

    let session: Value = server
        .get(&format!("/sessions/{first_session}"))
        .await
        .json()
        .await
        .unwrap();
    let module: Value = server
        .get(&format!("/modules/{}", session["module_id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(
        module["exercises"][0]["hints"][0],
        "Think about short-term obligations."
    );

    let second_session: Value = server
        .post("/sessions", &json!({"module_id": module["id"]}))
        .await
        .json()
        .await
        .unwrap();
    let again: Value = server
        .post(
            &format!("/sessions/{}/hint", second_session["id"].as_str().unwrap()),
            &json!({"hint_level": 1}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["hint"], "Think about short-term obligations.");
}
