mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use candle_chatbot::api::ChatService;
use candle_chatbot::config::ServerConfig;
use candle_chatbot::openai::openai_server::{build_router, SESSION_HEADER};
use candle_chatbot::openai::responses::GenerationOutcome;
use candle_chatbot::state::model_manager::ModelLifecycleManager;
use common::{CountingBackend, MockEngine, MockLoader};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn service(engine: MockEngine) -> ChatService {
    service_with(engine, &ServerConfig::default())
}

fn service_with(engine: MockEngine, config: &ServerConfig) -> ChatService {
    ChatService::with_loader(
        Box::new(MockLoader::new(engine)),
        Arc::new(CountingBackend::new()),
        config,
    )
}

fn slow_engine(delay: Duration) -> MockEngine {
    let mut engine = MockEngine::new("hello<end_of_turn>");
    engine.on_generate = Some(Arc::new(move || std::thread::sleep(delay)));
    engine
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn chat_request(session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json");
    if let Some(session) = session {
        builder = builder.header(SESSION_HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_router(service(MockEngine::new("hello<end_of_turn>")));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["is_loaded"], false);
    assert_eq!(body["data"]["device"], "mock:0");
    assert_eq!(body["data"]["model_name"], "mock/gemma");
    assert_eq!(body["data"]["memory"]["reserved_mb"], 1024.0);
}

#[tokio::test]
async fn test_chat_without_message_is_rejected() {
    let app = build_router(service(MockEngine::new("hello<end_of_turn>")));
    let response = app.oneshot(chat_request(None, json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key(SESSION_HEADER));
    let body = body_json(response).await;
    assert_eq!(body, json!({"status": "error", "message": "No message provided"}));
}

#[tokio::test]
async fn test_chat_success_records_history() {
    let service = service(MockEngine::new("hello<end_of_turn>"));
    let app = build_router(service.clone());

    let response = app
        .oneshot(chat_request(Some("session-1"), json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SESSION_HEADER], "session-1");
    let body = body_json(response).await;
    assert_eq!(body, json!({"status": "success", "response": "hello"}));

    let history = service.sessions().history("session-1").unwrap();
    assert_eq!(history.len(), 2);
    assert!(service.registry().is_empty());
    assert!(service.manager().is_loaded());
}

#[tokio::test]
async fn test_unavailable_model_returns_error() {
    let config = ServerConfig::default();
    let manager = ModelLifecycleManager::unavailable(
        "no token",
        Box::new(MockLoader::new(MockEngine::new("hello"))),
        Arc::new(CountingBackend::new()),
    );
    let service = ChatService::with_manager(Arc::new(manager), &config);
    let app = build_router(service);

    let response = app
        .oneshot(chat_request(None, json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body, json!({"status": "error", "message": "Failed to load the model"}));
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_chat() {
    let service = service(slow_engine(Duration::from_millis(300)));
    let app = build_router(service.clone());

    let request = tokio::spawn(app.oneshot(chat_request(Some("s"), json!({"message": "hi"}))));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.registry().len(), 1);
    assert_eq!(service.shutdown().request_shutdown(), 1);

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 499);
    let body = body_json(response).await;
    assert_eq!(body["status"], "aborted");
    assert!(service.registry().is_empty());
    assert!(service.sessions().history("s").unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_request_is_signalled_and_unregistered() {
    let service = service(slow_engine(Duration::from_millis(200)));

    let chat = {
        let service = service.clone();
        tokio::spawn(async move { service.chat("s", "hi".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.registry().len(), 1);

    chat.abort();
    let _ = chat.await;
    assert!(service.registry().is_empty());

    // the worker finishes on its own and discards the result
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(service.sessions().history("s").unwrap().is_empty());
}

#[tokio::test]
async fn test_anonymous_sessions_stay_bounded() {
    let config = ServerConfig {
        max_sessions: 8,
        ..Default::default()
    };
    let service = service_with(MockEngine::new("hello<end_of_turn>"), &config);
    let app = build_router(service.clone());

    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(chat_request(None, json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(service.sessions().len(), 8);
}

#[tokio::test]
async fn test_chat_returns_outcome() {
    let service = service(MockEngine::new("rest a day<end_of_turn>"));
    let outcome = service.chat("s", "should I rest?".to_string()).await.unwrap();
    assert_eq!(
        outcome,
        GenerationOutcome::Success {
            response: "rest a day".to_string()
        }
    );
}
