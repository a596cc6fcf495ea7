//! HTTP-level tests for the Gemini embedding backend.

#![cfg(feature = "gemini")]

use sncloud_core::{EmbeddingBackend, Error};
use sncloud_inference::{GeminiBackend, GeminiConfig};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EMBED_PATH: &str = "/v1beta/models/text-embedding-004:embedContent";

fn backend_for(server: &MockServer) -> GeminiBackend {
    GeminiBackend::new(GeminiConfig {
        base_url: server.uri(),
        api_key: Some("test-key".to_string()),
        timeout_seconds: 5,
        ..Default::default()
    })
    .expect("Failed to create backend")
}

#[tokio::test]
async fn test_embed_request_shape_and_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(EMBED_PATH))
        .and(query_param("key", "test-key"))
        .and(body_json(serde_json::json!({
            "content": { "parts": [ { "text": "meeting notes" } ] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embedding": { "values": [0.25, -0.5, 1.0] }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server);
    let vectors = backend
        .embed_texts(&["meeting notes".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors, vec![vec![0.25, -0.5, 1.0]]);
}

#[tokio::test]
async fn test_one_request_per_text() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(EMBED_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embedding": { "values": [0.1, 0.2] }
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server);
    let vectors = backend
        .embed_texts(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors.len(), 2);
}

#[tokio::test]
async fn test_error_status_maps_to_embedding_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(EMBED_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exhausted"))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server);
    let err = backend.embed_texts(&["x".to_string()]).await.unwrap_err();

    match err {
        Error::Embedding(msg) => {
            assert!(msg.contains("429"));
            assert!(msg.contains("quota exhausted"));
        }
        other => panic!("Expected Embedding error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_embedding_yields_empty_result() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(EMBED_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&mock_server)
        .await;

    let backend = backend_for(&mock_server);
    let vectors = backend.embed_texts(&["x".to_string()]).await.unwrap();

    assert!(vectors.is_empty());
}

#[tokio::test]
async fn test_unconfigured_backend_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let backend = GeminiBackend::new(GeminiConfig {
        base_url: mock_server.uri(),
        api_key: None,
        ..Default::default()
    })
    .unwrap();

    assert!(!backend.is_configured());
    assert!(matches!(
        backend.embed_texts(&["x".to_string()]).await,
        Err(Error::Config(_))
    ));
}
