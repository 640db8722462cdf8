use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::ajam::{AjamError, MockTransport};
use crate::bus::BusConsumer;

fn app(mock: &Arc<MockTransport>) -> Router {
    let mut status = StatusAggregator::new();
    status.add_provider(Arc::new(BusConsumer::default()));
    let state = AppState::new(ActionDispatcher::new(mock.clone()), Arc::new(status));
    router(state, &CorsConfig::default())
}

async fn post(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_action_returns_results() {
    let mock = Arc::new(MockTransport::new().with_response(
        "Response: Success\r\nMessage: Result will follow\r\n\r\nEvent: DBGetResponse\r\nFamily: f\r\nKey: k\r\nVal: v\r\n\r\n",
    ));

    let (status, body) = post(app(&mock), "/action/DBGet", r#"{"Family": "f", "Key": "k"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"Response": "Success", "Message": "Result will follow"},
            {"Response": "Success", "Event": "DBGetResponse", "Family": "f", "Key": "k", "Val": "v"},
        ])
    );
    let params = &mock.calls()[0].params;
    assert!(params.contains(&("Family".to_string(), "f".to_string())));
}

#[tokio::test]
async fn test_action_with_empty_body() {
    let mock = Arc::new(MockTransport::new().with_response("Response: Success\r\nPing: Pong\r\n\r\n"));

    let (status, body) = post(app(&mock), "/action/Ping", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"Response": "Success", "Ping": "Pong"}]));
}

#[tokio::test]
async fn test_reserved_action_is_501() {
    let mock = Arc::new(MockTransport::new());

    let (status, body) = post(app(&mock), "/action/Queues", "{}").await;

    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error_id"], "not-supported");
    assert_eq!(body["details"]["action"], "Queues");
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_protocol_error_is_400() {
    let mock = Arc::new(
        MockTransport::new().with_response("Response: Error\r\nMessage: Action failed\r\n\r\n"),
    );

    let (status, body) = post(app(&mock), "/action/Originate", "{}").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("Action failed"));
}

#[tokio::test]
async fn test_unreachable_is_503() {
    let mock = Arc::new(MockTransport::new());
    mock.push_error(AjamError::Unreachable {
        url: "http://pbx:5039/rawman".to_string(),
        cause: "connection refused".to_string(),
    });

    let (status, body) = post(app(&mock), "/action/Ping", "{}").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_id"], "ajam-unreachable");
    assert_eq!(body["details"]["url"], "http://pbx:5039/rawman");
}

#[tokio::test]
async fn test_http_status_is_502() {
    let mock = Arc::new(MockTransport::new());
    mock.push_error(AjamError::HttpStatus {
        url: "http://pbx:5039/rawman".to_string(),
        status: 404,
    });

    let (status, body) = post(app(&mock), "/action/Ping", "{}").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["details"]["status"], 404);
}

#[tokio::test]
async fn test_invalid_json_is_400() {
    let mock = Arc::new(MockTransport::new());

    let (status, body) = post(app(&mock), "/action/Ping", "{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_id"], "invalid-data");
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_command_endpoint() {
    let mock = Arc::new(MockTransport::new().with_response(
        "Response: Follows\r\nPrivilege: Command\r\nSystem uptime: 5 minutes\r\n--END COMMAND--\r\n\r\n",
    ));

    let (status, body) = post(
        app(&mock),
        "/action/Command",
        r#"{"command": "core show uptime"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"response": ["System uptime: 5 minutes"]}));
}

#[tokio::test]
async fn test_command_without_command_field_is_400() {
    let mock = Arc::new(MockTransport::new());

    let (status, _) = post(app(&mock), "/action/command", "{}").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_status_endpoint() {
    let mock = Arc::new(MockTransport::new());
    let request = Request::builder()
        .uri("/status")
        .body(Body::empty())
        .unwrap();

    let response = app(&mock).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"bus_consumer": {"status": "fail"}}));
}

#[test]
fn test_rest_config_defaults() {
    let config = RestApiConfig::default();
    assert_eq!(config.address(), "0.0.0.0:9491");
    assert!(config.cors.enabled);
}
