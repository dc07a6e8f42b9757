// Integration tests for per-workload webhooks
//
// These tests verify that label-configured webhooks issue exactly the
// expected HTTP request, with the configured method and auth

mod common;

use common::{webhook_labels, workload};
use crosswind::labels::keys;
use crosswind::models::{ImageReference, UpdateOutcome};
use crosswind::webhook::{WebhookDispatcher, WebhookStatus};
use mockito::Matcher;
use serde_json::json;
use std::collections::BTreeMap;

fn outcome(labels: BTreeMap<String, String>) -> UpdateOutcome {
    let mut web = workload("deadbeef", "web", "nginx@sha256:AAA");
    web.labels = labels;
    let previous = web.image.clone();
    UpdateOutcome::updated(web, previous, ImageReference::parse("nginx@sha256:BBB"))
}

#[tokio::test]
async fn test_post_webhook_sends_update_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({
            "service_name": "web",
            "service_id": "deadbeef-0000-4000-8000-web",
            "service_short_id": "deadbeef0000",
            "namespace": "default",
            "old_image": "nginx@sha256:AAA",
            "new_image": "nginx@sha256:BBB",
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dispatcher = WebhookDispatcher::new().unwrap();
    let status = dispatcher
        .trigger(&outcome(webhook_labels(&format!("{}/hook", server.url()), &[])))
        .await;

    assert_eq!(status, WebhookStatus::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_get_webhook_from_label() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/deploy")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let labels = webhook_labels(
        &format!("{}/deploy", server.url()),
        &[(keys::HTTP_METHOD, "get")],
    );
    let status = WebhookDispatcher::new().unwrap().trigger(&outcome(labels)).await;

    assert_eq!(status, WebhookStatus::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_invalid_url_makes_no_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    // Host and port of the mock server, but no scheme.
    let without_scheme = server.host_with_port();
    let status = WebhookDispatcher::new()
        .unwrap()
        .trigger(&outcome(webhook_labels(&without_scheme, &[])))
        .await;

    assert_eq!(status, WebhookStatus::Skipped);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_no_labels_is_skipped() {
    let status = WebhookDispatcher::new()
        .unwrap()
        .trigger(&outcome(BTreeMap::new()))
        .await;
    assert_eq!(status, WebhookStatus::Skipped);
}

#[tokio::test]
async fn test_basic_auth_header() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        // base64("user:pass")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let labels = webhook_labels(
        &format!("{}/hook", server.url()),
        &[(keys::BASIC_USERNAME, "user"), (keys::BASIC_PASSWORD, "pass")],
    );
    let status = WebhookDispatcher::new().unwrap().trigger(&outcome(labels)).await;

    assert_eq!(status, WebhookStatus::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_token_header() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        .match_header("x-api-key", "Bearer abc123")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let labels = webhook_labels(
        &format!("{}/hook", server.url()),
        &[
            (keys::TOKEN_HEADER, "X-Api-Key"),
            (keys::TOKEN_TYPE, "Bearer"),
            (keys::TOKEN_TOKEN, "abc123"),
        ],
    );
    let status = WebhookDispatcher::new().unwrap().trigger(&outcome(labels)).await;

    assert_eq!(status, WebhookStatus::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_basic_auth_wins_over_conflicting_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let labels = webhook_labels(
        &format!("{}/hook", server.url()),
        &[
            (keys::BASIC_USERNAME, "user"),
            (keys::BASIC_PASSWORD, "pass"),
            (keys::TOKEN_TOKEN, "abc123"),
        ],
    );
    let status = WebhookDispatcher::new().unwrap().trigger(&outcome(labels)).await;

    assert_eq!(status, WebhookStatus::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_error_status_is_reported_as_failed() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        .with_status(503)
        .with_body("x".repeat(500))
        .expect(1)
        .create_async()
        .await;

    let status = WebhookDispatcher::new()
        .unwrap()
        .trigger(&outcome(webhook_labels(&format!("{}/hook", server.url()), &[])))
        .await;

    assert_eq!(status, WebhookStatus::Failed);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_host_is_reported_as_failed() {
    // Port 9 (discard) on localhost is not expected to accept connections.
    let status = WebhookDispatcher::new()
        .unwrap()
        .trigger(&outcome(webhook_labels("http://127.0.0.1:9/hook", &[])))
        .await;

    assert_eq!(status, WebhookStatus::Failed);
}
