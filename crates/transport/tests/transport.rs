//! End-to-end tests for the transport send loop against a local mock server.

use httpmock::prelude::*;
use ocular_common::{AppOutput, Config, Error, RunningSession, SessionStartInfo};
use ocular_transport::{MatchWindowData, RenderingInfo, ResourceRef, ServerClient};
use std::sync::Arc;
use std::time::Duration;

fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.api_key = "test-key".to_string();
    config.server_url = server.base_url();
    config
}

fn start_info() -> SessionStartInfo {
    SessionStartInfo {
        app_id_or_name: "my app".to_string(),
        scenario_id_or_name: "my test".to_string(),
        ..Default::default()
    }
}

fn session() -> RunningSession {
    RunningSession {
        id: "sess-1".to_string(),
        is_new: false,
        url: None,
        batch_id: None,
        baseline_id: None,
        session_id: None,
    }
}

fn match_data() -> MatchWindowData {
    MatchWindowData {
        app_output: AppOutput::default(),
        ..Default::default()
    }
}

#[tokio::test]
async fn start_session_created_implies_new_baseline() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/sessions/running")
                .query_param("apiKey", "test-key");
            then.status(201)
                .json_body(serde_json::json!({"id": "sess-1", "url": "http://r/1"}));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let session = client.start_session(&start_info()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(session.id, "sess-1");
    assert!(session.is_new);
}

#[tokio::test]
async fn start_session_ok_keeps_existing_baseline() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(200)
                .json_body(serde_json::json!({"id": "sess-2", "isNew": false}));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let session = client.start_session(&start_info()).await.unwrap();
    assert!(!session.is_new);
}

#[tokio::test]
async fn long_request_polls_until_ok() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(202).header("location", &server.url("/poll/1"));
        })
        .await;
    let first_poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/poll/1");
            then.status(202).header("location", &server.url("/poll/2"));
        })
        .await;
    let second_poll = server
        .mock_async(|when, then| {
            when.method(GET).path("/poll/2");
            then.status(200)
                .json_body(serde_json::json!({"id": "sess-3", "isNew": true}));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let session = client.start_session(&start_info()).await.unwrap();

    first_poll.assert_async().await;
    second_poll.assert_async().await;
    assert_eq!(session.id, "sess-3");
    assert!(session.is_new);
}

#[tokio::test]
async fn long_request_created_takes_result_hop() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api/sessions/running/sess-1");
            then.status(202).header("location", &server.url("/poll/done"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/poll/done");
            then.status(201).header("location", &server.url("/result/done"));
        })
        .await;
    let result = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/result/done");
            then.status(200).json_body(serde_json::json!({
                "name": "my test",
                "appName": "my app",
                "status": "Passed",
                "matches": 1
            }));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let results = client
        .stop_session(&session(), false, false, false)
        .await
        .unwrap();

    result.assert_async().await;
    assert_eq!(results.matches, 1);
    assert!(results.is_passed());
}

#[tokio::test]
async fn long_request_gone_is_terminal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(202).header("location", &server.url("/poll/gone"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/poll/gone");
            then.status(410);
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let err = client.start_session(&start_info()).await.unwrap_err();
    assert!(matches!(err, Error::ServerGone));
}

#[tokio::test]
async fn unauthorized_fails_without_retry() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(401);
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let err = client.start_session(&start_info()).await.unwrap_err();

    assert!(matches!(err, Error::IncorrectApiKey));
    assert_eq!(mock.hits_async().await, 1);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(500);
        })
        .await;

    let client = Arc::new(ServerClient::new(test_config(&server)).unwrap());
    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_session(&start_info()).await })
    };

    // Swap in a healthy response while the client waits out the retry delay.
    tokio::time::sleep(Duration::from_millis(100)).await;
    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(200)
                .json_body(serde_json::json!({"id": "sess-4", "isNew": false}));
        })
        .await;

    let session = task.await.unwrap().unwrap();
    assert_eq!(session.id, "sess-4");
}

#[tokio::test]
async fn concurrency_block_backs_off_and_resubmits() {
    let server = MockServer::start_async().await;
    let blocked = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(503);
        })
        .await;

    let client = Arc::new(ServerClient::new(test_config(&server)).unwrap());
    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_session(&start_info()).await })
    };

    // First backoff step is two seconds; free a slot in the meantime.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let hits = blocked.hits_async().await;
    assert_eq!(hits, 1);
    blocked.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running");
            then.status(200)
                .json_body(serde_json::json!({"id": "sess-5", "isNew": false}));
        })
        .await;

    let session = task.await.unwrap().unwrap();
    assert_eq!(session.id, "sess-5");
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_last_status() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api/sessions/batches/b1/close/bypointerid");
            then.status(502);
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let err = client.delete_batch_sessions("b1").await.unwrap_err();

    assert!(matches!(err, Error::Request { .. }));
    // One initial attempt plus five retries.
    assert_eq!(mock.hits_async().await, 6);
}

#[tokio::test]
async fn match_and_close_falls_back_on_missing_endpoint() {
    let server = MockServer::start_async().await;
    let combined = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running/sess-1/matchandend");
            then.status(404);
        })
        .await;
    let plain_match = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running/sess-1");
            then.status(200)
                .json_body(serde_json::json!({"asExpected": true}));
        })
        .await;
    let stop = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api/sessions/running/sess-1");
            then.status(200).json_body(serde_json::json!({
                "name": "my test",
                "appName": "my app",
                "status": "Passed"
            }));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let results = client
        .match_window_and_close(&session(), &match_data())
        .await
        .unwrap();
    assert!(results.is_passed());
    combined.assert_async().await;

    // The missing endpoint is remembered; the second call skips the probe.
    client
        .match_window_and_close(&session(), &match_data())
        .await
        .unwrap();
    assert_eq!(combined.hits_async().await, 1);
    assert_eq!(plain_match.hits_async().await, 2);
    assert_eq!(stop.hits_async().await, 2);
}

#[tokio::test]
async fn match_and_close_uses_combined_endpoint_when_available() {
    let server = MockServer::start_async().await;
    let combined = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/sessions/running/sess-1/matchandend");
            then.status(200).json_body(serde_json::json!({
                "name": "my test",
                "appName": "my app",
                "status": "Unresolved",
                "isNew": false,
                "mismatches": 1
            }));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let results = client
        .match_window_and_close(&session(), &match_data())
        .await
        .unwrap();

    combined.assert_async().await;
    assert_eq!(results.mismatches, 1);
    assert!(!results.is_passed());
}

#[tokio::test]
async fn render_endpoints_carry_auth_token() {
    let server = MockServer::start_async().await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/resources/sha256/abc123")
                .header("x-auth-token", "render-token");
            then.status(200);
        })
        .await;
    let exists = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/resources/query/resources-exist/")
                .header("x-auth-token", "render-token");
            then.status(200).json_body(serde_json::json!([true, false]));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    client.set_rendering_info(RenderingInfo {
        service_url: server.base_url(),
        access_token: "render-token".to_string(),
        results_url: String::new(),
        stitching_service_url: None,
    });

    client
        .put_resource("abc123", "text/css", b"body{}".to_vec())
        .await
        .unwrap();
    let present = client
        .check_resources(&[ResourceRef::sha256("abc123", "text/css"), ResourceRef::sha256("def", "image/png")])
        .await
        .unwrap();

    put.assert_async().await;
    exists.assert_async().await;
    assert_eq!(present, vec![true, false]);
}

#[tokio::test]
async fn render_info_is_cached_after_first_fetch() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/sessions/renderinfo");
            then.status(200).json_body(serde_json::json!({
                "serviceUrl": "https://render.example",
                "accessToken": "tok",
                "resultsUrl": "https://results.example/__random__"
            }));
        })
        .await;

    let client = ServerClient::new(test_config(&server)).unwrap();
    let first = client.render_info().await.unwrap();
    let second = client.render_info().await.unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(first.service_url, second.service_url);
    assert_eq!(first.access_token, "tok");
}
