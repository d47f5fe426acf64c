use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use sgw_core::guide::HttpMethod;
use sgw_core::{
    Config, GatewayClient, HttpTransport, RemoteDataInterface, RequestAuth, RequestBody,
    RequestState, Transport, TransportOutcome, TransportRequest,
};

fn segs(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn delivers_status_and_body_with_bearer_auth() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/files/v2/listings/system/data/home")
                .header("authorization", "Bearer tok");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"status":"success","result":[]}));
        })
        .await;

    let transport = HttpTransport::new(&server.base_url(), Duration::from_secs(5)).unwrap();
    let request = TransportRequest::new(
        HttpMethod::Get,
        segs(&["files", "v2", "listings", "system", "data", "home"]),
    )
    .with_auth(RequestAuth::Bearer("tok".into()));
    let outcome = transport.send(request).await;

    mock.assert_async().await;
    let TransportOutcome::Delivered { status, body } = outcome else {
        panic!("expected delivery, got {outcome:?}");
    };
    assert_eq!(status, 200);
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["status"], "success");
}

#[tokio::test]
async fn error_statuses_are_still_delivered() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/files/v2/media/system/data/a.txt")
                .body_contains("action=rename");
            then.status(500)
                .json_body(json!({"status":"error","message":"disk full"}));
        })
        .await;

    let transport = HttpTransport::new(&server.base_url(), Duration::from_secs(5)).unwrap();
    let request = TransportRequest::new(
        HttpMethod::Put,
        segs(&["files", "v2", "media", "system", "data", "a.txt"]),
    )
    .with_body(RequestBody::Form(vec![
        ("action".into(), "rename".into()),
        ("path".into(), "b.txt".into()),
    ]));
    let outcome = transport.send(request).await;
    assert!(matches!(outcome, TransportOutcome::Delivered { status: 500, .. }));
}

#[tokio::test]
async fn refused_connection_is_no_contact() {
    // Bind then release a port so nothing listens on it.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let transport =
        HttpTransport::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2)).unwrap();
    let outcome = transport
        .send(TransportRequest::new(HttpMethod::Get, segs(&["token"])))
        .await;
    assert!(matches!(outcome, TransportOutcome::NoContact { .. }));
}

#[tokio::test]
async fn facade_authenticates_and_lists_over_http() {
    let server = MockServer::start_async().await;
    let clients = server
        .mock_async(|when, then| {
            when.method(POST).path("/clients/v2");
            then.status(201).json_body(json!({
                "status": "success",
                "result": {"consumerKey": "ck", "consumerSecret": "cs"}
            }));
        })
        .await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=password");
            then.status(200)
                .json_body(json!({"access_token": "tok", "expires_in": 14400}));
        })
        .await;
    let listing = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/files/v2/listings/system/data")
                .header("authorization", "Bearer tok");
            then.status(200).json_body(json!({
                "status": "success",
                "result": [
                    {"name": "a.txt", "type": "file", "length": 10, "lastModified": "2020-05-01T10:00:00.000-05:00"},
                    {"name": "runs", "type": "dir", "length": 0}
                ]
            }));
        })
        .await;

    let mut cfg = Config::default();
    cfg.gateway.base_url = Some(server.base_url());
    cfg.gateway.storage_system = "data".into();
    let client = GatewayClient::connect(cfg).unwrap();

    let auth = client.authenticate("alice", "pw").unwrap().wait().await;
    assert!(auth.is_good(), "{auth:?}");
    clients.assert_async().await;
    token.assert_async().await;

    let done = client.list_directory("/").unwrap().wait().await;
    listing.assert_async().await;
    assert_eq!(done.state, RequestState::Good);
    let list = done.file_list().unwrap();
    assert_eq!(list.len(), 2);
    assert!(list[0].last_modified.is_some());
    assert!(list[1].is_dir());
}
