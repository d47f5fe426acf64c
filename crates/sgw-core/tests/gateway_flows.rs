use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sgw_core::guide::HttpMethod;
use sgw_core::test_support::ScriptedTransport;
use sgw_core::{
    topics, Config, DispatchError, GatewayClient, LongRunningState, RemoteDataInterface,
    ReplyPayload, RequestAuth, RequestBody, RequestState, TaskParams,
};

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.gateway.storage_system = "data".into();
    cfg.gateway.home_dir = "/home/alice".into();
    cfg
}

async fn authed(transport: &ScriptedTransport) -> GatewayClient {
    let client = GatewayClient::new(config(), Arc::new(transport.clone()));
    transport.push_json(
        201,
        json!({"status":"success","result":{"consumerKey":"ck","consumerSecret":"cs"}}),
    );
    transport.push_json(
        200,
        json!({"access_token":"tok","refresh_token":"ref","expires_in":14400}),
    );
    let done = client.authenticate("alice", "pw").unwrap().wait().await;
    assert!(done.is_good(), "{done:?}");
    client
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn authentication_registers_client_then_fetches_token() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path(), "/clients/v2");
    assert_eq!(requests[0].method, HttpMethod::Post);
    assert!(matches!(&requests[0].auth, RequestAuth::Basic { user, .. } if user == "alice"));
    assert!(requests[0]
        .form_value("clientName")
        .unwrap()
        .starts_with("sgw-"));

    assert_eq!(requests[1].path(), "/token");
    assert_eq!(
        requests[1].auth,
        RequestAuth::Basic {
            user: "ck".into(),
            password: "cs".into()
        }
    );
    assert_eq!(requests[1].form_value("grant_type"), Some("password"));
    assert_eq!(requests[1].form_value("username"), Some("alice"));
    assert_eq!(requests[1].form_value("scope"), Some("PRODUCTION"));

    assert!(client.is_authenticated());
    assert_eq!(client.session_snapshot()["refreshable"], true);
}

#[tokio::test]
async fn rejected_registration_fails_the_visible_reply() {
    let transport = ScriptedTransport::new();
    transport.push_json(401, json!({"status":"error","message":"Invalid credentials"}));
    let client = GatewayClient::new(config(), Arc::new(transport.clone()));

    let done = within(client.authenticate("alice", "nope").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert_eq!(done.error_text.as_deref(), Some("Invalid credentials"));
    assert_eq!(transport.request_count(), 1);
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn token_without_access_token_fails() {
    let transport = ScriptedTransport::new();
    transport.push_json(
        201,
        json!({"status":"success","result":{"consumerKey":"ck","consumerSecret":"cs"}}),
    );
    transport.push_json(400, json!({"error":"invalid_grant","error_description":"bad password"}));
    let client = GatewayClient::new(config(), Arc::new(transport.clone()));

    let done = within(client.authenticate("alice", "pw").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert_eq!(done.error_text.as_deref(), Some("bad password"));
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn bearer_operations_need_a_session() {
    let client = GatewayClient::new(config(), Arc::new(ScriptedTransport::new()));
    assert_eq!(
        client.list_directory("/").unwrap_err(),
        DispatchError::NotAuthenticated
    );
}

#[test]
fn dispatch_outside_a_runtime_is_a_local_error() {
    let client = GatewayClient::new(config(), Arc::new(ScriptedTransport::new()));
    assert_eq!(
        client.authenticate("alice", "pw").unwrap_err(),
        DispatchError::NoRuntime
    );
}

#[tokio::test]
async fn listing_resolves_relative_paths_and_decodes_entries() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(
        200,
        json!({"status":"success","result":[{"name":"a.txt","type":"file","length":10}]}),
    );

    let done = within(client.list_directory("runs/../inbox").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Good);
    let list = done.file_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "a.txt");
    assert_eq!(list[0].size, 10);
    assert_eq!(list[0].path, "/home/alice/inbox/a.txt");

    let request = transport.requests().pop().unwrap();
    assert_eq!(
        request.path(),
        "/files/v2/listings/system/data/home/alice/inbox"
    );
    assert_eq!(request.auth, RequestAuth::Bearer("tok".into()));
}

#[tokio::test]
async fn unreachable_service_is_no_connect() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_no_contact("connection refused");

    let done = within(client.list_directory("/").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::NoConnect);
    assert_eq!(done.payload, ReplyPayload::None);
    assert_eq!(done.error_text.as_deref(), Some("connection refused"));
}

#[tokio::test]
async fn service_error_is_fail_with_its_message() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(404, json!({"status":"error","message":"not found"}));

    let done = within(client.list_directory("/missing").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert_eq!(done.error_text.as_deref(), Some("not found"));
}

#[tokio::test]
async fn listing_entry_without_length_fails_whole_reply() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(
        200,
        json!({"status":"success","result":[{"name":"a.txt","type":"file"}]}),
    );

    let done = within(client.list_directory("/").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert!(done.file_list().is_none());
}

#[tokio::test]
async fn working_directory_changes_only_after_confirmation() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;

    transport.push_json(404, json!({"status":"error","message":"no such directory"}));
    let failed = within(client.set_current_working_directory("ghost").unwrap().wait()).await;
    assert_eq!(failed.state, RequestState::Fail);
    assert_eq!(client.current_working_directory(), "/home/alice");

    transport.push_json(
        200,
        json!({"status":"success","result":[{"name":".","type":"dir","length":0,"path":"/home/alice/runs"}]}),
    );
    let done = within(client.set_current_working_directory("runs").unwrap().wait()).await;
    assert!(done.is_good());
    assert_eq!(done.current_dir(), Some("/home/alice/runs"));
    assert_eq!(client.current_working_directory(), "/home/alice/runs");
}

#[tokio::test]
async fn working_directory_refuses_plain_files() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(
        200,
        json!({"status":"success","result":[{"name":"notes.txt","type":"file","length":4,"path":"/home/alice/notes.txt"}]}),
    );
    let done = within(client.set_current_working_directory("notes.txt").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert_eq!(client.current_working_directory(), "/home/alice");
}

#[tokio::test]
async fn mutations_send_actions_and_describe_the_result() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;

    transport.push_json(200, json!({"status":"success","result":{"name":"b.txt"}}));
    let renamed = within(client.rename_entry("a.txt", "b.txt").unwrap().wait()).await;
    assert_eq!(renamed.file().unwrap().path, "/home/alice/b.txt");
    let request = transport.requests().pop().unwrap();
    assert_eq!(request.method, HttpMethod::Put);
    assert_eq!(request.path(), "/files/v2/media/system/data/home/alice/a.txt");
    assert_eq!(request.form_value("action"), Some("rename"));
    assert_eq!(request.form_value("path"), Some("b.txt"));

    transport.push_json(201, json!({"status":"success","result":{}}));
    let made = within(client.make_directory("/scratch", "out").unwrap().wait()).await;
    let meta = made.file().unwrap();
    assert!(meta.is_dir());
    assert_eq!(meta.path, "/scratch/out");
    let request = transport.requests().pop().unwrap();
    assert_eq!(request.path(), "/files/v2/media/system/data/scratch");
    assert_eq!(request.form_value("action"), Some("mkdir"));

    transport.push_json(200, json!({"status":"success","result":{}}));
    within(client.copy_entry("b.txt", "/backup/b.txt").unwrap().wait()).await;
    let request = transport.requests().pop().unwrap();
    assert_eq!(request.form_value("action"), Some("copy"));
    assert_eq!(request.form_value("path"), Some("/backup/b.txt"));

    assert!(matches!(
        client.rename_entry("b.txt", "x/y"),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.delete_entry("/"),
        Err(DispatchError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn uploads_read_local_file_at_send_time() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("input.dat");
    std::fs::write(&local, b"payload").unwrap();

    assert!(matches!(
        client.upload_file("/in", dir.path().join("missing").to_str().unwrap()),
        Err(DispatchError::LocalFile(_))
    ));

    transport.push_json(200, json!({"status":"success","result":{"length":7}}));
    let done = within(client.upload_file("/in", local.to_str().unwrap()).unwrap().wait()).await;
    let meta = done.file().unwrap();
    assert_eq!(meta.path, "/in/input.dat");
    assert_eq!(meta.size, 7);

    let request = transport.requests().pop().unwrap();
    assert_eq!(request.path(), "/files/v2/media/system/data/in");
    match request.body {
        RequestBody::Multipart {
            field,
            file_name,
            bytes,
        } => {
            assert_eq!(field, "fileToUpload");
            assert_eq!(file_name, "input.dat");
            assert_eq!(bytes, b"payload");
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[tokio::test]
async fn buffer_upload_targets_parent_directory() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(200, json!({"status":"success","result":{}}));
    let done = within(client.upload_buffer("notes/today.md", b"# hi".to_vec()).unwrap().wait()).await;
    assert_eq!(done.file().unwrap().path, "/home/alice/notes/today.md");
    let request = transport.requests().pop().unwrap();
    assert_eq!(request.path(), "/files/v2/media/system/data/home/alice/notes");
}

#[tokio::test]
async fn downloads_land_on_disk_or_in_memory() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("copy.bin");

    transport.push(sgw_core::TransportOutcome::Delivered {
        status: 200,
        body: b"raw bytes".to_vec(),
    });
    let done = within(client.download_file(dest.to_str().unwrap(), "/data/x.bin").unwrap().wait()).await;
    assert!(done.is_good(), "{done:?}");
    assert_eq!(std::fs::read(&dest).unwrap(), b"raw bytes");

    transport.push(sgw_core::TransportOutcome::Delivered {
        status: 200,
        body: vec![0, 1, 2],
    });
    let done = within(client.download_buffer("/data/x.bin").unwrap().wait()).await;
    assert_eq!(done.buffer(), Some(&[0u8, 1, 2][..]));

    transport.push_json(404, json!({"status":"error","message":"missing"}));
    let missing = dir.path().join("never.bin");
    let done = within(client.download_file(missing.to_str().unwrap(), "/nope").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert!(!missing.exists());
}

#[tokio::test]
async fn download_write_failure_is_fail() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("no-such-dir").join("out.bin");
    transport.push(sgw_core::TransportOutcome::Delivered {
        status: 200,
        body: b"data".to_vec(),
    });
    let done = within(client.download_file(dest.to_str().unwrap(), "/x").unwrap().wait()).await;
    assert_eq!(done.state, RequestState::Fail);
    assert!(done.error_text.unwrap().contains("writing"));
}

async fn submit(client: &GatewayClient, transport: &ScriptedTransport, status: &str) -> Arc<sgw_core::RemoteReply> {
    transport.push_json(
        201,
        json!({"status":"success","result":{"id":"job-42","status":status}}),
    );
    let params = TaskParams::new()
        .with("mesh", "fine")
        .with("probe", "p1")
        .with("probe", "p2");
    let reply = client.run_job("openfoam-6", params, "runs/case1").unwrap();
    within(reply.wait()).await;
    reply
}

#[tokio::test]
async fn job_submission_tracks_a_pending_task() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let mut events = client.subscribe_events();

    let reply = submit(&client, &transport, "ACCEPTED").await;
    let done = reply.completion().unwrap();
    assert!(done.is_good());
    assert_eq!(done.job().unwrap()["result"]["id"], "job-42");

    let request = transport.requests().pop().unwrap();
    assert_eq!(request.path(), "/jobs/v2");
    let RequestBody::Json(body) = &request.body else {
        panic!("job submission must be JSON");
    };
    assert_eq!(body["appId"], "openfoam-6");
    assert!(body["name"].as_str().unwrap().starts_with("openfoam-6-"));
    assert_eq!(body["archive"], true);
    assert_eq!(body["parameters"]["mesh"], "fine");
    assert_eq!(body["parameters"]["probe"], json!(["p1", "p2"]));
    assert_eq!(
        body["inputs"]["inputDirectory"],
        "agave://data/home/alice/runs/case1"
    );

    let task = reply.long_running_ref(true).unwrap();
    assert_eq!(task.id(), "job-42");
    assert!(matches!(
        task.state(),
        LongRunningState::Pending | LongRunningState::Running
    ));
    assert!(reply.task_params().is_none());
    assert_eq!(task.task_params().unwrap().get_all("probe"), ["p1", "p2"]);

    let again = reply.long_running_ref(true).unwrap();
    assert!(Arc::ptr_eq(&task, &again));
    assert!(Arc::ptr_eq(&task, &client.long_task_by_ref("job-42").unwrap()));
    assert_eq!(client.list_of_long_tasks().len(), 1);

    let mut kinds = Vec::new();
    while let Ok(env) = events.try_recv() {
        kinds.push(env.kind);
    }
    assert!(kinds.iter().any(|k| k == topics::TOPIC_LONG_TASKS_UPDATED));
    assert!(kinds.iter().any(|k| k == topics::TOPIC_TASK_STATE_CHANGED));
    assert!(kinds.iter().any(|k| k == topics::TOPIC_REPLY_COMPLETED));
}

#[tokio::test]
async fn refresh_moves_tasks_forward_only() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let reply = submit(&client, &transport, "QUEUED").await;
    let task = reply.long_running_ref(true).unwrap();
    let mut changes = task.subscribe();

    transport.push_json(200, json!({"status":"success","result":{"id":"job-42","status":"RUNNING"}}));
    client.force_refresh_of_long_tasks();
    let change = within(changes.recv()).await.unwrap();
    assert_eq!(change.old, LongRunningState::Pending);
    assert_eq!(change.new, LongRunningState::Running);
    let poll = transport.requests().pop().unwrap();
    assert_eq!(poll.method, HttpMethod::Get);
    assert_eq!(poll.path(), "/jobs/v2/job-42");

    let before = transport.request_count();
    transport.push_json(200, json!({"status":"success","result":{"id":"job-42","status":"QUEUED"}}));
    client.force_refresh_of_long_tasks();
    within(transport.wait_for_requests(before + 1)).await;
    tokio::task::yield_now().await;
    assert_eq!(task.state(), LongRunningState::Running);

    transport.push_json(200, json!({"status":"success","result":{"id":"job-42","status":"FINISHED"}}));
    client.force_refresh_of_long_tasks();
    let change = within(changes.recv()).await.unwrap();
    assert_eq!(change.new, LongRunningState::Done);

    // Settled tasks are no longer polled.
    let before = transport.request_count();
    client.force_refresh_of_long_tasks();
    tokio::task::yield_now().await;
    assert_eq!(transport.request_count(), before);
}

#[tokio::test]
async fn cancel_stops_the_remote_job_and_ignores_late_status() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let reply = submit(&client, &transport, "RUNNING").await;
    let task = reply.long_running_ref(true).unwrap();

    let before = transport.request_count();
    transport.push_json(200, json!({"status":"success","result":{"id":"job-42","status":"STOPPED"}}));
    assert!(task.cancel_task());
    assert_eq!(task.state(), LongRunningState::Error);
    within(transport.wait_for_requests(before + 1)).await;
    let stop = transport.requests().pop().unwrap();
    assert_eq!(stop.method, HttpMethod::Post);
    assert_eq!(stop.path(), "/jobs/v2/job-42");
    assert_eq!(stop.form_value("action"), Some("stop"));

    assert!(!task.cancel_task());
    assert!(!task.observe_remote(Some("FINISHED"), json!({})));
    assert_eq!(task.state(), LongRunningState::Error);
}

#[tokio::test]
async fn purge_releases_the_task_and_deletes_the_record() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let reply = submit(&client, &transport, "FAILED").await;
    let task = reply.long_running_ref(true).unwrap();
    assert_eq!(task.state(), LongRunningState::Error);

    let before = transport.request_count();
    transport.push_json(200, json!({"status":"success","result":{}}));
    assert!(task.purge_task_data());
    assert_eq!(task.state(), LongRunningState::Purging);
    assert!(task.raw_data().is_none());
    assert!(task.task_params().is_none());
    assert!(client.long_task_by_ref("job-42").is_none());

    within(transport.wait_for_requests(before + 1)).await;
    let delete = transport.requests().pop().unwrap();
    assert_eq!(delete.method, HttpMethod::Delete);
    assert_eq!(delete.path(), "/jobs/v2/job-42");
}

#[tokio::test]
async fn unclaimed_finished_task_is_released_locally_with_its_reply() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let reply = submit(&client, &transport, "FINISHED").await;
    assert!(reply.owns_long_running_cleanup());
    let task = reply.long_running_ref(false).unwrap();
    let before = transport.request_count();

    drop(reply);
    assert!(client.long_task_by_ref("job-42").is_none());
    assert_eq!(task.state(), LongRunningState::Purging);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.request_count(), before);
    assert!(transport
        .requests()
        .iter()
        .all(|r| r.method != HttpMethod::Delete));
}

#[tokio::test]
async fn unclaimed_running_task_outlives_its_reply() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    let reply = submit(&client, &transport, "RUNNING").await;
    drop(reply);
    assert_eq!(
        client.long_task_by_ref("job-42").unwrap().state(),
        LongRunningState::Running
    );
}

#[tokio::test]
async fn job_name_is_required() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    assert!(matches!(
        client.run_job("  ", TaskParams::new(), "/"),
        Err(DispatchError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn close_revokes_and_forgets_credentials() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push(sgw_core::TransportOutcome::Delivered {
        status: 200,
        body: Vec::new(),
    });

    let done = within(client.close_all_connections().unwrap().wait()).await;
    assert!(done.is_good());
    assert!(!client.is_authenticated());
    let revoke = transport.requests().pop().unwrap();
    assert_eq!(revoke.path(), "/revoke");
    assert_eq!(revoke.form_value("token"), Some("tok"));

    let before = transport.request_count();
    let done = within(client.close_all_connections().unwrap().wait()).await;
    assert!(done.is_good());
    assert_eq!(transport.request_count(), before);
}

#[tokio::test]
async fn callbacks_fire_once_per_reply() {
    let transport = ScriptedTransport::new();
    let client = authed(&transport).await;
    transport.push_json(200, json!({"status":"success","result":[]}));
    let reply = client.list_directory("/").unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    reply.on_complete(move |done| {
        let _ = tx.send(done.state);
    });
    assert_eq!(within(rx).await.unwrap(), RequestState::Good);
}
