mod test_harness;

use std::io::Read;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use partyflow::api::{router, ApiState};
use partyflow::scheduler::{PartyRef, Status, StatusKey};
use test_harness::{job_dsl, runtime_conf, test_controller};

/// Create a test app over a fresh guest-2 controller
async fn create_test_app() -> (Router, ApiState, TempDir) {
    let (controller, dir) = test_controller(2).await;
    let state = ApiState { controller };
    (router(state.clone()), state, dir)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, bytes) = send(app, request).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn submission() -> Value {
    json!({
        "job_dsl": job_dsl(&["reader_0"]),
        "job_runtime_conf": runtime_conf(("guest", 2), &[("host", 1), ("guest", 2)]),
    })
}

async fn submit(app: &Router) -> String {
    let (status, body) = post(app, "/submit", submission()).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_submit_returns_envelope_with_paths() {
    let (app, _state, _dir) = create_test_app().await;

    let (status, body) = post(&app, "/submit", submission()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
    assert_eq!(body["retmsg"], "success");
    let job_id = body["job_id"].as_str().unwrap();
    assert_eq!(body["data"]["job_id"], job_id);
    assert!(body["data"]["job_dsl_path"]
        .as_str()
        .unwrap()
        .ends_with("job_dsl.json"));
    assert!(body["data"]["job_runtime_conf_path"]
        .as_str()
        .unwrap()
        .ends_with("job_runtime_conf.json"));
    assert_eq!(body["data"]["model_info"]["model_key"], "guest-2#model");
}

#[tokio::test]
async fn test_submit_without_initiator_is_invalid_spec() {
    let (app, _state, _dir) = create_test_app().await;

    let (status, body) = post(
        &app,
        "/submit",
        json!({"job_dsl": job_dsl(&["reader_0"]), "job_runtime_conf": {"role": {"guest": [2]}}}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retcode"], 102);
}

#[tokio::test]
async fn test_malformed_json_is_invalid_spec() {
    let (app, _state, _dir) = create_test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, bytes) = send(&app, request).await;
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retcode"], 102);
}

#[tokio::test]
async fn test_query_unknown_job_is_not_found() {
    let (app, _state, _dir) = create_test_app().await;

    let (status, body) = post(&app, "/query", json!({"job_id": "nope"})).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retcode"], 101);
    assert_eq!(body["retmsg"], "Not found: find job failed");
}

#[tokio::test]
async fn test_query_returns_one_row_per_party() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    let (status, body) = post(&app, "/query", json!({"job_id": job_id})).await;

    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row["status"], "waiting");
        assert_eq!(row["dsl"], job_dsl(&["reader_0"]));
    }
}

#[tokio::test]
async fn test_create_twice_is_idempotent() {
    let (app, state, _dir) = create_test_app().await;
    let uri = "/j-remote/host/1/create";
    let body = json!({
        "dsl": job_dsl(&["reader_0"]),
        "runtime_conf": runtime_conf(("guest", 2), &[("host", 1), ("guest", 2)]),
        "initiator": {"role": "guest", "party_id": 2},
    });

    let (status, first) = post(&app, uri, body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["retcode"], 0);

    let key = StatusKey::job("j-remote", PartyRef::new("host", 1));
    state
        .controller
        .registry()
        .set_status(&key, Status::Running, Default::default())
        .await
        .unwrap();

    let (status, second) = post(&app, uri, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["retcode"], 0);
    assert_eq!(
        state.controller.registry().get_status(&key).await.unwrap(),
        Status::Running
    );
    assert!(state.controller.catalog().contains("j-remote").await);
}

#[tokio::test]
async fn test_job_status_route_reports_invalid_transition() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    let (status, body) = post(
        &app,
        &format!("/{}/guest/2/status", job_id),
        json!({"status": "success"}),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["retcode"], 103);
}

#[tokio::test]
async fn test_bad_party_id_is_invalid_spec() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    for party_id in ["0", "guest", "-1"] {
        let (status, body) = post(
            &app,
            &format!("/{}/guest/{}/status", job_id, party_id),
            json!({"status": "running"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "party_id {}", party_id);
        assert_eq!(body["retcode"], 102);
    }
}

#[tokio::test]
async fn test_task_routes_drive_job_to_success() {
    let (app, state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    for party in ["guest/2", "host/1"] {
        let (_, body) = post(&app, &format!("/{}/{}/status", job_id, party), json!({"status": "running"})).await;
        assert_eq!(body["retcode"], 0, "{}", body);
        let (_, body) = post(&app, &format!("/{}/reader_0/t0/{}/run", job_id, party), json!({})).await;
        assert_eq!(body["retcode"], 0, "{}", body);
    }

    let task = StatusKey::task(&job_id, "reader_0", "t0", PartyRef::new("guest", 2));
    let record = state.controller.registry().get(&task).await.unwrap();
    assert_eq!(record.status, Status::Running);
    assert_eq!(
        record.info["request_url_without_host"],
        format!("{}/reader_0/t0/guest/2/run", job_id)
    );

    for party in ["guest/2", "host/1"] {
        let (_, body) = post(
            &app,
            &format!("/{}/reader_0/t0/{}/status", job_id, party),
            json!({"status": "success"}),
        )
        .await;
        assert_eq!(body["retcode"], 0, "{}", body);
    }

    let (_, body) = post(&app, "/query", json!({"job_id": job_id, "role": "guest"})).await;
    assert_eq!(body["data"][0]["status"], "success");
}

#[tokio::test]
async fn test_kill_with_empty_initiator_is_unauthorized() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    let (status, body) = post(
        &app,
        &format!("/{}/guest/2/kill", job_id),
        json!({"job_initiator": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["retcode"], 105);

    let (status, body) = post(
        &app,
        &format!("/{}/guest/2/kill", job_id),
        json!({"job_initiator": {"role": "guest", "party_id": 2}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
}

#[tokio::test]
async fn test_clean_running_job_is_invalid_state() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    let (status, body) = post(&app, &format!("/{}/guest/2/clean", job_id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["retcode"], 104);

    let (_, body) = post(&app, "/stop", json!({"job_id": job_id})).await;
    assert_eq!(body["retcode"], 0);
    let (status, body) = post(&app, &format!("/{}/guest/2/clean", job_id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
}

#[tokio::test]
async fn test_save_pipeline_decodes_model_id() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;
    let model_id = URL_SAFE.encode("guest-2#model");

    let (status, body) = post(
        &app,
        &format!("/{}/guest/2/{}/save/pipeline", job_id, model_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, body) = post(
        &app,
        &format!("/{}/guest/2/@@@/save/pipeline", job_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retcode"], 102);
}

#[tokio::test]
async fn test_config_returns_spec_and_model_info() {
    let (app, _state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;

    let (status, body) = post(&app, "/config", json!({"job_id": job_id})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["job_id"], job_id.as_str());
    assert_eq!(body["data"]["dsl"], job_dsl(&["reader_0"]));
    assert_eq!(body["data"]["model_info"]["model_version"], job_id.as_str());
}

#[tokio::test]
async fn test_log_download_is_gzipped_tarball() {
    let (app, state, _dir) = create_test_app().await;
    let job_id = submit(&app).await;
    let party_dir = state
        .controller
        .logs()
        .party_dir(&job_id, &PartyRef::new("guest", 2))
        .unwrap();
    std::fs::create_dir_all(&party_dir).unwrap();
    std::fs::write(party_dir.join("INFO.log"), "task started\n").unwrap();

    let request = Request::builder()
        .method("GET")
        .uri(format!("/log?job_id={}", job_id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/gzip"
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("job_{}_log.tar.gz", job_id)));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
    let mut found = false;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "guest/2/INFO.log" {
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            assert_eq!(content, "task started\n");
            found = true;
        }
    }
    assert!(found, "INFO.log should be in the archive");
}

#[tokio::test]
async fn test_log_for_unknown_job_is_not_found_envelope() {
    let (app, _state, _dir) = create_test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/log?job_id=missing")
        .body(Body::empty())
        .unwrap();

    let (status, bytes) = send(&app, request).await;
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retcode"], 101);
}

#[tokio::test]
async fn test_dot_segments_never_reach_the_data_dir() {
    let (app, state, dir) = create_test_app().await;
    std::fs::write(dir.path().join("secret.txt"), "keep out\n").unwrap();

    let (status, body) = post(
        &app,
        "/%2E%2E/guest/2/create",
        json!({
            "dsl": job_dsl(&["reader_0"]),
            "runtime_conf": runtime_conf(("guest", 2), &[("guest", 2)]),
            "initiator": {"role": "guest", "party_id": 2},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
    assert_eq!(body["retcode"], 102);
    assert!(!dir.path().join("job_dsl.json").exists());
    assert!(!state.controller.catalog().contains("..").await);

    for uri in ["/log?job_id=..", "/log?job_id=%2E%2E", "/log?job_id=."] {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = send(&app, request).await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["retcode"], 102);
    }

    let job_id = submit(&app).await;
    for uri in [
        format!("/{}/%2E%2E/2/clean", job_id),
        format!("/{}/%2E%2E/t0/guest/2/run", job_id),
        format!("/{}/reader_0/a%2Fb/guest/2/status", job_id),
        format!("/{}/guest/2/{}/save/pipeline", job_id, URL_SAFE.encode("..")),
    ] {
        let (status, body) = post(&app, &uri, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}: {}", uri, body);
        assert_eq!(body["retcode"], 102);
    }
    assert!(dir.path().join("secret.txt").exists());
}

#[tokio::test]
async fn test_unknown_route_is_not_routed() {
    let (app, _state, _dir) = create_test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/a/b/c/d/e/f/g")
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
