//! HTTP routes served over a real listener.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{success, Harness};
use serde_json::{json, Value};
use sluice_flow::server::router;

async fn serve(h: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&h.gateway));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_responds() {
    let h = Harness::new();
    let base = serve(&h).await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn file_list_request_runs_to_completion_over_http() {
    let h = Harness::new();
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/transformation"))
        .json(&json!({
            "file_list": ["root://eos/http/a.root", "root://eos/http/b.root"],
            "selection": "[jet_pt]",
            "result_destination": "object-store",
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    let id_text = created["request_id"].as_str().unwrap().to_string();
    let id = id_text.parse().unwrap();

    let status: Value = client
        .get(format!("{base}/transformation/{id_text}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["files"], 2);
    assert_eq!(status["files_remaining"], 2);

    let deployment: Value = client
        .get(format!("{base}/transformation/{id_text}/deployment"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deployment["replicas"], 1);

    let items = h.work_items(&id);
    let mut outcomes = Vec::new();
    for item in &items {
        let body: Value = client
            .put(format!("{base}/internal/transformation/{id_text}/file-complete"))
            .json(&success(item))
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap()
            .json()
            .await
            .unwrap();
        outcomes.push(body);
    }
    assert_eq!(outcomes[0]["outcome"], "counted");
    assert_eq!(outcomes[0]["finalized"], false);
    assert_eq!(outcomes[1]["finalized"], true);

    let stats: Value = client
        .get(format!("{base}/transformation/{id_text}/statistics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_files"], 2);

    let conflict = client
        .post(format!("{base}/transformation/{id_text}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = conflict.json().await.unwrap();
    assert_eq!(body["code"], "CONFLICT");
    assert_eq!(body["request_id"], id_text.as_str());
}

#[tokio::test]
async fn cancel_over_http_then_conflict() {
    let h = Harness::new();
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/transformation"))
        .json(&json!({
            "did": "mc23:AOD.http",
            "selection": "[jet_pt]",
            "result_destination": "object-store",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["request_id"].as_str().unwrap().to_string();

    let canceled = client
        .post(format!("{base}/transformation/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(canceled.status(), reqwest::StatusCode::OK);
    let body: Value = canceled.json().await.unwrap();
    assert_eq!(body["status"], "canceled");

    let again = client
        .post(format!("{base}/transformation/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);
    assert_eq!(h.shutdowns(), 1);
}

#[tokio::test]
async fn resolver_callbacks_drive_a_lookup() {
    let h = Harness::new();
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{base}/transformation"))
        .json(&json!({
            "did": "rucio://mc23:AOD.callbacks",
            "selection": "[jet_pt]",
            "result_destination": "object-store",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["request_id"].as_str().unwrap().to_string();
    let dataset = h.dispatches().pop().unwrap().dataset_id;

    let stored: Value = client
        .put(format!("{base}/internal/dataset/{dataset}/files"))
        .json(&json!([
            { "paths": ["root://eos/cb/a.root"], "adler32": "abc", "file_size": 10, "file_events": 5 },
            { "paths": ["root://eos/cb/b.root"], "adler32": "def", "file_size": 10, "file_events": 5 },
        ]))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["files"], 2);

    client
        .put(format!("{base}/internal/dataset/{dataset}/complete"))
        .json(&json!({ "files": 2, "total_events": 10, "total_bytes": 20 }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let status: Value = client
        .get(format!("{base}/transformation/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["files"], 2);
}

#[tokio::test]
async fn client_errors_are_reported() {
    let h = Harness::new();
    let base = serve(&h).await;
    let client = reqwest::Client::new();

    let both = client
        .post(format!("{base}/transformation"))
        .json(&json!({
            "did": "mc23:AOD.1",
            "file_list": ["root://eos/x.root"],
            "selection": "[jet_pt]",
            "result_destination": "object-store",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(both.status(), reqwest::StatusCode::BAD_REQUEST);

    let unknown = client
        .get(format!(
            "{base}/transformation/{}",
            sluice_core::RequestId::generate()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    let malformed = client
        .get(format!("{base}/transformation/not-an-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    let missing_dataset = client
        .put(format!("{base}/internal/dataset/9999/complete"))
        .json(&json!({ "files": 0, "total_events": 0, "total_bytes": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_dataset.status(), reqwest::StatusCode::NOT_FOUND);
}
