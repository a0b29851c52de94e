//! End-to-end request lifecycle through the gateway, on in-memory backends.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{lookup_summary, report, success, Harness, NAMESPACE};
use sluice_flow::broker::memory::BrokerOp;
use sluice_flow::broker::BrokerError;
use sluice_flow::cluster::memory::ClusterOp;
use sluice_flow::cluster::ClusterError;
use sluice_flow::dataset::DatasetStatus;
use sluice_flow::error::Error;
use sluice_flow::fleet::{fleet_name, generated_code_name};
use sluice_flow::gateway::Submission;
use sluice_flow::request::{FileOutcome, ResultFormat, TransformStatus};
use sluice_flow::store::Store;
use sluice_flow::topology::{error_queue_name, work_queue_name};
use sluice_flow::tracker::FileCompletion;

fn files(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("root://eos/user/file_{i}.root"))
        .collect()
}

#[tokio::test]
async fn new_dataset_dispatches_one_lookup() {
    let h = Harness::new();
    let mut submission = Submission::for_did("mc23:AOD.12345", "[jet_pt]");
    submission.workers = 4;

    let id = h.gateway.submit(submission).await.unwrap();

    let request = h.request(&id).await;
    assert_eq!(request.status, TransformStatus::Lookup);
    assert_eq!(request.did, "rucio://mc23:AOD.12345");
    assert_eq!(request.result_format, ResultFormat::Arrow);
    assert_eq!(h.dataset(request.did_id).await.lookup_status, DatasetStatus::Looking);

    let dispatches = h.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].dataset_id, request.did_id);
    assert_eq!(dispatches[0].name, "mc23:AOD.12345");

    // Nothing is published yet, so the fleet starts with one replica.
    let deployment = h.cluster.deployment(NAMESPACE, &fleet_name(&id)).unwrap();
    assert_eq!(deployment.replicas, 1);
    assert!(h.broker.queue_exists(&work_queue_name(&id)));
    assert!(h.broker.queue_exists(&error_queue_name(&id)));
}

#[tokio::test]
async fn second_submission_waits_for_the_running_lookup() {
    let h = Harness::new();
    let first = h
        .gateway
        .submit(Submission::for_did("rucio://mc23:AOD.1", "[jet_pt]"))
        .await
        .unwrap();
    let second = h
        .gateway
        .submit(Submission::for_did("rucio://mc23:AOD.1", "[met]"))
        .await
        .unwrap();

    assert_eq!(h.request(&first).await.status, TransformStatus::Lookup);
    assert_eq!(h.request(&second).await.status, TransformStatus::PendingLookup);
    assert_eq!(h.dispatches().len(), 1);
    assert_eq!(h.store.dataset_count().unwrap(), 1);
}

#[tokio::test]
async fn empty_dataset_fails_every_waiting_request() {
    let h = Harness::new();
    let first = h
        .gateway
        .submit(Submission::for_did("mc23:empty", "[jet_pt]"))
        .await
        .unwrap();
    let second = h
        .gateway
        .submit(Submission::for_did("mc23:empty", "[jet_pt]"))
        .await
        .unwrap();
    let dataset = h.request(&first).await.did_id;

    h.resolve_dataset(dataset, 0).await;

    for id in [first, second] {
        let request = h.request(&id).await;
        assert_eq!(request.status, TransformStatus::Fatal);
        assert!(request.finish_time.is_some());
        assert!(!h.has_fleet(&id));
        assert!(!h.broker.queue_exists(&work_queue_name(&id)));
    }
    assert_eq!(h.shutdowns(), 2);
    assert_eq!(h.dataset(dataset).await.lookup_status, DatasetStatus::Complete);
}

#[tokio::test]
async fn resolver_error_is_reported_on_the_request() {
    let h = Harness::new();
    let id = h
        .gateway
        .submit(Submission::for_did("mc23:missing", "[jet_pt]"))
        .await
        .unwrap();
    let dataset = h.request(&id).await.did_id;

    h.gateway
        .lookup_complete(dataset, lookup_summary(0, Some("DID not found in rucio")))
        .await
        .unwrap();

    let request = h.request(&id).await;
    assert_eq!(request.status, TransformStatus::Fatal);
    assert!(request
        .failure_description
        .unwrap()
        .contains("DID not found in rucio"));
}

#[tokio::test]
async fn last_report_completes_the_request_once() {
    let h = Harness::new();
    let id = h
        .gateway
        .submit(Submission::for_did("mc23:AOD.3", "[jet_pt]"))
        .await
        .unwrap();
    let dataset = h.request(&id).await.did_id;
    h.resolve_dataset(dataset, 3).await;

    let request = h.request(&id).await;
    assert_eq!(request.status, TransformStatus::Running);
    assert_eq!(request.files, 3);
    let items = h.work_items(&id);
    assert_eq!(items.len(), 3);

    for item in &items[..2] {
        let outcome = h.gateway.file_complete(&id, success(item)).await.unwrap();
        assert_eq!(outcome, FileCompletion::Counted { finalized: false });
    }
    let view = h.gateway.status(&id).await.unwrap();
    assert_eq!(view.files_remaining, Some(1));

    let last = h
        .gateway
        .file_complete(&id, report(items[2].file_id, FileOutcome::Failure))
        .await
        .unwrap();
    assert_eq!(last, FileCompletion::Counted { finalized: true });

    let done = h.request(&id).await;
    assert_eq!(done.status, TransformStatus::Complete);
    assert_eq!((done.files_completed, done.files_failed), (2, 1));
    assert!(done.finish_time.is_some());
    assert_eq!(h.shutdowns(), 1);
    assert!(!h.has_fleet(&id));
    let deleted = h.broker.deleted_queues();
    assert!(deleted.contains(&work_queue_name(&id)));
    assert!(deleted.contains(&error_queue_name(&id)));
    assert!(h
        .cluster
        .config_map(NAMESPACE, &generated_code_name(&id))
        .is_none());

    let stats = h.gateway.statistics(&id).await.unwrap().unwrap();
    assert_eq!(stats.total_files, 3);
    assert_eq!(stats.total_events, 3000);
}

#[tokio::test]
async fn cancel_tears_down_once_and_then_conflicts() {
    let h = Harness::new();
    let id = h
        .gateway
        .submit(Submission::for_files(files(2), "[jet_pt]"))
        .await
        .unwrap();
    assert_eq!(h.request(&id).await.status, TransformStatus::Running);
    let items = h.work_items(&id);

    let canceled = h.gateway.cancel(&id).await.unwrap();
    assert_eq!(canceled.status, TransformStatus::Canceled);
    assert!(canceled.finish_time.is_some());
    assert_eq!(h.shutdowns(), 1);
    assert!(!h.has_fleet(&id));

    let err = h.gateway.cancel(&id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyTerminal { .. }));
    assert_eq!(h.shutdowns(), 1);

    // A worker that was mid-file reports after the cancel.
    let late = h.gateway.file_complete(&id, success(&items[0])).await.unwrap();
    assert_eq!(late, FileCompletion::IgnoredTerminal(TransformStatus::Canceled));
    assert_eq!(h.request(&id).await.files_completed, 0);
}

#[tokio::test]
async fn cancel_of_unknown_request_is_not_found() {
    let h = Harness::new();
    let err = h
        .gateway
        .cancel(&sluice_core::RequestId::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestNotFound { .. }));
}

#[tokio::test]
async fn file_list_fleet_is_sized_by_file_count() {
    let h = Harness::new();
    let mut submission = Submission::for_files(files(2), "[jet_pt]");
    submission.workers = 5;
    let id = h.gateway.submit(submission).await.unwrap();

    let deployment = h.cluster.deployment(NAMESPACE, &fleet_name(&id)).unwrap();
    assert_eq!(deployment.replicas, 2);
    assert_eq!(h.work_items(&id).len(), 2);

    let status = h.gateway.fleet_status(&id).await.unwrap().unwrap();
    assert_eq!(status.replicas, 2);
}

#[tokio::test]
async fn identical_file_lists_share_one_dataset() {
    let h = Harness::new();
    let first = h
        .gateway
        .submit(Submission::for_files(files(3), "[jet_pt]"))
        .await
        .unwrap();
    let second = h
        .gateway
        .submit(Submission::for_files(files(3), "[met]"))
        .await
        .unwrap();
    assert_eq!(h.request(&first).await.did_id, h.request(&second).await.did_id);
    assert_eq!(h.store.dataset_count().unwrap(), 1);
    assert!(h.dispatches().is_empty());
}

#[tokio::test]
async fn invalid_submission_creates_nothing() {
    let h = Harness::new();
    let mut submission = Submission::for_did("mc23:AOD.1", "[jet_pt]");
    submission.file_list = Some(files(1));

    let err = h.gateway.submit(submission).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(h.store.dataset_count().unwrap(), 0);
    assert_eq!(h.cluster.object_count(), 0);
    assert_eq!(h.broker.calls(BrokerOp::DeclareQueue), 0);
}

#[tokio::test]
async fn missing_image_is_a_validation_error() {
    let config = sluice_flow::config::OrchestratorConfig {
        default_image: None,
        ..common::test_config()
    };
    let h = Harness::with_config(config);
    let err = h
        .gateway
        .submit(Submission::for_files(files(1), "[jet_pt]"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[tokio::test]
async fn topology_failure_leaves_no_request_behind() {
    let h = Harness::new();
    h.broker.inject(
        BrokerOp::Bind,
        [BrokerError::Channel {
            code: 404,
            reason: "NOT_FOUND - no exchange".into(),
        }],
    );

    let err = h
        .gateway
        .submit(Submission::for_files(files(1), "[jet_pt]"))
        .await
        .unwrap_err();
    let id = err.request_id().unwrap();

    assert!(h.store.get_request(&id).await.unwrap().is_none());
    assert!(!h.broker.queue_exists(&work_queue_name(&id)));
    assert!(!h.broker.queue_exists(&error_queue_name(&id)));
    assert_eq!(h.cluster.object_count(), 0);
}

#[tokio::test]
async fn fleet_start_failure_marks_the_request_fatal() {
    let h = Harness::new();
    h.cluster.inject(
        ClusterOp::CreateDeployment,
        [ClusterError::Api {
            status: 422,
            message: "invalid image reference".into(),
        }],
    );

    let err = h
        .gateway
        .submit(Submission::for_files(files(2), "[jet_pt]"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cluster { .. }));
    let id = err.request_id().unwrap();

    let request = h.request(&id).await;
    assert_eq!(request.status, TransformStatus::Fatal);
    assert!(request
        .failure_description
        .unwrap()
        .contains("worker fleet could not be started"));
    assert!(h
        .cluster
        .config_map(NAMESPACE, &generated_code_name(&id))
        .is_none());
    assert!(!h.broker.queue_exists(&work_queue_name(&id)));
}

#[tokio::test]
async fn submission_against_known_empty_dataset_never_starts_a_fleet() {
    let h = Harness::new();
    let first = h
        .gateway
        .submit(Submission::for_did("mc23:empty", "[jet_pt]"))
        .await
        .unwrap();
    h.resolve_dataset(h.request(&first).await.did_id, 0).await;
    assert_eq!(h.cluster.calls(ClusterOp::CreateDeployment), 1);

    let second = h
        .gateway
        .submit(Submission::for_did("mc23:empty", "[jet_pt]"))
        .await
        .unwrap();
    let request = h.request(&second).await;
    assert_eq!(request.status, TransformStatus::Fatal);
    assert_eq!(h.cluster.calls(ClusterOp::CreateDeployment), 1);
    assert!(!h.broker.queue_exists(&work_queue_name(&second)));
}

#[tokio::test]
async fn complete_dataset_is_published_at_submission() {
    let h = Harness::new();
    let first = h
        .gateway
        .submit(Submission::for_did("mc23:AOD.9", "[jet_pt]"))
        .await
        .unwrap();
    h.resolve_dataset(h.request(&first).await.did_id, 4).await;

    let second = h
        .gateway
        .submit(Submission::for_did("mc23:AOD.9", "[met]"))
        .await
        .unwrap();
    let request = h.request(&second).await;
    assert_eq!(request.status, TransformStatus::Running);
    assert_eq!(request.files, 4);
    assert_eq!(h.work_items(&second).len(), 4);
    // No second lookup for a resolved dataset.
    assert_eq!(h.dispatches().len(), 1);
}

#[tokio::test]
async fn progressive_discovery_completes_only_after_lookup() {
    let h = Harness::new();
    let id = h
        .gateway
        .submit(Submission::for_did("mc23:stream", "[jet_pt]"))
        .await
        .unwrap();
    let dataset = h.request(&id).await.did_id;

    h.gateway
        .files_discovered(
            dataset,
            sluice_flow::messages::FilesDiscovered::One(
                sluice_flow::dataset::NewDatasetFile::from_path("root://eos/file_0.root"),
            ),
        )
        .await
        .unwrap();
    let items = h.work_items(&id);
    assert_eq!(items.len(), 1);

    let outcome = h.gateway.file_complete(&id, success(&items[0])).await.unwrap();
    assert_eq!(outcome, FileCompletion::Counted { finalized: false });
    assert_eq!(h.request(&id).await.status, TransformStatus::Lookup);
    assert_eq!(h.shutdowns(), 0);

    h.gateway
        .lookup_complete(dataset, lookup_summary(1, None))
        .await
        .unwrap();
    assert_eq!(h.request(&id).await.status, TransformStatus::Complete);
    assert_eq!(h.shutdowns(), 1);
}

#[tokio::test]
async fn statistics_are_empty_before_the_first_report() {
    let h = Harness::new();
    let id = h
        .gateway
        .submit(Submission::for_files(files(1), "[jet_pt]"))
        .await
        .unwrap();
    assert!(h.gateway.statistics(&id).await.unwrap().is_none());
}
