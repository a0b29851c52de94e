//! Property-based tests for the counting and sizing invariants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{report, Harness};
use proptest::prelude::*;
use sluice_flow::dataset::DatasetIdentifier;
use sluice_flow::fleet::replica_count;
use sluice_flow::gateway::Submission;
use sluice_flow::request::{FileOutcome, TransformStatus};

fn files(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("root://eos/prop/file_{i}.root"))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Counters never pass the file count, and the request completes
    /// exactly when enough reports arrived.
    #[test]
    fn counters_stay_within_file_count(
        file_count in 1usize..8,
        reports in prop::collection::vec((any::<bool>(), 0usize..8), 0..20),
    ) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let id = h
                .gateway
                .submit(Submission::for_files(files(file_count), "[jet_pt]"))
                .await
                .unwrap();
            let items = h.work_items(&id);
            prop_assert_eq!(items.len(), file_count);

            for (ok, index) in &reports {
                let item = &items[index % file_count];
                let outcome = if *ok { FileOutcome::Success } else { FileOutcome::Failure };
                h.gateway.file_complete(&id, report(item.file_id, outcome)).await.unwrap();

                let request = h.request(&id).await;
                prop_assert!(request.files_completed + request.files_failed <= request.files);
            }

            let request = h.request(&id).await;
            let done = reports.len() >= file_count;
            prop_assert_eq!(request.status == TransformStatus::Complete, done);
            prop_assert_eq!(h.shutdowns(), usize::from(done));
            Ok(())
        })?;
    }

    /// The same file list always resolves to the same dataset.
    #[test]
    fn file_list_resolution_is_stable(count in 1usize..6, repeats in 2usize..5) {
        tokio_test::block_on(async {
            let h = Harness::new();
            let identifier = DatasetIdentifier::FileList(files(count));
            let first = h.gateway.coordinator().resolve(&identifier).await.unwrap();
            prop_assert!(first.created());
            for _ in 1..repeats {
                let again = h.gateway.coordinator().resolve(&identifier).await.unwrap();
                prop_assert_eq!(again.id(), first.id());
                prop_assert!(!again.created());
            }
            prop_assert_eq!(h.store.dataset_count().unwrap(), 1);
            Ok(())
        })?;
    }

    #[test]
    fn replicas_are_bounded(workers in 0u32..64, files in 0i64..64) {
        let replicas = replica_count(workers, files);
        prop_assert!(replicas >= 1);
        prop_assert!(i64::from(replicas) <= files.max(1));
        prop_assert!(replicas <= workers.max(1));
    }
}
