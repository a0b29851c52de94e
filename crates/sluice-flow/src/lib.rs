//! # sluice-flow
//!
//! Orchestration core for transform requests.
//!
//! A client names a dataset (or lists files) and a selection; sluice resolves
//! the dataset through an external resolver, runs a per-request worker fleet
//! on the cluster and counts worker reports until the request finishes.
//!
//! - **Dataset resolution**: one dataset row and one resolver lookup per
//!   name, however many submissions race on it
//! - **Queue topology**: per-request work and error queues with
//!   reconnect-and-retry publishing
//! - **Fleet lifecycle**: deterministic cluster object names, idempotent
//!   best-effort teardown
//! - **Completion tracking**: storage-side counters and compare-and-swap
//!   transitions, so each request finishes exactly once
//!
//! ## Guarantees
//!
//! - `files_completed + files_failed <= files` for every request
//! - a terminal status is reached once and never left
//! - the fleet is torn down by the caller that won the terminal transition
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sluice_flow::broker::memory::InMemoryBroker;
//! use sluice_flow::cluster::memory::InMemoryCluster;
//! use sluice_flow::codegen::StaticCodeGenerator;
//! use sluice_flow::prelude::*;
//! use sluice_flow::store::memory::InMemoryStore;
//!
//! # async fn demo() -> Result<()> {
//! let config = OrchestratorConfig {
//!     default_image: Some("sluice/transformer:latest".into()),
//!     ..OrchestratorConfig::default()
//! };
//! let gateway = RequestGateway::new(
//!     config,
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(InMemoryCluster::new()),
//!     Arc::new(StaticCodeGenerator::default()),
//! );
//!
//! let id = gateway
//!     .submit(Submission::for_did("rucio://mc23:AOD.12345", "[jet_pt]"))
//!     .await?;
//! assert_eq!(gateway.status(&id).await?.request.status, TransformStatus::Lookup);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod cluster;
pub mod codegen;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod messages;
pub mod metrics;
pub mod request;
pub mod resolution;
pub mod server;
pub mod store;
pub mod topology;
pub mod tracker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::broker::{BrokerChannel, BrokerError};
    pub use crate::cluster::{ClusterApi, ClusterError};
    pub use crate::codegen::{CodeGenerator, GeneratedCode};
    pub use crate::config::{FleetConfig, OrchestratorConfig};
    pub use crate::dataset::{Dataset, DatasetIdentifier, DatasetStatus};
    pub use crate::error::{Error, Result};
    pub use crate::fleet::{FleetLifecycleManager, ShutdownReport};
    pub use crate::gateway::{RequestGateway, Submission};
    pub use crate::metrics::FlowMetrics;
    pub use crate::request::{TransformRequest, TransformStatus};
    pub use crate::resolution::DatasetResolutionCoordinator;
    pub use crate::store::{CasResult, Store};
    pub use crate::topology::QueueTopologyManager;
    pub use crate::tracker::{CompletionTracker, FileCompletion};
}
