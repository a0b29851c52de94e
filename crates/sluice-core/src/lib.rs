//! # sluice-core
//!
//! Core primitives shared by every sluice component.
//!
//! This crate provides:
//!
//! - **Identifiers**: Strongly-typed IDs for transform requests, datasets and files
//! - **Error Types**: Shared error definitions and result alias
//! - **Observability**: Logging initialization and span helpers
//! - **Retry**: Explicit bounded retry with exponential backoff and jitter
//! - **Dataset identifiers**: Parsing of scheme-qualified DIDs
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::prelude::*;
//!
//! let request_id = RequestId::generate();
//! let did = Did::parse("rucio://mc23:AOD.12345", "rucio");
//! assert_eq!(did.resolver_queue(), "rucio_did_requests");
//! # let _ = request_id;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod did;
pub mod error;
pub mod id;
pub mod observability;
pub mod retry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::did::Did;
    pub use crate::error::{Error, Result};
    pub use crate::id::{DatasetId, FileId, RequestId};
    pub use crate::retry::{retry_with_backoff, RetryPolicy};
}

pub use did::Did;
pub use error::{Error, Result};
pub use id::{DatasetId, FileId, RequestId};
pub use observability::{dataset_span, init_logging, request_span, LogFormat};
pub use retry::{retry_with_backoff, RetryPolicy};
