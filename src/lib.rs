//! Docker Image Sync Library
//!
//! Copies container images between registries and local `dir` layouts.
//! A sync job resolves its source (a repository, a directory tree or a YAML
//! list of registries) into concrete images, then copies them one at a time
//! with retries for transient failures and digest verification of every blob.

pub mod cli;
pub mod config;
pub mod context;
pub mod copier;
pub mod error;
pub mod image;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod sync;
pub mod transport;

pub use config::SyncConfig;
pub use context::OperationContext;
pub use copier::{CopyOptions, ImageCopier};
pub use error::{Result, SyncError};
pub use logging::Logger;
pub use registry::TagLister;
pub use sync::{SyncJob, SyncPhase, SyncSummary, Syncer};
pub use transport::{AuthContext, ImageReference};
