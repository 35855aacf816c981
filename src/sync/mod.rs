//! The `sync` command: resolve a source into images, then copy each one

pub mod destination;
pub mod job;
pub mod orchestrator;
pub mod source;

pub use destination::{build_destination, destination_suffix};
pub use job::SyncJob;
pub use orchestrator::{SyncPhase, SyncSummary, Syncer};
pub use source::{RepositoryDescriptor, SourceConfig, SourceResolver, load_source_config};
