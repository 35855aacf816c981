//! Command line interface module
//!
//! Argument parsing for the `sync`, `copy` and `list-tags` commands and the
//! runner that wires configuration, logging, cancellation and the registry
//! collaborators together.

pub mod args;
pub mod runner;

pub use args::{Args, Command, CopyArgs, ImageOptions, ListTagsArgs, SyncArgs};
pub use runner::Runner;
