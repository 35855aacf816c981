//! Registry module for Docker registry interactions
//!
//! This module provides authentication and client logic for the Docker
//! Registry HTTP API v2, plus the [`TagLister`] seam used when resolving
//! sync sources.

pub mod auth;
pub mod client;
pub mod tags;

pub use auth::{Auth, AuthChallenge, Authorization, TokenInfo};
pub use client::{BlobStream, ManifestResponse, RegistryClient, RegistryClientBuilder, RegistryClients};
pub use tags::{RegistryTagLister, RepositoryTags, TagLister};
