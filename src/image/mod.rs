//! Image-level building blocks
//!
//! This module groups the pieces that describe an image independently of
//! where it is stored: digests and streaming verification ([`digest`]),
//! registry reference parsing ([`reference`]) and the manifest model
//! ([`manifest`]).

pub mod digest;
pub mod manifest;
pub mod reference;

pub use digest::{DigestAlgorithms, DigestUtils, DigestVerifyingReader};
pub use manifest::{Descriptor, ImageManifest, ManifestIndex, ParsedManifest, Platform};
pub use reference::DockerReference;
