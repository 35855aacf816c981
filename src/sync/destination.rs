//! Destination reference for each synced image

use crate::error::{Result, ResultExt, SyncError};
use crate::image::DockerReference;
use crate::transport::{DestinationTransport, ImageReference};
use std::path::{Path, PathBuf};

/// The name an image is stored under, relative to the destination base
///
/// Registry images use their full reference (`registry.example.com/team/busybox:latest`),
/// directory images their path below the walked base directory. Unscoped
/// suffixes keep only the last component.
pub fn destination_suffix(source: &ImageReference, dir_base: Option<&Path>, scoped: bool) -> String {
    let suffix = match source {
        ImageReference::Docker(reference) => reference.to_string(),
        ImageReference::Dir(path) => dir_suffix(path, dir_base),
    };

    if scoped {
        suffix
    } else {
        last_component(&suffix).to_string()
    }
}

fn dir_suffix(path: &Path, dir_base: Option<&Path>) -> String {
    let Some(base) = dir_base else {
        return path.display().to_string();
    };
    let relative = path.strip_prefix(base).unwrap_or(path);
    let relative = relative.display().to_string();
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        // the base directory is itself the image
        base.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| base.display().to_string())
    } else {
        relative.to_string()
    }
}

fn last_component(suffix: &str) -> &str {
    let trimmed = suffix.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Build the destination reference for `source`
///
/// Directory destinations must not exist yet; creating them is left to the
/// caller once this check has passed.
pub fn build_destination(
    source: &ImageReference,
    dir_base: Option<&Path>,
    destination_base: &str,
    transport: DestinationTransport,
    scoped: bool,
) -> Result<ImageReference> {
    let suffix = destination_suffix(source, dir_base, scoped);
    let joined = join(destination_base, &suffix);

    match transport {
        DestinationTransport::Docker => {
            let reference = DockerReference::parse_normalized(&joined).with_context(|| {
                format!("Cannot obtain a valid image reference for transport \"docker\" and reference {:?}", joined)
            })?;
            Ok(ImageReference::Docker(reference))
        }
        DestinationTransport::Dir => {
            let path = PathBuf::from(&joined);
            match std::fs::symlink_metadata(&path) {
                Ok(_) => Err(SyncError::DestinationExists(path)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ImageReference::Dir(path)),
                Err(err) => Err(SyncError::Io(err).context(format!("Checking destination {}", joined))),
            }
        }
    }
}

fn join(base: &str, suffix: &str) -> String {
    let suffix = suffix.trim_start_matches('/');
    if base.is_empty() {
        return suffix.to_string();
    }
    let base = match base.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    if base == "/" {
        format!("/{}", suffix)
    } else {
        format!("{}/{}", base, suffix)
    }
}
