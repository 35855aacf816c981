//! Built-in copier between registries and `dir` images
//!
//! Copies one single-platform image: the manifest byte-for-byte, and every
//! blob it references once per digest. Manifest lists are resolved to the
//! configured platform first. Each blob streams through a
//! [`DigestVerifyingReader`] so corrupted content never completes a copy.

use crate::context::OperationContext;
use crate::copier::dir::DirImage;
use crate::copier::{CopyOptions, ImageCopier};
use crate::error::{Result, SyncError, find_digest_mismatch};
use crate::image::digest::verification_error;
use crate::image::{Descriptor, DigestUtils, DigestVerifyingReader, DockerReference, ParsedManifest, Platform};
use crate::logging::Logger;
use crate::registry::{BlobStream, RegistryClient, RegistryClients};
use crate::transport::{AuthContext, ImageReference};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One side of a copy
enum Location {
    Registry {
        client: Arc<RegistryClient>,
        reference: DockerReference,
    },
    Dir(DirImage),
}

impl Location {
    fn describe(&self) -> String {
        match self {
            Location::Registry { reference, .. } => format!("docker://{}", reference),
            Location::Dir(image) => format!("dir:{}", image.path().display()),
        }
    }
}

#[derive(Clone)]
pub struct DistributionCopier {
    clients: RegistryClients,
    logger: Logger,
    platform: Platform,
}

impl DistributionCopier {
    pub fn new(logger: Logger, platform: Platform) -> Self {
        Self::with_clients(RegistryClients::new(logger.clone()), logger, platform)
    }

    pub fn with_clients(clients: RegistryClients, logger: Logger, platform: Platform) -> Self {
        Self {
            clients,
            logger,
            platform,
        }
    }

    fn locate(&self, reference: &ImageReference, auth: &Arc<AuthContext>) -> Result<Location> {
        match reference {
            ImageReference::Docker(docker) => Ok(Location::Registry {
                client: self.clients.get(docker.domain(), auth)?,
                reference: docker.tag_name_only(),
            }),
            ImageReference::Dir(path) => Ok(Location::Dir(DirImage::new(path))),
        }
    }

    /// Fetch the single-image manifest to copy, resolving manifest lists
    async fn fetch_manifest(
        &self,
        ctx: &OperationContext,
        source: &Location,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let (client, reference) = match source {
            Location::Dir(image) => return Ok((image.read_manifest().await?, None)),
            Location::Registry { client, reference } => (client, reference),
        };

        let response = client
            .get_manifest(ctx, reference.path(), reference.manifest_reference())
            .await?;
        let index = match ParsedManifest::parse(&response.bytes, response.content_type.as_deref())? {
            ParsedManifest::Image(_) => return Ok((response.bytes, response.content_type)),
            ParsedManifest::Index(index) => index,
        };

        let entry = index.select(&self.platform).ok_or_else(|| {
            SyncError::Validation(format!(
                "no image found in manifest list for platform {} in {}",
                self.platform, reference
            ))
        })?;
        self.logger.verbose(&format!(
            "Selected manifest {} for platform {}",
            DigestUtils::format_digest_short(&entry.digest),
            self.platform
        ));

        let child = client.get_manifest(ctx, reference.path(), &entry.digest).await?;
        if entry.digest.starts_with("sha256:") {
            let actual = DigestUtils::compute_docker_digest(&child.bytes);
            if actual != entry.digest {
                return Err(SyncError::DigestMismatch {
                    expected: entry.digest.clone(),
                    actual,
                });
            }
        }
        Ok((child.bytes, child.content_type.or_else(|| entry.media_type.clone())))
    }

    async fn open_blob(
        &self,
        ctx: &OperationContext,
        source: &Location,
        blob: &Descriptor,
    ) -> Result<BlobStream> {
        match source {
            Location::Registry { client, reference } => {
                client.get_blob(ctx, reference.path(), &blob.digest).await
            }
            Location::Dir(image) => image.open_blob(&blob.digest).await,
        }
    }

    async fn has_blob(&self, ctx: &OperationContext, destination: &Location, digest: &str) -> Result<bool> {
        match destination {
            Location::Registry { client, reference } => {
                client.blob_exists(ctx, reference.path(), digest).await
            }
            Location::Dir(image) => image.has_blob(digest).await,
        }
    }

    async fn copy_blob(
        &self,
        ctx: &OperationContext,
        source: &Location,
        destination: &Location,
        blob: &Descriptor,
    ) -> Result<()> {
        let short = DigestUtils::format_digest_short(&blob.digest);
        if self.has_blob(ctx, destination, &blob.digest).await? {
            self.logger
                .detail(&format!("Skipping blob {} (already present)", short));
            return Ok(());
        }

        self.logger.step(&format!(
            "Copying blob {} ({})",
            short,
            self.logger.format_size(blob.size)
        ));
        let content = self.open_blob(ctx, source, blob).await?;
        let failure = Arc::new(AtomicBool::new(false));
        let mut verified = DigestVerifyingReader::new(content, &blob.digest, failure.clone())?;
        let expected = verified.expected_digest().to_string();

        let result = match destination {
            Location::Registry { client, reference } => {
                client
                    .push_blob(ctx, reference.path(), &blob.digest, blob.size, Box::pin(verified))
                    .await
            }
            Location::Dir(image) => image
                .write_blob(&blob.digest, &mut verified)
                .await
                .map(|_| ())
                .map_err(verification_error),
        };

        if failure.load(Ordering::SeqCst) {
            let mismatch = result
                .as_ref()
                .err()
                .and_then(|err| find_digest_mismatch(err))
                .unwrap_or_else(|| SyncError::DigestMismatch {
                    expected,
                    actual: "unverified content".to_string(),
                });
            return Err(mismatch);
        }
        result
    }

    async fn write_manifest(
        &self,
        ctx: &OperationContext,
        destination: &Location,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        self.logger.step("Writing manifest to image destination");
        match destination {
            Location::Registry { client, reference } => {
                let target = match reference.tag() {
                    Some(tag) => tag.to_string(),
                    None => DigestUtils::compute_docker_digest(&bytes),
                };
                client
                    .put_manifest(ctx, reference.path(), &target, bytes, media_type)
                    .await
            }
            Location::Dir(image) => image.write_manifest(&bytes).await,
        }
    }

    async fn copy_image(
        &self,
        ctx: &OperationContext,
        source: &Location,
        destination: &Location,
        options: &CopyOptions,
    ) -> Result<()> {
        self.logger.detail(&format!(
            "Copying {} to {}",
            source.describe(),
            destination.describe()
        ));

        let (bytes, content_type) = self.fetch_manifest(ctx, source).await?;
        let parsed = ParsedManifest::parse(&bytes, content_type.as_deref())?;
        let media_type = parsed.media_type(content_type.as_deref());
        let manifest = match parsed {
            ParsedManifest::Image(manifest) => manifest,
            ParsedManifest::Index(_) => {
                return Err(SyncError::NotImplemented(format!(
                    "copying manifest lists stored in {}",
                    source.describe()
                )));
            }
        };

        if let Location::Dir(image) = destination {
            image.initialize().await?;
        }

        let blobs = manifest.blobs();
        self.logger.detail(&format!(
            "Copying {} blobs ({})",
            blobs.len(),
            self.logger.format_size(manifest.total_size())
        ));
        for blob in blobs {
            self.copy_blob(ctx, source, destination, blob).await?;
        }

        if options.remove_signatures {
            self.logger.detail("Removing signatures");
        }
        self.write_manifest(ctx, destination, bytes, &media_type).await
    }
}

#[async_trait]
impl ImageCopier for DistributionCopier {
    fn validate_options(&self, options: &CopyOptions) -> Result<()> {
        if options.sign_by.is_some() {
            return Err(SyncError::NotImplemented(
                "signing images with --sign-by".to_string(),
            ));
        }
        Ok(())
    }

    async fn copy(
        &self,
        ctx: &OperationContext,
        source: &ImageReference,
        destination: &ImageReference,
        options: &CopyOptions,
    ) -> Result<()> {
        let source = self.locate(source, &options.source_auth)?;
        let destination = self.locate(destination, &options.destination_auth)?;
        ctx.guard(self.copy_image(ctx, &source, &destination, options))
            .await
    }
}
