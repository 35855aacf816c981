//! Expanding a sync source into the images to copy
//!
//! A source is a registry repository (one tag, or every tag), a directory
//! tree of `dir` images, or a YAML document listing registries with explicit
//! tags or tag filters. [`SourceResolver`] turns each into a list of
//! [`RepositoryDescriptor`]s. Problems confined to one repository are logged
//! and that repository is dropped; only problems that prevent resolution as a
//! whole are returned as errors.

use crate::context::OperationContext;
use crate::copier::DirImage;
use crate::error::{Result, ResultExt, SyncError};
use crate::image::DockerReference;
use crate::logging::Logger;
use crate::registry::TagLister;
use crate::transport::{AuthContext, Credentials, ImageReference, SourceTransport, TlsVerify};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Images from one source repository, sharing one auth context
#[derive(Debug, Clone)]
pub struct RepositoryDescriptor {
    /// Base directory the images were found under, for `dir` sources
    pub dir_base_path: Option<PathBuf>,
    pub tagged_images: Vec<ImageReference>,
    pub auth: Arc<AuthContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCredentials {
    pub username: String,
    pub password: String,
}

/// One registry entry of a YAML source, exactly as written
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRegistryEntry {
    /// Repository → tags; an empty (or null) list means every tag
    pub images: BTreeMap<String, Option<Vec<String>>>,
    /// Repository → regular expression tags must match
    #[serde(rename = "images-by-tag-regex")]
    pub images_by_tag_regex: BTreeMap<String, String>,
    pub credentials: Option<RawCredentials>,
    #[serde(rename = "tls-verify")]
    pub tls_verify: Option<bool>,
    #[serde(rename = "cert-dir")]
    pub cert_dir: Option<String>,
}

impl RawRegistryEntry {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.images_by_tag_regex.is_empty()
    }

    /// The entry's own auth context, derived from the command-line one
    pub fn auth_context(&self, base: &AuthContext) -> AuthContext {
        base.derive()
            .with_credentials(
                self.credentials
                    .as_ref()
                    .map(|c| Credentials::new(&c.username, &c.password)),
            )
            .with_tls_verify(tls_verify_policy(self.tls_verify))
            .with_cert_dir(self.cert_dir.as_ref().map(PathBuf::from))
    }
}

/// Registry host → entry, iterated in sorted order
pub type SourceConfig = BTreeMap<String, RawRegistryEntry>;

/// Verification stays on unless the document explicitly turns it off
pub fn tls_verify_policy(raw: Option<bool>) -> TlsVerify {
    match raw {
        Some(false) => TlsVerify::Disabled,
        Some(true) | None => TlsVerify::Enabled,
    }
}

pub fn parse_source_config(yaml: &str) -> Result<SourceConfig> {
    if yaml.trim().is_empty() {
        return Ok(SourceConfig::new());
    }
    let parsed: Option<SourceConfig> = serde_yaml::from_str(yaml)?;
    Ok(parsed.unwrap_or_default())
}

pub async fn load_source_config(path: &Path) -> Result<SourceConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Error reading YAML source file {}", path.display()))?;
    parse_source_config(&contents)
        .map_err(|e| SyncError::Config(format!("Error parsing YAML file {}: {}", path.display(), e)))
}

pub struct SourceResolver {
    tag_lister: Arc<dyn TagLister>,
    logger: Logger,
}

impl SourceResolver {
    pub fn new(tag_lister: Arc<dyn TagLister>, logger: Logger) -> Self {
        Self { tag_lister, logger }
    }

    /// Resolve `location` for `transport`; fails with
    /// [`SyncError::NoImagesFound`] when nothing is left to copy
    pub async fn resolve(
        &self,
        ctx: &OperationContext,
        transport: SourceTransport,
        location: &str,
        auth: &AuthContext,
    ) -> Result<Vec<RepositoryDescriptor>> {
        let descriptors = match transport {
            SourceTransport::Docker => {
                self.resolve_repository(ctx, location, Arc::new(auth.clone()))
                    .await?
            }
            SourceTransport::Dir => self.resolve_directory(location, Arc::new(auth.clone()))?,
            SourceTransport::Yaml => self.resolve_yaml(ctx, Path::new(location), auth).await?,
        };

        let images: usize = descriptors.iter().map(|d| d.tagged_images.len()).sum();
        if images == 0 {
            return Err(SyncError::NoImagesFound(location.to_string()));
        }
        self.logger.verbose(&format!(
            "Resolved {} images in {} repositories from {}",
            images,
            descriptors.len(),
            location
        ));
        Ok(descriptors)
    }

    async fn resolve_repository(
        &self,
        ctx: &OperationContext,
        location: &str,
        auth: Arc<AuthContext>,
    ) -> Result<Vec<RepositoryDescriptor>> {
        let named = DockerReference::parse_normalized(location).with_context(|| {
            format!(
                "Cannot obtain a valid image reference for transport \"docker\" and reference {:?}",
                location
            )
        })?;
        self.logger.detail(&format!(
            "Tag presence check: {} (tagged: {})",
            location,
            !named.is_name_only()
        ));

        let tagged_images = if named.is_name_only() {
            self.images_from_repository(ctx, &auth, &named).await?
        } else {
            vec![ImageReference::Docker(named)]
        };
        Ok(vec![RepositoryDescriptor {
            dir_base_path: None,
            tagged_images,
            auth,
        }])
    }

    /// Every distinct tag of `repository`, in listing order
    async fn images_from_repository(
        &self,
        ctx: &OperationContext,
        auth: &Arc<AuthContext>,
        repository: &DockerReference,
    ) -> Result<Vec<ImageReference>> {
        self.logger
            .info(&format!("Getting tags for image {}", repository.name()));
        let tags = match self.tag_lister.list_tags(ctx, auth, repository).await {
            Ok(tags) => tags,
            Err(err) if matches!(err.root(), SyncError::TagListingDenied { .. }) => {
                self.logger
                    .warning(&format!("Registry disallows tag list retrieval: {}", err));
                Vec::new()
            }
            Err(err) => {
                return Err(err.context(format!(
                    "Error determining repository tags for image {}",
                    repository.name()
                )));
            }
        };

        let mut seen_tags = HashSet::new();
        let mut images = Vec::new();
        for tag in tags {
            if !seen_tags.insert(tag.clone()) {
                self.logger
                    .debug(&format!("Tag {} listed twice for {}", tag, repository.name()));
                continue;
            }
            let tagged = repository.with_tag(&tag).with_context(|| {
                format!(
                    "Error creating a reference for repository {} and tag {:?}",
                    repository.name(),
                    tag
                )
            })?;
            images.push(ImageReference::Docker(tagged));
        }
        Ok(images)
    }

    fn resolve_directory(&self, location: &str, auth: Arc<AuthContext>) -> Result<Vec<RepositoryDescriptor>> {
        let base = PathBuf::from(location);
        std::fs::metadata(&base).context("Invalid source directory specified")?;

        let mut images = Vec::new();
        let mut walker = WalkDir::new(&base).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry
                .map_err(io::Error::from)
                .with_context(|| format!("Error walking the path {:?}", location))?;
            if entry.file_type().is_dir() && DirImage::is_image_dir(entry.path()) {
                self.logger
                    .detail(&format!("Found image in {}", entry.path().display()));
                images.push(ImageReference::dir(entry.path()));
                walker.skip_current_dir();
            }
        }

        Ok(vec![RepositoryDescriptor {
            dir_base_path: Some(base),
            tagged_images: images,
            auth,
        }])
    }

    async fn resolve_yaml(
        &self,
        ctx: &OperationContext,
        path: &Path,
        auth: &AuthContext,
    ) -> Result<Vec<RepositoryDescriptor>> {
        let config = load_source_config(path).await?;
        let mut descriptors = Vec::new();
        for (registry, entry) in &config {
            if entry.is_empty() {
                self.logger
                    .warning(&format!("No images specified for registry {}", registry));
                continue;
            }
            let resolved = self
                .resolve_registry(ctx, registry, entry, auth)
                .await
                .with_context(|| format!("Failed to retrieve list of images from registry {:?}", registry))?;
            descriptors.extend(resolved);
        }
        Ok(descriptors)
    }

    fn parse_repository(&self, registry: &str, image_name: &str) -> Option<DockerReference> {
        match DockerReference::parse_repository(&format!("{}/{}", registry, image_name)) {
            Ok(repository) => Some(repository),
            Err(err) => {
                self.logger.error(&format!(
                    "Error parsing repository name {}/{}, skipping: {}",
                    registry, image_name, err
                ));
                None
            }
        }
    }

    /// Tag listing for one YAML repository; failures only skip the repository
    async fn listed_images(
        &self,
        ctx: &OperationContext,
        auth: &Arc<AuthContext>,
        repository: &DockerReference,
    ) -> Result<Option<Vec<ImageReference>>> {
        self.logger.verbose("Querying registry for image tags");
        match self.images_from_repository(ctx, auth, repository).await {
            Ok(images) => Ok(Some(images)),
            Err(err) => {
                if let Some(reason) = ctx.err() {
                    return Err(reason);
                }
                self.logger.error(&format!(
                    "Error processing repo {}, skipping: {}",
                    repository.name(),
                    err.chain()
                ));
                Ok(None)
            }
        }
    }

    async fn resolve_registry(
        &self,
        ctx: &OperationContext,
        registry: &str,
        entry: &RawRegistryEntry,
        base_auth: &AuthContext,
    ) -> Result<Vec<RepositoryDescriptor>> {
        let auth = Arc::new(entry.auth_context(base_auth));
        let mut descriptors = Vec::new();

        for (image_name, tags) in &entry.images {
            let Some(repository) = self.parse_repository(registry, image_name) else {
                continue;
            };
            self.logger
                .info(&format!("Processing repo {}", repository.name()));

            let tags = tags.as_deref().unwrap_or_default();
            let images = if tags.is_empty() {
                match self.listed_images(ctx, &auth, &repository).await? {
                    Some(images) => images,
                    None => continue,
                }
            } else {
                let mut seen = HashSet::new();
                let mut images = Vec::new();
                for tag in tags {
                    match repository.with_tag(tag) {
                        Ok(tagged) => {
                            let image = ImageReference::Docker(tagged);
                            if seen.insert(image.to_string()) {
                                images.push(image);
                            }
                        }
                        Err(err) => self
                            .logger
                            .error(&format!("Error parsing tag {:?}, skipping: {}", tag, err)),
                    }
                }
                images
            };

            self.push_repository(&mut descriptors, &repository, images, &auth);
        }

        for (image_name, pattern) in &entry.images_by_tag_regex {
            let Some(repository) = self.parse_repository(registry, image_name) else {
                continue;
            };
            self.logger
                .info(&format!("Processing repo {}", repository.name()));

            let tag_filter = match Regex::new(pattern) {
                Ok(regex) => regex,
                Err(err) => {
                    self.logger.error(&format!(
                        "Error processing repo {}, skipping: invalid tag regular expression {:?}: {}",
                        repository.name(),
                        pattern,
                        err
                    ));
                    continue;
                }
            };

            let Some(all_images) = self.listed_images(ctx, &auth, &repository).await? else {
                continue;
            };
            self.logger.verbose(&format!(
                "Start filtering using the regular expression: {}",
                pattern
            ));
            let images = all_images
                .into_iter()
                .filter(|image| {
                    image
                        .docker_reference()
                        .and_then(DockerReference::tag)
                        .is_some_and(|tag| tag_filter.is_match(tag))
                })
                .collect();

            self.push_repository(&mut descriptors, &repository, images, &auth);
        }

        Ok(descriptors)
    }

    fn push_repository(
        &self,
        descriptors: &mut Vec<RepositoryDescriptor>,
        repository: &DockerReference,
        images: Vec<ImageReference>,
        auth: &Arc<AuthContext>,
    ) {
        if images.is_empty() {
            self.logger
                .warning(&format!("No tags to sync found for {}", repository.name()));
            return;
        }
        descriptors.push(RepositoryDescriptor {
            dir_base_path: None,
            tagged_images: images,
            auth: auth.clone(),
        });
    }
}
