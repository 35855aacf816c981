//! Sequential sync driver
//!
//! [`Syncer::run`] validates the job, resolves the source once, then copies
//! every resolved image in order, one at a time. The first image that still
//! fails after retrying stops the whole job.

use crate::context::OperationContext;
use crate::copier::{CopyOptions, ImageCopier};
use crate::error::{Result, ResultExt};
use crate::logging::Logger;
use crate::registry::TagLister;
use crate::retry::RetryPolicy;
use crate::sync::destination::build_destination;
use crate::sync::job::SyncJob;
use crate::sync::source::{RepositoryDescriptor, SourceResolver};
use crate::transport::{DestinationTransport, ImageReference};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Validating,
    Resolving,
    Copying,
    Done,
    /// Stopped during validation or resolution, before anything was copied
    Failed,
    /// Stopped by a copy failure; images copied so far stay in place
    Aborted,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Validating => "validating",
            SyncPhase::Resolving => "resolving",
            SyncPhase::Copying => "copying",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
            SyncPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub images_copied: usize,
    pub repositories: usize,
    pub elapsed: Duration,
}

pub struct Syncer {
    tag_lister: Arc<dyn TagLister>,
    copier: Arc<dyn ImageCopier>,
    logger: Logger,
    retry_delay: Duration,
    phase: SyncPhase,
}

impl Syncer {
    pub fn new(tag_lister: Arc<dyn TagLister>, copier: Arc<dyn ImageCopier>, logger: Logger) -> Self {
        Self {
            tag_lister,
            copier,
            logger,
            retry_delay: crate::retry::DEFAULT_BASE_DELAY,
            phase: SyncPhase::Idle,
        }
    }

    /// Base delay of the exponential backoff between copy attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn enter(&mut self, phase: SyncPhase) {
        self.logger
            .debug(&format!("Sync phase: {} -> {}", self.phase, phase));
        self.phase = phase;
    }

    pub async fn run(&mut self, ctx: &OperationContext, job: &SyncJob) -> Result<SyncSummary> {
        let started = Instant::now();

        self.enter(SyncPhase::Validating);
        let base_options = job.copy_options();
        let validated = job
            .validate()
            .and_then(|transports| self.copier.validate_options(&base_options).map(|_| transports));
        let (source_transport, destination_transport) = match validated {
            Ok(transports) => transports,
            Err(err) => {
                self.enter(SyncPhase::Failed);
                return Err(err);
            }
        };

        self.enter(SyncPhase::Resolving);
        self.logger.section("Resolving sync source");
        let resolver = SourceResolver::new(self.tag_lister.clone(), self.logger.clone());
        let repositories = match resolver
            .resolve(ctx, source_transport, &job.source, &job.source_auth)
            .await
        {
            Ok(repositories) => repositories,
            Err(err) => {
                self.enter(SyncPhase::Failed);
                return Err(err);
            }
        };

        self.enter(SyncPhase::Copying);
        self.logger.section("Copying images");
        let policy = RetryPolicy::new(job.retry_times).with_base_delay(self.retry_delay);
        let mut images_copied = 0;

        for (number, repository) in repositories.iter().enumerate() {
            self.logger.subsection(&format!(
                "Source {} of {} ({} images)",
                number + 1,
                repositories.len(),
                repository.tagged_images.len()
            ));
            let options = base_options.for_source(repository.auth.clone());
            for index in 0..repository.tagged_images.len() {
                let step = CopyStep {
                    job,
                    destination_transport,
                    repository,
                    index,
                    options: &options,
                };
                if let Err(err) = self.copy_image(ctx, &policy, step).await {
                    self.enter(SyncPhase::Aborted);
                    return Err(err);
                }
                images_copied += 1;
            }
        }

        self.enter(SyncPhase::Done);
        let summary = SyncSummary {
            images_copied,
            repositories: repositories.len(),
            elapsed: started.elapsed(),
        };
        self.logger.success(&format!(
            "Synced {} images from {} sources in {}",
            summary.images_copied,
            summary.repositories,
            self.logger.format_duration(summary.elapsed)
        ));
        Ok(summary)
    }

    async fn copy_image(&self, ctx: &OperationContext, policy: &RetryPolicy, step: CopyStep<'_>) -> Result<()> {
        let repository = step.repository;
        let image = &repository.tagged_images[step.index];
        let destination = build_destination(
            image,
            repository.dir_base_path.as_deref(),
            &step.job.destination,
            step.destination_transport,
            step.job.scoped,
        )
        .with_context(|| format!("Error copying tag {:?}", image.to_string()))?;
        if let ImageReference::Dir(path) = &destination {
            tokio::fs::create_dir_all(path)
                .await
                .with_context(|| format!("Error creating destination directory {}", path.display()))?;
        }

        self.logger.info(&format!(
            "Copying image tag {}/{}: {} -> {}",
            step.index + 1,
            repository.tagged_images.len(),
            image,
            destination
        ));

        let attempts = AtomicU32::new(0);
        policy
            .run(ctx, &self.logger, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.copier.copy(ctx, image, &destination, step.options)
            })
            .await
            .map_err(|err| {
                err.context(format!(
                    "Error copying tag {:?} after {} attempt(s)",
                    image.to_string(),
                    attempts.load(Ordering::SeqCst)
                ))
            })
    }
}

/// One image of one resolved repository
struct CopyStep<'a> {
    job: &'a SyncJob,
    destination_transport: DestinationTransport,
    repository: &'a RepositoryDescriptor,
    index: usize,
    options: &'a CopyOptions,
}
