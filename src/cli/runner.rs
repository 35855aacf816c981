//! Runner wiring configuration, output and collaborators for one command

use crate::cli::args::{Args, Command, CopyArgs, ListTagsArgs, SyncArgs};
use crate::config::SyncConfig;
use crate::context::OperationContext;
use crate::copier::{DistributionCopier, ImageCopier};
use crate::error::{Result, ResultExt, SyncError};
use crate::image::DockerReference;
use crate::logging::Logger;
use crate::registry::{RegistryClients, RegistryTagLister, RepositoryTags};
use crate::retry::RetryPolicy;
use crate::sync::Syncer;
use crate::transport::ImageReference;
use std::sync::Arc;
use tokio::time::Instant;

pub struct Runner {
    args: Args,
    config: SyncConfig,
    logger: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Result<Self> {
        let config = SyncConfig::from_env()?.apply(&args.overrides());
        config.validate()?;

        let logger = if config.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(config.verbose)
        };

        Ok(Self { args, config, logger })
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<()> {
        let ctx = OperationContext::from_timeout(self.config.command_timeout);
        if let Some(deadline) = ctx.deadline() {
            self.logger.verbose(&format!(
                "Command timeout: {}",
                self.logger
                    .format_duration(deadline.saturating_duration_since(Instant::now()))
            ));
        }

        let interrupt = ctx.cancellation_token();
        let interrupt_logger = self.logger.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt_logger.warning("Interrupted, cancelling");
                interrupt.cancel();
            }
        });

        let result = match &self.args.command {
            Command::Sync(sync) => self.sync(&ctx, sync).await,
            Command::Copy(copy) => self.copy(&ctx, copy).await,
            Command::ListTags(list) => self.list_tags(&ctx, list).await,
        };
        watcher.abort();
        result
    }

    async fn sync(&self, ctx: &OperationContext, args: &SyncArgs) -> Result<()> {
        self.logger.section("Docker Image Sync");
        let job = args.to_job(self.config.retry_times)?;

        self.logger.info(&format!(
            "Source: {} ({})",
            job.source, job.source_transport
        ));
        self.logger.info(&format!(
            "Destination: {} ({})",
            job.destination, job.destination_transport
        ));
        self.logger.verbose(&format!(
            "Platform: {}, retries per image: {}",
            self.config.platform, job.retry_times
        ));

        let clients = RegistryClients::new(self.logger.clone());
        let tag_lister = Arc::new(RegistryTagLister::with_clients(clients.clone()));
        let copier = Arc::new(DistributionCopier::with_clients(
            clients,
            self.logger.clone(),
            self.config.platform.clone(),
        ));

        Syncer::new(tag_lister, copier, self.logger.clone())
            .run(ctx, &job)
            .await
            .map(|_| ())
    }

    async fn copy(&self, ctx: &OperationContext, args: &CopyArgs) -> Result<()> {
        self.logger.section("Docker Image Copy");
        let source = ImageReference::parse(&args.source)
            .with_context(|| format!("Invalid source name {}", args.source))?;
        let destination = ImageReference::parse(&args.destination)
            .with_context(|| format!("Invalid destination name {}", args.destination))?;
        let options = args.image.copy_options()?;

        let copier = DistributionCopier::new(self.logger.clone(), self.config.platform.clone());
        copier.validate_options(&options)?;

        self.logger
            .info(&format!("Copying {} to {}", source, destination));
        let started = Instant::now();
        RetryPolicy::new(self.config.retry_times)
            .run(ctx, &self.logger, || copier.copy(ctx, &source, &destination, &options))
            .await
            .with_context(|| format!("Error copying {} to {}", source, destination))?;

        self.logger.success(&format!(
            "Copied {} in {}",
            source,
            self.logger.format_duration(started.elapsed())
        ));
        Ok(())
    }

    async fn list_tags(&self, ctx: &OperationContext, args: &ListTagsArgs) -> Result<()> {
        let repository = list_tags_repository(&args.image)?;
        let auth = Arc::new(args.auth()?);
        let lister = RegistryTagLister::new(self.logger.clone());

        let listing = RetryPolicy::new(self.config.retry_times)
            .run(ctx, &self.logger, || {
                RepositoryTags::fetch(ctx, &lister, &auth, &repository)
            })
            .await
            .with_context(|| format!("Error listing repository tags for {}", args.image))?;
        println!("{}", listing.to_json()?);
        Ok(())
    }
}

/// The repository named by a `list-tags` argument: docker transport only,
/// without a tag or digest
fn list_tags_repository(image: &str) -> Result<DockerReference> {
    let reference = ImageReference::parse(image)
        .with_context(|| format!("Invalid image name {}", image))?;
    let repository = match reference {
        ImageReference::Docker(repository) => repository,
        other => {
            return Err(SyncError::UnsupportedTransport(format!(
                "{} (only docker:// repositories can list tags)",
                other.transport_name()
            )));
        }
    };
    if !repository.is_name_only() {
        return Err(SyncError::InvalidReference {
            input: image.to_string(),
            reason: "tag or digest is not supported when listing tags".to_string(),
        });
    }
    Ok(repository)
}
