//! Retry behaviour of whole sync runs: transient failures, permanent
//! failures and the command deadline.

use async_trait::async_trait;
use docker_image_sync::copier::{CopyOptions, ImageCopier};
use docker_image_sync::error::{RegistryApiError, RegistryErrorCode};
use docker_image_sync::image::DockerReference;
use docker_image_sync::logging::Logger;
use docker_image_sync::registry::TagLister;
use docker_image_sync::transport::{AuthContext, ImageReference};
use docker_image_sync::{OperationContext, Result, SyncError, SyncJob, SyncPhase, Syncer};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct NoTags;

#[async_trait]
impl TagLister for NoTags {
    async fn list_tags(
        &self,
        _ctx: &OperationContext,
        _auth: &Arc<AuthContext>,
        _repository: &DockerReference,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Fails the first `failures` calls with errors built by `error`
struct FlakyCopier {
    calls: AtomicUsize,
    failures: usize,
    error: fn() -> SyncError,
}

impl FlakyCopier {
    fn new(failures: usize, error: fn() -> SyncError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            error,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageCopier for FlakyCopier {
    async fn copy(
        &self,
        _ctx: &OperationContext,
        _source: &ImageReference,
        _destination: &ImageReference,
        _options: &CopyOptions,
    ) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err((self.error)())
        } else {
            Ok(())
        }
    }
}

fn connection_reset() -> SyncError {
    SyncError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
}

fn manifest_unknown() -> SyncError {
    SyncError::Registry(RegistryApiError::new(
        404,
        Some(RegistryErrorCode::ManifestUnknown),
        "manifest unknown",
    ))
}

fn job(retry_times: u32) -> SyncJob {
    SyncJob::new("docker", "docker", "registry.example.com/team/app:1.0", "mirror.local/team")
        .with_retry_times(retry_times)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_within_budget_succeed() {
    let copier = FlakyCopier::new(2, connection_reset);
    let (logger, capture) = Logger::capturing();
    let mut syncer = Syncer::new(Arc::new(NoTags), copier.clone(), logger);

    let summary = syncer.run(&OperationContext::background(), &job(2)).await.unwrap();
    assert_eq!(summary.images_copied, 1);
    assert_eq!(copier.calls(), 3);
    assert_eq!(syncer.phase(), SyncPhase::Done);

    let warnings = capture.warnings();
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].starts_with("Attempt 1 of 3 failed"));
    assert!(warnings[1].starts_with("Attempt 2 of 3 failed"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_reports_attempts() {
    let copier = FlakyCopier::new(usize::MAX, connection_reset);
    let mut syncer = Syncer::new(Arc::new(NoTags), copier.clone(), Logger::new_quiet());

    let err = syncer.run(&OperationContext::background(), &job(2)).await.unwrap_err();
    assert_eq!(copier.calls(), 3);
    assert_eq!(syncer.phase(), SyncPhase::Aborted);
    assert!(err.chain().contains("after 3 attempt(s)"));
    assert!(matches!(err.root(), SyncError::Io(_)));
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_attempted_once() {
    let copier = FlakyCopier::new(usize::MAX, manifest_unknown);
    let mut syncer = Syncer::new(Arc::new(NoTags), copier.clone(), Logger::new_quiet());

    let err = syncer.run(&OperationContext::background(), &job(5)).await.unwrap_err();
    assert_eq!(copier.calls(), 1);
    assert!(matches!(err.root(), SyncError::Registry(_)));
}

#[tokio::test(start_paused = true)]
async fn deadline_during_backoff_stops_retrying() {
    let copier = FlakyCopier::new(usize::MAX, connection_reset);
    let mut syncer = Syncer::new(Arc::new(NoTags), copier.clone(), Logger::new_quiet());
    let ctx = OperationContext::with_timeout(Duration::from_millis(1500));

    // attempts at t=0s and t=1s, the 2s wait after that outlives the deadline
    let err = syncer.run(&ctx, &job(5)).await.unwrap_err();
    assert_eq!(copier.calls(), 2);
    assert_eq!(syncer.phase(), SyncPhase::Aborted);
    assert!(err.chain().contains("after 2 attempt(s)"));
}

#[tokio::test(start_paused = true)]
async fn custom_backoff_base_delay() {
    let copier = FlakyCopier::new(usize::MAX, connection_reset);
    let mut syncer = Syncer::new(Arc::new(NoTags), copier.clone(), Logger::new_quiet())
        .with_retry_delay(Duration::from_millis(100));
    let ctx = OperationContext::with_timeout(Duration::from_millis(1000));

    // attempts at 0, 100, 300 and 700ms; the 800ms wait after that is cut short
    let err = syncer.run(&ctx, &job(10)).await.unwrap_err();
    assert_eq!(copier.calls(), 4);
    assert!(err.chain().contains("after 4 attempt(s)"));
}
