//! A sync request as given on the command line

use crate::copier::CopyOptions;
use crate::error::{Result, SyncError};
use crate::retry::DEFAULT_MAX_RETRIES;
use crate::transport::{AuthContext, DIR_TRANSPORT, DestinationTransport, SourceTransport};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub source_transport: String,
    pub destination_transport: String,
    /// Repository, directory or YAML file, depending on the source transport
    pub source: String,
    /// Registry namespace or directory images are written below
    pub destination: String,
    pub scoped: bool,
    pub remove_signatures: bool,
    pub sign_by: Option<String>,
    pub retry_times: u32,
    pub source_auth: AuthContext,
    pub destination_auth: AuthContext,
}

impl SyncJob {
    pub fn new(
        source_transport: impl Into<String>,
        destination_transport: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            source_transport: source_transport.into(),
            destination_transport: destination_transport.into(),
            source: source.into(),
            destination: destination.into(),
            scoped: false,
            remove_signatures: false,
            sign_by: None,
            retry_times: DEFAULT_MAX_RETRIES,
            source_auth: AuthContext::default(),
            destination_auth: AuthContext::default(),
        }
    }

    pub fn with_scoped(mut self, scoped: bool) -> Self {
        self.scoped = scoped;
        self
    }

    pub fn with_remove_signatures(mut self, remove_signatures: bool) -> Self {
        self.remove_signatures = remove_signatures;
        self
    }

    pub fn with_sign_by(mut self, sign_by: Option<String>) -> Self {
        self.sign_by = sign_by;
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_source_auth(mut self, auth: AuthContext) -> Self {
        self.source_auth = auth;
        self
    }

    pub fn with_destination_auth(mut self, auth: AuthContext) -> Self {
        self.destination_auth = auth;
        self
    }

    /// Check transports and arguments; performs no I/O
    pub fn validate(&self) -> Result<(SourceTransport, DestinationTransport)> {
        if self.source_transport.is_empty() {
            return Err(SyncError::Validation(
                "A source transport must be specified".to_string(),
            ));
        }
        let source: SourceTransport = self.source_transport.parse().map_err(|_| {
            SyncError::Validation(format!(
                "{:?} is not a valid source transport",
                self.source_transport
            ))
        })?;

        if self.destination_transport.is_empty() {
            return Err(SyncError::Validation(
                "A destination transport must be specified".to_string(),
            ));
        }
        let destination: DestinationTransport = self.destination_transport.parse().map_err(|_| {
            SyncError::Validation(format!(
                "{:?} is not a valid destination transport",
                self.destination_transport
            ))
        })?;

        if source == SourceTransport::Dir && destination == DestinationTransport::Dir {
            return Err(SyncError::Validation(format!(
                "sync from '{}' to '{}' not implemented, consider using rsync instead",
                DIR_TRANSPORT, DIR_TRANSPORT
            )));
        }
        if self.source.is_empty() || self.destination.is_empty() {
            return Err(SyncError::Validation(
                "Both a source and a destination must be specified".to_string(),
            ));
        }

        Ok((source, destination))
    }

    /// Copy options for the job; the source auth is replaced per repository
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            remove_signatures: self.remove_signatures,
            sign_by: self.sign_by.clone(),
            source_auth: Arc::new(self.source_auth.clone()),
            destination_auth: Arc::new(self.destination_auth.clone()),
        }
    }
}
