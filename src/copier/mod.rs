//! Image copy collaborators
//!
//! The sync orchestrator only depends on [`ImageCopier`]; the built-in
//! [`DistributionCopier`] moves single images between registries and `dir`
//! layouts.

pub mod dir;
pub mod distribution;

pub use dir::DirImage;
pub use distribution::DistributionCopier;

use crate::context::OperationContext;
use crate::error::Result;
use crate::transport::{AuthContext, ImageReference};
use async_trait::async_trait;
use std::sync::Arc;

/// Options forwarded to every copy of a sync job
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub remove_signatures: bool,
    /// Key fingerprint to sign destination images with
    pub sign_by: Option<String>,
    pub source_auth: Arc<AuthContext>,
    pub destination_auth: Arc<AuthContext>,
}

impl CopyOptions {
    /// The same options with another source repository's auth context
    pub fn for_source(&self, source_auth: Arc<AuthContext>) -> Self {
        Self {
            source_auth,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait ImageCopier: Send + Sync {
    /// Reject options this copier cannot honour, before any image is touched
    fn validate_options(&self, _options: &CopyOptions) -> Result<()> {
        Ok(())
    }

    /// Copy one image; errors are classified by the caller for retrying
    async fn copy(
        &self,
        ctx: &OperationContext,
        source: &ImageReference,
        destination: &ImageReference,
        options: &CopyOptions,
    ) -> Result<()>;
}
