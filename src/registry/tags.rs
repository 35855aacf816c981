//! Tag enumeration for sync sources

use crate::context::OperationContext;
use crate::error::Result;
use crate::image::DockerReference;
use crate::logging::Logger;
use crate::registry::client::RegistryClients;
use crate::transport::AuthContext;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Enumerates the tags of a registry repository
///
/// Implementations must report a registry that refuses to list tags (401/403
/// on the listing endpoint) as [`crate::error::SyncError::TagListingDenied`]
/// so callers can tolerate it; every other failure is propagated as-is.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn list_tags(
        &self,
        ctx: &OperationContext,
        auth: &Arc<AuthContext>,
        repository: &DockerReference,
    ) -> Result<Vec<String>>;
}

/// [`TagLister`] backed by the registry HTTP API
#[derive(Clone)]
pub struct RegistryTagLister {
    clients: RegistryClients,
}

impl RegistryTagLister {
    pub fn new(logger: Logger) -> Self {
        Self::with_clients(RegistryClients::new(logger))
    }

    pub fn with_clients(clients: RegistryClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl TagLister for RegistryTagLister {
    async fn list_tags(
        &self,
        ctx: &OperationContext,
        auth: &Arc<AuthContext>,
        repository: &DockerReference,
    ) -> Result<Vec<String>> {
        let client = self.clients.get(repository.domain(), auth)?;
        client.list_tags(ctx, repository.path()).await
    }
}

/// Tags of one repository, in the shape `list-tags` prints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryTags {
    #[serde(rename = "Repository")]
    pub repository: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

impl RepositoryTags {
    pub async fn fetch(
        ctx: &OperationContext,
        lister: &dyn TagLister,
        auth: &Arc<AuthContext>,
        repository: &DockerReference,
    ) -> Result<Self> {
        let tags = lister.list_tags(ctx, auth, repository).await?;
        Ok(Self {
            repository: repository.name(),
            tags,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_tags_json_shape() {
        let listing = RepositoryTags {
            repository: "registry.example.com/team/app".to_string(),
            tags: vec!["1.0".to_string(), "latest".to_string()],
        };
        let value: serde_json::Value = serde_json::from_str(&listing.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "Repository": "registry.example.com/team/app",
                "Tags": ["1.0", "latest"]
            })
        );
    }
}
