//! Deployment collaborators. All optional; requests that need a missing one
//! are rejected with [`HubError::MissingCapability`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::HubError;

/// Execution-management client for deployed apps.
#[async_trait]
pub trait AppPlatform: Send + Sync {
    async fn list_apps(&self) -> Result<Vec<String>, HubError>;
    async fn app_created_at(&self, app_name: &str) -> Result<DateTime<Utc>, HubError>;
    async fn app_exists(&self, app_name: &str) -> Result<bool, HubError>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Push a base64 tarball of project files to the deploy target.
    async fn push_files(&self, archive: &str, project_id: &str) -> Result<(), HubError>;
}

/// Packages the current project files.
#[async_trait]
pub trait FileMaterializer: Send + Sync {
    async fn archive_for_download(&self) -> Result<String, HubError>;
}

/// Server-wide deployment clients shared by every project.
#[derive(Clone, Default)]
pub struct ServerContext {
    pub app_platform: Option<Arc<dyn AppPlatform>>,
    pub version_control: Option<Arc<dyn VersionControl>>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("app_platform", &self.app_platform.is_some())
            .field("version_control", &self.version_control.is_some())
            .finish()
    }
}
