//! Seams to the execution runtime that actually hosts shell sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::RuntimeError;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 20 }
    }
}

/// Where a runtime delivers session output, in production order.
/// The runtime drops it when the session ends.
pub type OutputSink = mpsc::UnboundedSender<String>;

/// One live session, exclusively owned by the registry.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn write(&self, data: &str) -> Result<(), RuntimeError>;
    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError>;
    async fn terminate(&self) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait SessionRuntime: Send + Sync {
    async fn spawn_session(
        &self,
        geometry: Geometry,
        sink: OutputSink,
    ) -> Result<Box<dyn SessionHandle>, RuntimeError>;

    /// Called when terminate failed and the registry has already forgotten the
    /// session. Runtimes that can reconcile leaked resources out-of-band hook in here.
    fn orphaned(&self, session_id: &str, error: &RuntimeError) {
        warn!(session_id, "session may still be running after failed terminate: {}", error);
    }
}

/// The project's execution environment, as seen by preview handling.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Externally routable host (no scheme) for a port opened inside the environment.
    async fn resolve_exposed_host(&self, port: u16) -> Result<String, RuntimeError>;

    /// Kill dev-server processes started by a run session.
    async fn kill_dev_servers(&self) -> Result<(), RuntimeError>;

    fn preview_scheme(&self) -> &str {
        "https"
    }
}
