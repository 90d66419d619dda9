//! Per-project state: the session registry plus the preview bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::deploy::FileMaterializer;
use crate::error::RuntimeError;
use crate::registry::SessionRegistry;
use crate::runtime::ExecutionEnvironment;

/// The preview URL and the session whose output announced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewState {
    pub url: Option<String>,
    pub run_session_id: Option<String>,
}

pub struct Project {
    project_id: String,
    registry: SessionRegistry,
    environment: Option<Arc<dyn ExecutionEnvironment>>,
    files: Option<Arc<dyn FileMaterializer>>,
    preview: Mutex<PreviewSlot>,
}

/// The announced preview, plus the session that claimed the slot while its
/// host is still being resolved.
#[derive(Debug, Default)]
struct PreviewSlot {
    state: PreviewState,
    claim: Option<String>,
}

impl Project {
    pub fn new(project_id: impl Into<String>, registry: SessionRegistry) -> Self {
        Self {
            project_id: project_id.into(),
            registry,
            environment: None,
            files: None,
            preview: Mutex::new(PreviewSlot::default()),
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn ExecutionEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileMaterializer>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn environment(&self) -> Option<&Arc<dyn ExecutionEnvironment>> {
        self.environment.as_ref()
    }

    pub fn files(&self) -> Option<&Arc<dyn FileMaterializer>> {
        self.files.as_ref()
    }

    pub fn preview(&self) -> PreviewState {
        self.lock_preview().state.clone()
    }

    /// Whether a preview is announced or being resolved.
    pub fn has_preview(&self) -> bool {
        let slot = self.lock_preview();
        slot.state.url.is_some() || slot.claim.is_some()
    }

    pub fn run_session_id(&self) -> Option<String> {
        self.lock_preview().state.run_session_id.clone()
    }

    /// Reserve the preview for `session_id` at the moment its port is
    /// detected. Returns false when a preview is already set or claimed.
    pub fn try_claim_preview(&self, session_id: &str) -> bool {
        let mut slot = self.lock_preview();
        if slot.state.url.is_some() || slot.claim.is_some() {
            return false;
        }
        slot.claim = Some(session_id.to_string());
        debug!(project_id = %self.project_id, session_id, "Preview claimed");
        true
    }

    /// Publish `url` for the session holding the claim. Returns false if the
    /// claim was dropped meanwhile (session closed, project torn down).
    pub fn fulfill_preview(&self, session_id: &str, url: &str) -> bool {
        let mut slot = self.lock_preview();
        if slot.claim.as_deref() != Some(session_id) {
            return false;
        }
        slot.claim = None;
        slot.state = PreviewState {
            url: Some(url.to_string()),
            run_session_id: Some(session_id.to_string()),
        };
        info!(project_id = %self.project_id, url, run_session_id = session_id, "Preview detected");
        true
    }

    /// Drop the claim of `session_id` without publishing anything.
    pub fn release_preview_claim(&self, session_id: &str) {
        let mut slot = self.lock_preview();
        if slot.claim.as_deref() == Some(session_id) {
            slot.claim = None;
        }
    }

    /// Claim and publish in one step.
    pub fn try_set_preview(&self, url: &str, run_session_id: &str) -> bool {
        self.try_claim_preview(run_session_id) && self.fulfill_preview(run_session_id, url)
    }

    pub fn clear_preview(&self) {
        *self.lock_preview() = PreviewSlot::default();
    }

    /// Clear the preview if `session_id` is the run session. Returns whether
    /// it was. A pending claim by `session_id` is dropped as well.
    pub fn clear_preview_if_run(&self, session_id: &str) -> bool {
        let mut slot = self.lock_preview();
        if slot.claim.as_deref() == Some(session_id) {
            slot.claim = None;
        }
        if slot.state.run_session_id.as_deref() != Some(session_id) {
            return false;
        }
        slot.state = PreviewState::default();
        debug!(project_id = %self.project_id, session_id, "Preview cleared with its run session");
        true
    }

    pub async fn kill_dev_servers(&self) -> Result<(), RuntimeError> {
        match &self.environment {
            Some(env) => env.kill_dev_servers().await,
            None => Ok(()),
        }
    }

    /// Close every session and forget the preview.
    pub async fn teardown(&self) {
        self.registry.close_all().await;
        self.clear_preview();
        info!(project_id = %self.project_id, "Project torn down");
    }

    fn lock_preview(&self) -> MutexGuard<'_, PreviewSlot> {
        self.preview.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("project_id", &self.project_id)
            .field("registry", &self.registry)
            .field("preview", &self.preview())
            .finish()
    }
}
