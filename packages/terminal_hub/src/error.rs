//! Error taxonomy for hub requests.
//!
//! Stale targets (resize/write/close of a session that is already gone) are not
//! errors and never reach this module.

/// Failures reported by an execution runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),
    #[error("failed to write to session: {0}")]
    WriteFailed(String),
    #[error("failed to resize session: {0}")]
    ResizeFailed(String),
    #[error("failed to terminate session: {0}")]
    TerminateFailed(String),
    /// The runtime cannot be reached (container gone, host lookup failed, ...)
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    /// The session's process is gone. Writes and resizes treat it as stale.
    #[error("session process has exited")]
    SessionExited,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// A collaborator this request needs was not configured.
    #[error("{0}")]
    MissingCapability(&'static str),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A deployment collaborator rejected the call.
    #[error("deploy failed: {0}")]
    Deploy(String),
}

impl HubError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingCapability(_) => "missing_capability",
            Self::Runtime(_) => "runtime_failure",
            Self::Deploy(_) => "deploy_failure",
        }
    }
}

impl From<pty_manager::PtyError> for RuntimeError {
    fn from(err: pty_manager::PtyError) -> Self {
        use pty_manager::PtyError;
        match err {
            PtyError::CreateFailed(msg) => Self::SpawnFailed(msg),
            PtyError::WriteFailed(msg) => Self::WriteFailed(msg),
            PtyError::ResizeFailed(msg) => Self::ResizeFailed(msg),
            PtyError::TerminateFailed(msg) => Self::TerminateFailed(msg),
            PtyError::ProcessExited => Self::SessionExited,
        }
    }
}
