/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Failed to open the PTY or spawn the shell inside it
    #[error("failed to create PTY: {0}")]
    CreateFailed(String),
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    #[error("failed to terminate PTY: {0}")]
    TerminateFailed(String),
    /// The actor is gone; the process exited or was terminated
    #[error("PTY process has exited")]
    ProcessExited,
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::CreateFailed(format!("{:#}", err))
    }
}
