//! Runtime that hosts sessions as local shells through `pty_manager`.

use async_trait::async_trait;
use pty_manager::{PtyActor, PtyConfig, PtyHandle};
use tracing::{debug, info};

use crate::config::{PreviewSection, SessionsSection};
use crate::error::RuntimeError;
use crate::runtime::{ExecutionEnvironment, Geometry, OutputSink, SessionHandle, SessionRuntime};

#[derive(Debug, Clone)]
pub struct LocalRuntime {
    shell: String,
    host_template: String,
    scheme: String,
    kill_dev_servers_command: Option<String>,
}

impl LocalRuntime {
    pub fn new(sessions: &SessionsSection, preview: &PreviewSection) -> Self {
        Self {
            shell: sessions.shell.clone(),
            host_template: preview.host_template.clone(),
            scheme: preview.scheme.clone(),
            kill_dev_servers_command: preview.kill_dev_servers_command.clone(),
        }
    }
}

struct LocalSession {
    pty: PtyHandle,
}

#[async_trait]
impl SessionHandle for LocalSession {
    async fn write(&self, data: &str) -> Result<(), RuntimeError> {
        self.pty.write_str(data).await?;
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError> {
        Ok(self.pty.resize(geometry.rows, geometry.cols).await?)
    }

    async fn terminate(&self) -> Result<(), RuntimeError> {
        Ok(self.pty.terminate().await?)
    }
}

#[async_trait]
impl SessionRuntime for LocalRuntime {
    async fn spawn_session(
        &self,
        geometry: Geometry,
        sink: OutputSink,
    ) -> Result<Box<dyn SessionHandle>, RuntimeError> {
        let config = PtyConfig {
            command: self.shell.clone(),
            rows: geometry.rows,
            cols: geometry.cols,
            ..Default::default()
        };
        let pty = PtyActor::spawn(config, sink)?;
        debug!(shell = %self.shell, "Spawned local shell");
        Ok(Box::new(LocalSession { pty }))
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalRuntime {
    async fn resolve_exposed_host(&self, port: u16) -> Result<String, RuntimeError> {
        Ok(self.host_template.replace("{port}", &port.to_string()))
    }

    async fn kill_dev_servers(&self) -> Result<(), RuntimeError> {
        let Some(command) = &self.kill_dev_servers_command else {
            return Ok(());
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to run {:?}: {}", command, e)))?;
        // pkill exits 1 when nothing matched
        info!(command = %command, code = ?status.code(), "Ran dev server kill command");
        Ok(())
    }

    fn preview_scheme(&self) -> &str {
        &self.scheme
    }
}
