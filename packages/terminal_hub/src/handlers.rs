//! Request handlers for one connection of one project.
//!
//! Every state change is broadcast to all connections of the project,
//! requester included, so each client's view converges on the same state.

use futures::FutureExt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::deploy::ServerContext;
use crate::error::HubError;
use crate::fanout::{ConnectionFanout, ConnectionInfo, broadcast_to_project};
use crate::keyed_lock::KeyedLock;
use crate::preview::detect_port;
use crate::project::Project;
use crate::protocol::{ClientRequest, Reply, ServerEvent};
use crate::registry::OutputCallback;
use crate::runtime::Geometry;

pub struct ProjectHandlers {
    project: Arc<Project>,
    connection: ConnectionInfo,
    context: ServerContext,
    connections: Arc<dyn ConnectionFanout>,
    locks: Arc<KeyedLock>,
}

impl ProjectHandlers {
    pub fn new(
        project: Arc<Project>,
        connection: ConnectionInfo,
        context: ServerContext,
        connections: Arc<dyn ConnectionFanout>,
        locks: Arc<KeyedLock>,
    ) -> Self {
        Self {
            project,
            connection,
            context,
            connections,
            locks,
        }
    }

    /// Route a decoded request to its handler. `Some` carries a direct reply.
    pub async fn dispatch(&self, request: ClientRequest) -> Result<Option<Reply>, HubError> {
        debug!(
            project_id = %self.project.project_id(),
            user_id = %self.connection.user_id,
            request = request.name(),
            "Handling request"
        );
        match request {
            ClientRequest::ListApps => self.list_apps().await.map(Some),
            ClientRequest::GetAppCreatedAt { app_name } => {
                self.get_app_created_at(&app_name).await.map(Some)
            }
            ClientRequest::AppExists { app_name } => self.app_exists(&app_name).await.map(Some),
            ClientRequest::Deploy => self.deploy().await.map(Some),
            ClientRequest::CreateTerminal { id } => self.create_terminal(&id).await.map(|()| None),
            ClientRequest::ResizeTerminal { dimensions, id } => self
                .resize_terminal(dimensions, id.as_deref())
                .await
                .map(|()| None),
            ClientRequest::TerminalData { id, data } => {
                self.terminal_data(&id, &data).await.map(|()| None)
            }
            ClientRequest::CloseTerminal { id } => {
                self.close_terminal(&id).await;
                Ok(None)
            }
            ClientRequest::StopPreview => self.stop_preview().await.map(|()| None),
            ClientRequest::GetInitialState => {
                self.get_initial_state();
                Ok(None)
            }
        }
    }

    pub async fn list_apps(&self) -> Result<Reply, HubError> {
        let platform = self.context.app_platform.as_ref().ok_or(HubError::MissingCapability(
            "Failed to retrieve apps list: no app platform client",
        ))?;
        Ok(Reply::Apps {
            success: true,
            apps: platform.list_apps().await?,
        })
    }

    pub async fn get_app_created_at(&self, app_name: &str) -> Result<Reply, HubError> {
        let platform = self.context.app_platform.as_ref().ok_or(HubError::MissingCapability(
            "Failed to retrieve app creation timestamp: no app platform client",
        ))?;
        Ok(Reply::CreatedAt {
            success: true,
            created_at: platform.app_created_at(app_name).await?,
        })
    }

    /// `{success: false}` means the answer is unknown, not that the app is missing.
    pub async fn app_exists(&self, app_name: &str) -> Result<Reply, HubError> {
        let unknown = Reply::Exists {
            success: false,
            exists: None,
        };
        let Some(platform) = self.context.app_platform.as_ref() else {
            info!(app_name, "Cannot check app existence: no app platform client");
            return Ok(unknown);
        };
        if !platform.is_connected() {
            info!(app_name, "Cannot check app existence: app platform is not connected");
            return Ok(unknown);
        }
        Ok(Reply::Exists {
            success: true,
            exists: Some(platform.app_exists(app_name).await?),
        })
    }

    pub async fn deploy(&self) -> Result<Reply, HubError> {
        let vcs = self
            .context
            .version_control
            .as_ref()
            .ok_or(HubError::MissingCapability("No version control client"))?;
        let files = self
            .project
            .files()
            .ok_or(HubError::MissingCapability("No file materializer"))?;

        let archive = files.archive_for_download().await?;
        vcs.push_files(&archive, self.project.project_id()).await?;
        info!(project_id = %self.project.project_id(), "Deployed project files");
        Ok(Reply::Done { success: true })
    }

    /// Create session `id` while holding the project's lock, so bootstraps of
    /// concurrent creates never interleave.
    pub async fn create_terminal(&self, id: &str) -> Result<(), HubError> {
        self.locks
            .run(self.project.project_id(), || async move {
                self.project
                    .registry()
                    .create(id, self.output_callback(id))
                    .await?;
                self.broadcast(ServerEvent::TerminalCreated { id: id.to_string() });
                Ok::<_, HubError>(())
            })
            .await
    }

    /// Resize `id`, or the most recently created session when no id is given.
    pub async fn resize_terminal(
        &self,
        dimensions: Geometry,
        id: Option<&str>,
    ) -> Result<(), HubError> {
        let registry = self.project.registry();
        let Some(target) = id.map(str::to_string).or_else(|| registry.most_recent_id()) else {
            debug!(project_id = %self.project.project_id(), "Resize with no sessions ignored");
            return Ok(());
        };
        registry.resize(&target, dimensions).await?;
        Ok(())
    }

    pub async fn terminal_data(&self, id: &str, data: &str) -> Result<(), HubError> {
        self.project.registry().write(id, data).await?;
        Ok(())
    }

    pub async fn close_terminal(&self, id: &str) {
        self.project.registry().close(id).await;
        self.broadcast(ServerEvent::TerminalClosed { id: id.to_string() });
        // Checked after the close: the pump is aborted by then, so the run
        // session cannot change between this check and the clear.
        if self.project.clear_preview_if_run(id) {
            self.broadcast(ServerEvent::preview_cleared());
        }
    }

    /// Send the current session list and preview to the requester only.
    pub fn get_initial_state(&self) {
        let registry = self.project.registry();
        self.connection.unicast(ServerEvent::TerminalState {
            ids: registry.list_ids(),
            screens: registry.snapshot_buffers(),
        });
        let preview = self.project.preview();
        self.connection.unicast(ServerEvent::PreviewState {
            url: preview.url,
            run_terminal_id: preview.run_session_id,
        });
    }

    /// Kill dev servers and close the run session. No-op without a preview.
    /// If the kill fails, nothing is closed and the error goes to the requester.
    pub async fn stop_preview(&self) -> Result<(), HubError> {
        let Some(run_id) = self.project.run_session_id() else {
            debug!(project_id = %self.project.project_id(), "No preview to stop");
            return Ok(());
        };
        if let Err(e) = self.project.kill_dev_servers().await {
            warn!(project_id = %self.project.project_id(), "Failed to kill dev servers: {}", e);
            return Err(e.into());
        }
        self.project.registry().close(&run_id).await;
        self.project.clear_preview_if_run(&run_id);
        self.broadcast(ServerEvent::TerminalClosed { id: run_id });
        let preview = self.project.preview();
        self.broadcast(ServerEvent::PreviewState {
            url: preview.url,
            run_terminal_id: preview.run_session_id,
        });
        Ok(())
    }

    fn broadcast(&self, event: ServerEvent) {
        broadcast_to_project(self.connections.as_ref(), self.project.project_id(), event);
    }

    /// Broadcasts each output chunk of `session_id`, then looks for a preview
    /// URL while none is set.
    fn output_callback(&self, session_id: &str) -> OutputCallback {
        let project = Arc::downgrade(&self.project);
        let connections = self.connections.clone();
        let session_id = session_id.to_string();
        Arc::new(move |data: String| {
            on_output(project.clone(), connections.clone(), session_id.clone(), data).boxed()
        })
    }
}

async fn on_output(
    project: Weak<Project>,
    connections: Arc<dyn ConnectionFanout>,
    session_id: String,
    data: String,
) {
    let Some(project) = project.upgrade() else {
        return;
    };
    // The slot is claimed at detection, so the first announcement wins even if
    // a later one resolves its host sooner.
    let claim = match project.environment() {
        Some(env) if !project.has_preview() => detect_port(&data)
            .filter(|_| project.try_claim_preview(&session_id))
            .map(|port| (env.clone(), port)),
        _ => None,
    };
    broadcast_to_project(
        connections.as_ref(),
        project.project_id(),
        ServerEvent::TerminalResponse {
            id: session_id.clone(),
            data,
        },
    );
    let Some((env, port)) = claim else {
        return;
    };
    let host = match env.resolve_exposed_host(port).await {
        Ok(host) => host,
        Err(e) => {
            warn!(project_id = %project.project_id(), port, "Failed to resolve preview host: {}", e);
            project.release_preview_claim(&session_id);
            return;
        }
    };
    let url = format!("{}://{}", env.preview_scheme(), host);
    if project.fulfill_preview(&session_id, &url) {
        broadcast_to_project(
            connections.as_ref(),
            project.project_id(),
            ServerEvent::PreviewState {
                url: Some(url),
                run_terminal_id: Some(session_id),
            },
        );
    }
}
