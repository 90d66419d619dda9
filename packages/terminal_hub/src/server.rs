//! WebSocket transport: one socket per client, addressed by project.
//!
//! `GET /ws/{project_id}?user_id=..&owner=true` joins a project. Frames are
//! JSON [`RequestEnvelope`]s; replies and broadcasts are [`ServerEvent`]s.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::deploy::ServerContext;
use crate::error::HubError;
use crate::fanout::{ConnectionInfo, ConnectionManager, ConnectionSink};
use crate::handlers::ProjectHandlers;
use crate::keyed_lock::KeyedLock;
use crate::local_runtime::LocalRuntime;
use crate::project::Project;
use crate::protocol::{Reply, RequestEnvelope, ServerEvent};
use crate::registry::SessionRegistry;

/// Builds the state of a project the first time a client joins it.
pub type ProjectFactory = Arc<dyn Fn(&str) -> Project + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    factory: ProjectFactory,
    projects: Arc<Mutex<HashMap<String, Arc<Project>>>>,
    pub connections: Arc<ConnectionManager>,
    pub locks: Arc<KeyedLock>,
    pub context: ServerContext,
    pub idle_teardown: Duration,
}

impl AppState {
    pub fn new(factory: ProjectFactory, context: ServerContext, idle_teardown: Duration) -> Self {
        Self {
            factory,
            projects: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(ConnectionManager::new()),
            locks: Arc::new(KeyedLock::new()),
            context,
            idle_teardown,
        }
    }

    /// Projects backed by local shells, without deployment collaborators.
    pub fn local(config: &HubConfig) -> Self {
        let runtime = Arc::new(LocalRuntime::new(&config.sessions, &config.preview));
        let registry_config = config.registry_config();
        let factory: ProjectFactory = Arc::new(move |project_id: &str| {
            let registry = SessionRegistry::new(runtime.clone(), registry_config.clone());
            Project::new(project_id, registry).with_environment(runtime.clone())
        });
        Self::new(factory, ServerContext::default(), config.idle_teardown())
    }

    /// Register a connection on `project_id`, creating the project if needed.
    ///
    /// Done under the project map lock so an idle teardown cannot remove the
    /// project between lookup and registration.
    pub async fn join(&self, project_id: &str, connection_id: &str, sink: ConnectionSink) -> Arc<Project> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .entry(project_id.to_string())
            .or_insert_with(|| {
                info!(project_id, "Opening project");
                Arc::new((self.factory)(project_id))
            })
            .clone();
        self.connections.register(project_id, connection_id, sink);
        project
    }

    /// Remove `project_id` if nobody is connected to it.
    pub async fn remove_if_idle(&self, project_id: &str) -> Option<Arc<Project>> {
        let mut projects = self.projects.lock().await;
        if self.connections.count(project_id) > 0 {
            return None;
        }
        projects.remove(project_id)
    }

    pub async fn project_count(&self) -> usize {
        self.projects.lock().await.len()
    }

    /// Tear down every open project.
    pub async fn shutdown(&self) {
        let projects: Vec<Arc<Project>> = self.projects.lock().await.drain().map(|(_, p)| p).collect();
        futures::future::join_all(projects.iter().map(|p| p.teardown())).await;
        info!(count = projects.len(), "Closed all projects");
    }

    fn schedule_idle_teardown(&self, project_id: String) {
        let state = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(state.idle_teardown).await;
            if let Some(project) = state.remove_if_idle(&project_id).await {
                info!(project_id = %project_id, "Project idle, tearing down");
                project.teardown().await;
            }
        });
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{project_id}", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "projects": state.project_count().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub user_id: Option<String>,
    #[serde(default)]
    pub owner: bool,
}

async fn ws_handler(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<JoinParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, params))
}

/// Serve one client connection until it closes.
pub async fn handle_socket(socket: WebSocket, state: AppState, project_id: String, params: JoinParams) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let user_id = params
        .user_id
        .unwrap_or_else(|| format!("anonymous-{}", &connection_id[..8]));
    info!(project_id = %project_id, user_id = %user_id, "Client connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let project = state.join(&project_id, &connection_id, tx.clone()).await;
    let handlers = ProjectHandlers::new(
        project,
        ConnectionInfo {
            user_id: user_id.clone(),
            is_owner: params.owner,
            sink: tx.clone(),
        },
        state.context.clone(),
        state.connections.clone(),
        state.locks.clone(),
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Requests of one connection are handled one at a time, in arrival order
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_frame(&handlers, &tx, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => {}
        _ = input_task => {}
    }

    let remaining = state.connections.unregister(&project_id, &connection_id);
    info!(project_id = %project_id, user_id = %user_id, "Client disconnected");
    if remaining == 0 {
        state.schedule_idle_teardown(project_id);
    }
}

async fn handle_frame(handlers: &ProjectHandlers, reply_to: &ConnectionSink, text: &str) {
    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            warn!("Rejected malformed frame: {}", e);
            let _ = reply_to.send(ServerEvent::Error {
                message: format!("Invalid request: {}", e),
            });
            return;
        }
    };
    let request = envelope.request.name();
    let result = handlers.dispatch(envelope.request).await;
    if let Err(e) = &result {
        warn!(request, code = e.error_code(), "Request failed: {}", e);
    }
    if let Some(event) = response_for(envelope.ack, result) {
        let _ = reply_to.send(event);
    }
}

/// What to send back to the requester for a handled request.
///
/// Requests carrying an `ack` always get an ack. Failures of fire-and-forget
/// requests still surface as an `error` event.
pub fn response_for(ack: Option<u64>, result: Result<Option<Reply>, HubError>) -> Option<ServerEvent> {
    match (ack, result) {
        (Some(ack), Ok(data)) => Some(ServerEvent::Ack {
            ack,
            ok: true,
            data,
            error: None,
            code: None,
        }),
        (Some(ack), Err(e)) => Some(ServerEvent::Ack {
            ack,
            ok: false,
            data: None,
            error: Some(e.to_string()),
            code: Some(e.error_code().to_string()),
        }),
        (None, Err(e)) => Some(ServerEvent::Error {
            message: e.to_string(),
        }),
        (None, Ok(_)) => None,
    }
}
