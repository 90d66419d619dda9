//! Live sessions of one project.
//!
//! The table is behind a std `Mutex` that is never held across an await:
//! handles are cloned out as `Arc`s before calling into the runtime.

use futures::future::{BoxFuture, join_all};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::output_buffer::{DEFAULT_MAX_SCREEN_CHARS, OutputBuffer};
use crate::runtime::{Geometry, SessionHandle, SessionRuntime};

/// Receives each output chunk after it has been buffered. Awaited before the
/// next chunk of the same session is delivered.
pub type OutputCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub const DEFAULT_WORKING_DIR: &str = "/home/user/project";
pub const BOOTSTRAP_PROMPT: &str = "user> ";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory every new shell `cd`s into
    pub working_dir: String,
    pub initial_geometry: Geometry,
    pub max_buffer_chars: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            initial_geometry: Geometry::default(),
            max_buffer_chars: DEFAULT_MAX_SCREEN_CHARS,
        }
    }
}

struct LiveSession {
    handle: Box<dyn SessionHandle>,
    geometry: Mutex<Geometry>,
    created_order: u64,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    live: HashMap<String, Arc<LiveSession>>,
    /// Ids between the idempotency check and insertion into `live`
    starting: HashSet<String>,
    buffers: HashMap<String, OutputBuffer>,
    next_order: u64,
}

type SharedTable = Arc<Mutex<Table>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SessionRegistry {
    runtime: Arc<dyn SessionRuntime>,
    config: RegistryConfig,
    table: SharedTable,
}

impl SessionRegistry {
    pub fn new(runtime: Arc<dyn SessionRuntime>, config: RegistryConfig) -> Self {
        Self {
            runtime,
            config,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Shell commands issued, in order, right after a session is spawned.
    pub fn bootstrap_commands(&self) -> [String; 3] {
        [
            format!("cd \"{}\"", self.config.working_dir),
            format!("export PS1='{}'", BOOTSTRAP_PROMPT),
            "clear".to_string(),
        ]
    }

    /// Spawn session `id` unless it already exists.
    ///
    /// Every output chunk is appended to the session's buffer and then handed to
    /// `on_output`. A failed bootstrap tears the session down again before the
    /// error is returned.
    pub async fn create(&self, id: &str, on_output: OutputCallback) -> Result<(), RuntimeError> {
        {
            let mut table = lock(&self.table);
            if table.live.contains_key(id) || !table.starting.insert(id.to_string()) {
                debug!(session_id = id, "Session already exists, create is a no-op");
                return Ok(());
            }
            table
                .buffers
                .insert(id.to_string(), OutputBuffer::new(self.config.max_buffer_chars));
        }
        let starting = StartingGuard {
            table: self.table.clone(),
            id: id.to_string(),
        };

        let geometry = self.config.initial_geometry;
        let (sink, output) = mpsc::unbounded_channel();
        let handle = self.runtime.spawn_session(geometry, sink).await?;

        let pump = tokio::spawn(pump_output(
            self.table.clone(),
            id.to_string(),
            output,
            on_output,
        ));

        let session = {
            let mut table = lock(&self.table);
            let created_order = table.next_order;
            table.next_order += 1;
            let session = Arc::new(LiveSession {
                handle,
                geometry: Mutex::new(geometry),
                created_order,
                pump,
            });
            table.live.insert(id.to_string(), session.clone());
            session
        };
        drop(starting);

        for command in self.bootstrap_commands() {
            if let Err(e) = session.handle.write(&format!("{}\r", command)).await {
                warn!(session_id = id, "Bootstrap failed, closing session: {}", e);
                self.close(id).await;
                return Err(e);
            }
        }

        info!(session_id = id, "Created session");
        Ok(())
    }

    /// Resize session `id`; unknown ids are ignored.
    pub async fn resize(&self, id: &str, geometry: Geometry) -> Result<(), RuntimeError> {
        let Some(session) = self.get(id) else {
            debug!(session_id = id, "Resize for unknown session ignored");
            return Ok(());
        };
        tolerate_exit(id, session.handle.resize(geometry).await)?;
        *session
            .geometry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = geometry;
        Ok(())
    }

    /// Forward input to session `id`; unknown ids are ignored.
    pub async fn write(&self, id: &str, data: &str) -> Result<(), RuntimeError> {
        let Some(session) = self.get(id) else {
            debug!(session_id = id, "Write for unknown session ignored");
            return Ok(());
        };
        tolerate_exit(id, session.handle.write(data).await)
    }

    /// Terminate and forget session `id`; unknown ids are ignored.
    ///
    /// The table entry and buffer are gone even when terminate fails; the
    /// runtime is told about the possible orphan.
    pub async fn close(&self, id: &str) {
        let session = {
            let mut table = lock(&self.table);
            let session = table.live.remove(id);
            if session.is_some() {
                table.buffers.remove(id);
            }
            session
        };
        match session {
            Some(session) => self.shutdown(id, session).await,
            None => debug!(session_id = id, "Close for unknown session ignored"),
        }
    }

    /// Terminate every session concurrently.
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Arc<LiveSession>)> = {
            let mut table = lock(&self.table);
            let drained: Vec<_> = table.live.drain().collect();
            for (id, _) in &drained {
                table.buffers.remove(id);
            }
            drained
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing all sessions");
        join_all(
            sessions
                .iter()
                .map(|(id, session)| self.shutdown(id, session.clone())),
        )
        .await;
    }

    /// Session ids in creation order.
    pub fn list_ids(&self) -> Vec<String> {
        let table = lock(&self.table);
        let mut ids: Vec<(u64, &String)> = table
            .live
            .iter()
            .map(|(id, session)| (session.created_order, id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// The most recently created live session.
    pub fn most_recent_id(&self) -> Option<String> {
        let table = lock(&self.table);
        table
            .live
            .iter()
            .max_by_key(|(_, session)| session.created_order)
            .map(|(id, _)| id.clone())
    }

    /// Buffered output of every live session that has produced any.
    pub fn snapshot_buffers(&self) -> BTreeMap<String, String> {
        let table = lock(&self.table);
        table
            .live
            .keys()
            .filter_map(|id| {
                table
                    .buffers
                    .get(id)
                    .filter(|buf| !buf.is_empty())
                    .map(|buf| (id.clone(), buf.snapshot().to_string()))
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.table).live.contains_key(id)
    }

    pub fn geometry(&self, id: &str) -> Option<Geometry> {
        self.get(id).map(|session| {
            *session
                .geometry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.table).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: &str) -> Option<Arc<LiveSession>> {
        lock(&self.table).live.get(id).cloned()
    }

    async fn shutdown(&self, id: &str, session: Arc<LiveSession>) {
        // No output is delivered for a session once its close has begun
        session.pump.abort();
        if let Err(e) = session.handle.terminate().await {
            warn!(session_id = id, "Terminate failed: {}", e);
            self.runtime.orphaned(id, &e);
        }
        info!(session_id = id, "Closed session");
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.list_ids())
            .field("config", &self.config)
            .finish()
    }
}

/// Clears the `starting` reservation however `create` exits. If the session
/// never went live, its buffer goes too.
struct StartingGuard {
    table: SharedTable,
    id: String,
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        table.starting.remove(&self.id);
        if !table.live.contains_key(&self.id) {
            table.buffers.remove(&self.id);
        }
    }
}

/// A session whose process already exited behaves like a missing one.
fn tolerate_exit(id: &str, result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::SessionExited) => {
            debug!(session_id = id, "Session exited mid-call");
            Ok(())
        }
        other => other,
    }
}

async fn pump_output(
    table: SharedTable,
    id: String,
    mut output: mpsc::UnboundedReceiver<String>,
    on_output: OutputCallback,
) {
    while let Some(chunk) = output.recv().await {
        if let Some(buffer) = lock(&table).buffers.get_mut(&id) {
            buffer.append(&chunk);
        }
        on_output(chunk).await;
    }
    debug!(session_id = %id, "Session output stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Call, FakeRuntime, collecting_callback, settle};
    use futures::FutureExt;

    fn registry(runtime: &Arc<FakeRuntime>) -> SessionRegistry {
        SessionRegistry::new(runtime.clone(), RegistryConfig::default())
    }

    fn noop() -> OutputCallback {
        Arc::new(|_: String| async {}.boxed())
    }

    #[tokio::test]
    async fn create_spawns_and_bootstraps_in_order() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);

        reg.create("a", noop()).await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                Call::Spawn {
                    session: 0,
                    geometry: Geometry { cols: 80, rows: 20 },
                },
                Call::Write {
                    session: 0,
                    data: "cd \"/home/user/project\"\r".to_string(),
                },
                Call::Write {
                    session: 0,
                    data: "export PS1='user> '\r".to_string(),
                },
                Call::Write {
                    session: 0,
                    data: "clear\r".to_string(),
                },
            ]
        );
        assert_eq!(reg.list_ids(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn create_is_idempotent_by_id() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);

        reg.create("a", noop()).await.unwrap();
        reg.create("a", noop()).await.unwrap();

        assert_eq!(runtime.spawn_count(), 1);
        assert_eq!(runtime.writes_for(0).len(), 3);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_create_same_id_spawns_once() {
        let runtime = FakeRuntime::new();
        let reg = Arc::new(registry(&runtime));

        let (a, b) = tokio::join!(reg.create("a", noop()), reg.create("a", noop()));
        a.unwrap();
        b.unwrap();

        assert_eq!(runtime.spawn_count(), 1);
    }

    #[tokio::test]
    async fn stale_targets_are_noops() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);

        reg.write("ghost", "ls\r").await.unwrap();
        reg.resize("ghost", Geometry { cols: 100, rows: 30 })
            .await
            .unwrap();
        reg.close("ghost").await;

        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn write_and_resize_forward_to_runtime() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("a", noop()).await.unwrap();

        reg.write("a", "ls\r").await.unwrap();
        let geometry = Geometry { cols: 120, rows: 40 };
        reg.resize("a", geometry).await.unwrap();

        assert_eq!(runtime.writes_for(0).last().unwrap(), "ls\r");
        assert!(runtime.calls().contains(&Call::Resize {
            session: 0,
            geometry
        }));
        assert_eq!(reg.geometry("a"), Some(geometry));
    }

    #[tokio::test]
    async fn output_is_buffered_then_forwarded_in_order() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        let (callback, seen) = collecting_callback();
        reg.create("a", callback).await.unwrap();

        runtime.emit(0, "one ");
        runtime.emit(0, "two ");
        runtime.emit(0, "three");
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["one ", "two ", "three"]);
        assert_eq!(
            reg.snapshot_buffers().get("a").map(String::as_str),
            Some("one two three")
        );
    }

    #[tokio::test]
    async fn buffer_is_capped() {
        let runtime = FakeRuntime::new();
        let reg = SessionRegistry::new(
            runtime.clone(),
            RegistryConfig {
                max_buffer_chars: 4,
                ..Default::default()
            },
        );
        reg.create("a", noop()).await.unwrap();

        runtime.emit(0, "abcdef");
        runtime.emit(0, "gh");
        settle().await;

        assert_eq!(reg.snapshot_buffers()["a"], "efgh");
    }

    #[tokio::test]
    async fn snapshot_skips_empty_buffers() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("quiet", noop()).await.unwrap();
        reg.create("chatty", noop()).await.unwrap();

        runtime.emit(1, "$ ");
        settle().await;

        let snapshot = reg.snapshot_buffers();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["chatty"], "$ ");
    }

    #[tokio::test]
    async fn close_terminates_and_forgets() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("a", noop()).await.unwrap();
        runtime.emit(0, "hello");
        settle().await;

        reg.close("a").await;

        assert!(runtime.calls().contains(&Call::Terminate { session: 0 }));
        assert!(!reg.contains("a"));
        assert!(reg.snapshot_buffers().is_empty());

        // A second close is a no-op
        reg.close("a").await;
        assert_eq!(runtime.terminate_count(), 1);
    }

    #[tokio::test]
    async fn close_forgets_session_even_when_terminate_fails() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("a", noop()).await.unwrap();
        runtime.fail_terminate(true);

        reg.close("a").await;

        assert!(reg.is_empty());
        assert_eq!(runtime.orphans(), vec!["a".to_string()]);

        // The id can be reused right away
        runtime.fail_terminate(false);
        reg.create("a", noop()).await.unwrap();
        assert_eq!(runtime.spawn_count(), 2);
    }

    #[tokio::test]
    async fn no_output_after_close() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        let (callback, seen) = collecting_callback();
        reg.create("a", callback).await.unwrap();

        reg.close("a").await;
        runtime.emit(0, "late");
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        for id in ["a", "b", "c"] {
            reg.create(id, noop()).await.unwrap();
        }

        reg.close_all().await;

        assert!(reg.is_empty());
        assert_eq!(runtime.terminate_count(), 3);
    }

    #[tokio::test]
    async fn list_ids_follow_creation_order() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        for id in ["zeta", "alpha", "mid"] {
            reg.create(id, noop()).await.unwrap();
        }
        reg.close("alpha").await;

        assert_eq!(reg.list_ids(), vec!["zeta".to_string(), "mid".to_string()]);
        assert_eq!(reg.most_recent_id().as_deref(), Some("mid"));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_trace() {
        let runtime = FakeRuntime::new();
        runtime.fail_spawn(true);
        let reg = registry(&runtime);

        let err = reg.create("a", noop()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnFailed(_)));
        assert!(reg.is_empty());

        runtime.fail_spawn(false);
        reg.create("a", noop()).await.unwrap();
        assert!(reg.contains("a"));
    }

    #[tokio::test]
    async fn bootstrap_failure_closes_session() {
        let runtime = FakeRuntime::new();
        runtime.fail_writes(true);
        let reg = registry(&runtime);

        let err = reg.create("a", noop()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::WriteFailed(_)));
        assert!(!reg.contains("a"));
        assert_eq!(runtime.terminate_count(), 1);
    }

    #[tokio::test]
    async fn exited_session_write_is_tolerated() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("a", noop()).await.unwrap();
        runtime.exit_session(0);

        reg.write("a", "ls\r").await.unwrap();
        reg.resize("a", Geometry { cols: 90, rows: 30 }).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_runtime_write_is_reported() {
        let runtime = FakeRuntime::new();
        let reg = registry(&runtime);
        reg.create("a", noop()).await.unwrap();
        runtime.set_unreachable(true);

        let err = reg.write("a", "ls\r").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        let err = reg
            .resize("a", Geometry { cols: 90, rows: 30 })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));

        runtime.set_unreachable(false);
        reg.write("a", "ls\r").await.unwrap();
        assert!(reg.contains("a"));
    }

    #[tokio::test]
    async fn custom_working_dir_is_used() {
        let runtime = FakeRuntime::new();
        let reg = SessionRegistry::new(
            runtime.clone(),
            RegistryConfig {
                working_dir: "/srv/app".to_string(),
                ..Default::default()
            },
        );
        reg.create("a", noop()).await.unwrap();
        assert_eq!(runtime.writes_for(0)[0], "cd \"/srv/app\"\r");
    }
}
