//! In-memory runtime used by unit tests.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;
use crate::registry::OutputCallback;
use crate::runtime::{ExecutionEnvironment, Geometry, OutputSink, SessionHandle, SessionRuntime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Spawn { session: usize, geometry: Geometry },
    Write { session: usize, data: String },
    Resize { session: usize, geometry: Geometry },
    Terminate { session: usize },
    KillDevServers,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    sinks: Vec<Option<OutputSink>>,
    exited: HashSet<usize>,
    orphans: Vec<String>,
    fail_spawn: bool,
    fail_writes: bool,
    fail_terminate: bool,
    fail_kill: bool,
    unreachable: bool,
    resolve_delays: HashMap<u16, Duration>,
    fail_resolve: bool,
}

type Shared = Arc<Mutex<FakeState>>;

/// Records every runtime call. Sessions are numbered in spawn order.
#[derive(Default)]
pub struct FakeRuntime {
    state: Shared,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Spawn { .. }))
    }

    pub fn terminate_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Terminate { .. }))
    }

    pub fn kill_count(&self) -> usize {
        self.count(|call| matches!(call, Call::KillDevServers))
    }

    pub fn writes_for(&self, session: usize) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write { session: s, data } if s == session => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn orphans(&self) -> Vec<String> {
        self.state.lock().unwrap().orphans.clone()
    }

    /// Push output from session number `session`, as if its shell printed it.
    pub fn emit(&self, session: usize, data: &str) {
        let state = self.state.lock().unwrap();
        if let Some(Some(sink)) = state.sinks.get(session) {
            let _ = sink.send(data.to_string());
        }
    }

    /// Mark a session's process as gone; later calls report `SessionExited`.
    pub fn exit_session(&self, session: usize) {
        let mut state = self.state.lock().unwrap();
        state.exited.insert(session);
        if let Some(slot) = state.sinks.get_mut(session) {
            slot.take();
        }
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.state.lock().unwrap().fail_spawn = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn fail_terminate(&self, fail: bool) {
        self.state.lock().unwrap().fail_terminate = fail;
    }

    /// Make live sessions report `Unavailable`, as when the runtime drops off
    /// the network for a while.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Make host resolution for `port` take `delay`.
    pub fn delay_resolve(&self, port: u16, delay: Duration) {
        self.state.lock().unwrap().resolve_delays.insert(port, delay);
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.state.lock().unwrap().fail_resolve = fail;
    }

    pub fn fail_kill(&self, fail: bool) {
        self.state.lock().unwrap().fail_kill = fail;
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }
}

struct FakeSession {
    index: usize,
    state: Shared,
}

impl FakeSession {
    fn check_alive(&self) -> Result<(), RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.exited.contains(&self.index) {
            return Err(RuntimeError::SessionExited);
        }
        if state.unreachable {
            return Err(RuntimeError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for FakeSession {
    async fn write(&self, data: &str) -> Result<(), RuntimeError> {
        // Give other tasks a chance to interleave between writes
        tokio::task::yield_now().await;
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Write {
            session: self.index,
            data: data.to_string(),
        });
        if state.fail_writes {
            return Err(RuntimeError::WriteFailed("broken pipe".into()));
        }
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError> {
        self.check_alive()?;
        self.state.lock().unwrap().calls.push(Call::Resize {
            session: self.index,
            geometry,
        });
        Ok(())
    }

    async fn terminate(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Terminate { session: self.index });
        if state.fail_terminate {
            return Err(RuntimeError::TerminateFailed("container unreachable".into()));
        }
        if let Some(slot) = state.sinks.get_mut(self.index) {
            slot.take();
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRuntime for FakeRuntime {
    async fn spawn_session(
        &self,
        geometry: Geometry,
        sink: OutputSink,
    ) -> Result<Box<dyn SessionHandle>, RuntimeError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if state.fail_spawn {
            return Err(RuntimeError::SpawnFailed("no capacity".into()));
        }
        let index = state.sinks.len();
        state.sinks.push(Some(sink));
        state.calls.push(Call::Spawn {
            session: index,
            geometry,
        });
        Ok(Box::new(FakeSession {
            index,
            state: self.state.clone(),
        }))
    }

    fn orphaned(&self, session_id: &str, _error: &RuntimeError) {
        self.state.lock().unwrap().orphans.push(session_id.to_string());
    }
}

#[async_trait]
impl ExecutionEnvironment for FakeRuntime {
    async fn resolve_exposed_host(&self, port: u16) -> Result<String, RuntimeError> {
        let delay = self.state.lock().unwrap().resolve_delays.get(&port).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.lock().unwrap().fail_resolve {
            return Err(RuntimeError::Unavailable("no route to sandbox".into()));
        }
        Ok(format!("{}-sandbox.example.dev", port))
    }

    async fn kill_dev_servers(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::KillDevServers);
        if state.fail_kill {
            return Err(RuntimeError::Unavailable("exec refused".into()));
        }
        Ok(())
    }
}

/// Output callback that stores every chunk it is handed.
pub fn collecting_callback() -> (OutputCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: OutputCallback = Arc::new(move |chunk: String| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(chunk);
        }
        .boxed()
    });
    (callback, seen)
}

/// Let spawned pump tasks drain what has been emitted so far.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
