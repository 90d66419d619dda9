//! Delivery of server events to every connection subscribed to a project.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::ServerEvent;

/// Outbound queue of one client connection. Unbounded so a broadcaster never
/// waits on a slow client; events arrive in send order.
pub type ConnectionSink = mpsc::UnboundedSender<ServerEvent>;

/// The requesting side of a handler call.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub is_owner: bool,
    pub sink: ConnectionSink,
}

impl ConnectionInfo {
    /// Send to this connection only. A closed connection is ignored.
    pub fn unicast(&self, event: ServerEvent) {
        if self.sink.send(event).is_err() {
            debug!(user_id = %self.user_id, "Dropped event for closed connection");
        }
    }
}

pub trait ConnectionFanout: Send + Sync {
    fn connections_for_project(&self, project_id: &str) -> Vec<ConnectionSink>;
}

/// Send `event` to every connection of `project_id`, skipping closed ones.
pub fn broadcast_to_project(fanout: &dyn ConnectionFanout, project_id: &str, event: ServerEvent) {
    let sinks = fanout.connections_for_project(project_id);
    let mut dropped = 0usize;
    for sink in &sinks {
        if sink.send(event.clone()).is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(project_id, dropped, "Broadcast skipped closed connections");
    }
}

/// In-process registry of live connections, grouped by project.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    projects: RwLock<HashMap<String, HashMap<String, ConnectionSink>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, project_id: &str, connection_id: &str, sink: ConnectionSink) {
        let mut projects = self.projects.write().unwrap_or_else(|p| p.into_inner());
        projects
            .entry(project_id.to_string())
            .or_default()
            .insert(connection_id.to_string(), sink);
        info!(
            project_id,
            connection_id,
            connections = projects[project_id].len(),
            "Connection joined project"
        );
    }

    /// Remove a connection and return how many remain on the project.
    pub fn unregister(&self, project_id: &str, connection_id: &str) -> usize {
        let mut projects = self.projects.write().unwrap_or_else(|p| p.into_inner());
        let Some(conns) = projects.get_mut(project_id) else {
            return 0;
        };
        conns.remove(connection_id);
        let remaining = conns.len();
        if remaining == 0 {
            projects.remove(project_id);
        }
        info!(project_id, connection_id, remaining, "Connection left project");
        remaining
    }

    pub fn count(&self, project_id: &str) -> usize {
        self.projects
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(project_id)
            .map_or(0, HashMap::len)
    }
}

impl ConnectionFanout for ConnectionManager {
    fn connections_for_project(&self, project_id: &str) -> Vec<ConnectionSink> {
        self.projects
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(project_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str) -> ServerEvent {
        ServerEvent::TerminalCreated { id: id.into() }
    }

    #[test]
    fn broadcast_reaches_only_project_members() {
        let manager = ConnectionManager::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        manager.register("p1", "a", a_tx);
        manager.register("p1", "b", b_tx);
        manager.register("p2", "c", other_tx);

        broadcast_to_project(&manager, "p1", created("t1"));

        assert_eq!(a_rx.try_recv().unwrap(), created("t1"));
        assert_eq!(b_rx.try_recv().unwrap(), created("t1"));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn closed_connections_are_skipped() {
        let manager = ConnectionManager::new();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        manager.register("p", "gone", gone_tx);
        manager.register("p", "live", live_tx);
        drop(gone_rx);

        broadcast_to_project(&manager, "p", created("t"));
        assert_eq!(live_rx.try_recv().unwrap(), created("t"));
    }

    #[test]
    fn unregister_reports_remaining() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register("p", "a", tx.clone());
        manager.register("p", "b", tx);

        assert_eq!(manager.count("p"), 2);
        assert_eq!(manager.unregister("p", "a"), 1);
        assert_eq!(manager.unregister("p", "b"), 0);
        assert_eq!(manager.unregister("p", "b"), 0);
        assert!(manager.connections_for_project("p").is_empty());
    }

    #[test]
    fn events_keep_send_order() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register("p", "a", tx);

        for id in ["1", "2", "3"] {
            broadcast_to_project(&manager, "p", created(id));
        }
        for id in ["1", "2", "3"] {
            assert_eq!(rx.try_recv().unwrap(), created(id));
        }
    }
}
