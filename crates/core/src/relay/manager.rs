use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub user_id: String,
}

/// Connections are owned by a user. Keying on both ids means one user can
/// never replace or close another user's session.
type Key = (String, String);

fn key(session_id: &str, user_id: &str) -> Key {
    (session_id.to_string(), user_id.to_string())
}

struct Entry {
    info: ConnectionInfo,
    shutdown: Arc<Notify>,
}

/// Registry of live voice relay connections, keyed by `(session_id, user_id)`.
///
/// Each registered connection gets a shutdown signal it listens on while
/// streaming, which is how the service closes connections on request or on
/// graceful shutdown.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<Key, Entry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its shutdown signal.
    ///
    /// A second registration of the same session by the same user replaces
    /// the first and signals it to close.
    pub async fn register(&self, session_id: &str, user_id: &str) -> Arc<Notify> {
        let shutdown = Arc::new(Notify::new());
        let previous = self.connections.write().await.insert(
            key(session_id, user_id),
            Entry {
                info: ConnectionInfo {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                },
                shutdown: shutdown.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(session_id, user_id, "replacing existing voice connection");
            previous.shutdown.notify_one();
        }
        debug!(session_id, user_id, "voice connection registered");
        shutdown
    }

    /// Removes the entry, but only if it still belongs to `shutdown`.
    pub async fn deregister(&self, session_id: &str, user_id: &str, shutdown: &Arc<Notify>) -> bool {
        let key = key(session_id, user_id);
        let mut connections = self.connections.write().await;
        match connections.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.shutdown, shutdown) => {
                connections.remove(&key);
                debug!(session_id, user_id, "voice connection deregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, session_id: &str, user_id: &str) -> bool {
        self.connections
            .read()
            .await
            .contains_key(&key(session_id, user_id))
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn active(&self) -> Vec<ConnectionInfo> {
        let mut active: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        active.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        active
    }

    /// Asks one of the user's connections to close. Returns `false` when
    /// the user has no such connection.
    pub async fn request_close(&self, session_id: &str, user_id: &str) -> bool {
        match self.connections.read().await.get(&key(session_id, user_id)) {
            Some(entry) => {
                entry.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    /// Asks every connection to close, returning how many were signalled.
    pub async fn close_all(&self) -> usize {
        let connections = self.connections.read().await;
        for entry in connections.values() {
            entry.shutdown.notify_one();
        }
        if !connections.is_empty() {
            info!(count = connections.len(), "closing all voice connections");
        }
        connections.len()
    }
}
