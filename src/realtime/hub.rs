//! One live connection per online user.
//!
//! Registration and removal are commands applied in order by a single actor
//! task. Lookups (`send`, `is_online`) only take the read side of the map.

use super::protocol::OutboundFrame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// What the hub needs from a live connection.
pub trait Connection: Send + Sync {
    /// Unique for the lifetime of the process.
    fn id(&self) -> u64;
    fn user_id(&self) -> &str;
    /// Queue a frame without blocking. `false` if it was not accepted.
    fn push(&self, frame: &OutboundFrame) -> bool;
    fn close(&self);
}

enum Command {
    Register {
        conn: Arc<dyn Connection>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        user_id: String,
        conn_id: u64,
        done: oneshot::Sender<bool>,
    },
}

type ClientMap = HashMap<String, Arc<dyn Connection>>;

#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    clients: Arc<RwLock<ClientMap>>,
}

impl Hub {
    /// Create the hub and spawn its actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let clients = Arc::new(RwLock::new(ClientMap::new()));
        tokio::spawn(run_actor(rx, Arc::clone(&clients)));
        Self {
            commands: tx,
            clients,
        }
    }

    /// Admit `conn`, closing any earlier connection of the same user.
    /// Resolves once the map reflects the change.
    pub async fn register(&self, conn: Arc<dyn Connection>) {
        let (done, applied) = oneshot::channel();
        if self.commands.send(Command::Register { conn, done }).is_err() {
            tracing::error!("Hub actor is gone; dropping registration");
            return;
        }
        let _ = applied.await;
    }

    /// Remove `conn` if it is still the registered connection of its user.
    pub async fn unregister(&self, conn: &dyn Connection) -> bool {
        let (done, applied) = oneshot::channel();
        let cmd = Command::Unregister {
            user_id: conn.user_id().to_string(),
            conn_id: conn.id(),
            done,
        };
        if self.commands.send(cmd).is_err() {
            return false;
        }
        applied.await.unwrap_or(false)
    }

    pub fn send(&self, user_id: &str, frame: &OutboundFrame) -> bool {
        let conn = self.clients.read().get(user_id).cloned();
        conn.is_some_and(|c| c.push(frame))
    }

    /// Push `frame` to each online user in `user_ids`; returns how many took it.
    pub fn broadcast(&self, user_ids: &[String], frame: &OutboundFrame) -> usize {
        let targets: Vec<Arc<dyn Connection>> = {
            let clients = self.clients.read();
            user_ids
                .iter()
                .filter_map(|id| clients.get(id).cloned())
                .collect()
        };
        targets.iter().filter(|c| c.push(frame)).count()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.clients.read().contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.clients.read().len()
    }
}

async fn run_actor(mut commands: mpsc::UnboundedReceiver<Command>, clients: Arc<RwLock<ClientMap>>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Register { conn, done } => {
                let user_id = conn.user_id().to_string();
                let conn_id = conn.id();
                let previous = clients.write().insert(user_id.clone(), conn);
                if let Some(old) = previous {
                    old.close();
                    tracing::info!(user_id = %user_id, old = old.id(), new = conn_id, "Connection taken over");
                } else {
                    tracing::info!(user_id = %user_id, conn_id, "Client connected");
                }
                let _ = done.send(());
            }
            Command::Unregister {
                user_id,
                conn_id,
                done,
            } => {
                let removed = {
                    let mut map = clients.write();
                    match map.get(&user_id) {
                        Some(current) if current.id() == conn_id => {
                            map.remove(&user_id);
                            true
                        }
                        _ => false,
                    }
                };
                if removed {
                    tracing::info!(user_id = %user_id, conn_id, "Client disconnected");
                } else {
                    tracing::debug!(user_id = %user_id, conn_id, "Stale connection unregistered");
                }
                let _ = done.send(removed);
            }
        }
    }
    tracing::debug!("Hub actor stopped");
}
