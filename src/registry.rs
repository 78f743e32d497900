//! Connected-agent registry.
//!
//! Tracks live gateway connections, heartbeat freshness and per-agent
//! active tasks, resolves dispatch targets (including the `auto` sentinel)
//! and broadcasts connect/disconnect edges to interested services (offline
//! queue drain, sync orchestrator restart watch).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{AgentId, AgentSelector, TaskId};
use crate::protocol::Frame;

/// Connection status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Busy,
    Offline,
}

/// Falling/rising connection edges, fanned out over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Connected(AgentId),
    Disconnected(AgentId),
}

/// Where a dispatch should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The agent is online; send now.
    Online(AgentId),
    /// The pinned agent is offline; queue for it — its filesystem holds
    /// the project, so the task must not float.
    QueueOffline(AgentId),
    /// `auto` dispatch with no agent online.
    NoAgents,
}

struct Connection {
    conn_id: u64,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    status: ConnectionStatus,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    active_task_ids: Vec<TaskId>,
}

/// Admin-facing view of one registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_task_ids: Vec<String>,
}

/// Registry of connected agents.
pub struct AgentRegistry {
    connections: DashMap<AgentId, Connection>,
    /// Insertion order for `auto` round-robin.
    order: Mutex<Vec<AgentId>>,
    rr_cursor: AtomicUsize,
    conn_seq: AtomicU64,
    events: broadcast::Sender<AgentEvent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connections: DashMap::new(),
            order: Mutex::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            conn_seq: AtomicU64::new(1),
            events,
        }
    }

    /// Subscribes to connect/disconnect edges.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Registers a freshly authenticated connection. Only one live
    /// connection per agent id: an older connection for the same id is
    /// cancelled before the new one takes its slot. Returns the connection
    /// id used to scope later deregistration.
    pub fn register(
        &self,
        agent: AgentId,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> u64 {
        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let connection = Connection {
            conn_id,
            outbound,
            cancel,
            status: ConnectionStatus::Online,
            connected_at: now,
            last_heartbeat: now,
            active_task_ids: Vec::new(),
        };

        if let Some(previous) = self.connections.insert(agent.clone(), connection) {
            warn!(agent = %agent, "replacing existing connection for agent");
            previous.cancel.cancel();
        } else {
            let mut order = self.order.lock().expect("registry order lock");
            if !order.contains(&agent) {
                order.push(agent.clone());
            }
        }

        info!(agent = %agent, conn_id, "agent connected");
        let _ = self.events.send(AgentEvent::Connected(agent));
        conn_id
    }

    /// Removes a connection. A stale `conn_id` (already replaced by a newer
    /// handshake) is a no-op so teardown of the evicted connection cannot
    /// remove its successor.
    pub fn deregister(&self, agent: &AgentId, conn_id: u64) {
        let removed = self
            .connections
            .remove_if(agent, |_, conn| conn.conn_id == conn_id)
            .is_some();
        if removed {
            info!(agent = %agent, conn_id, "agent disconnected");
            let _ = self.events.send(AgentEvent::Disconnected(agent.clone()));
        } else {
            debug!(agent = %agent, conn_id, "stale deregister ignored");
        }
    }

    /// Hands a frame to the agent's outbound queue. Returns true iff the
    /// hand-off succeeded; this is not a delivery guarantee.
    pub fn send(&self, agent: &AgentId, frame: Frame) -> bool {
        match self.connections.get(agent) {
            Some(conn) => conn.outbound.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Broadcasts a frame to every connected agent, returning how many
    /// hand-offs succeeded.
    pub fn broadcast_frame(&self, frame: &Frame) -> usize {
        let mut delivered = 0;
        for conn in self.connections.iter() {
            if conn.outbound.try_send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// True when the agent has a live connection.
    #[must_use]
    pub fn is_online(&self, agent: &AgentId) -> bool {
        self.connections.contains_key(agent)
    }

    /// Records a heartbeat (pong or any inbound frame).
    pub fn mark_heartbeat(&self, agent: &AgentId) {
        if let Some(mut conn) = self.connections.get_mut(agent) {
            conn.last_heartbeat = Utc::now();
        }
    }

    /// Applies a status report from the agent.
    pub fn apply_status_report(&self, agent: &AgentId, busy: bool, active: Vec<TaskId>) {
        if let Some(mut conn) = self.connections.get_mut(agent) {
            conn.status = if busy {
                ConnectionStatus::Busy
            } else {
                ConnectionStatus::Online
            };
            conn.active_task_ids = active;
            conn.last_heartbeat = Utc::now();
        }
    }

    /// Cancels connections whose heartbeat is older than `max_silence`.
    /// Cancellation tears the connection down, which deregisters it and
    /// fires the disconnect edge.
    pub fn cancel_stale(&self, max_silence: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_silence).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut cancelled = 0;
        for conn in self.connections.iter() {
            if conn.last_heartbeat < cutoff {
                warn!(agent = %conn.key(), "heartbeat silence, cancelling connection");
                conn.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Resolves a project's agent selector to a dispatch target.
    #[must_use]
    pub fn resolve(&self, selector: &AgentSelector) -> Resolution {
        self.resolve_filtered(selector, |_| true)
    }

    /// Resolution with an admission predicate for `auto` candidates (the
    /// circuit breaker is advisory: a pinned agent bypasses the filter, an
    /// `auto` pick honors it).
    #[must_use]
    pub fn resolve_filtered(
        &self,
        selector: &AgentSelector,
        allow: impl Fn(&AgentId) -> bool,
    ) -> Resolution {
        match selector {
            AgentSelector::Pinned(agent) => {
                if self.is_online(agent) {
                    Resolution::Online(agent.clone())
                } else {
                    Resolution::QueueOffline(agent.clone())
                }
            }
            AgentSelector::Auto => {
                let order = self.order.lock().expect("registry order lock");
                let online: HashSet<AgentId> = self
                    .connections
                    .iter()
                    .map(|c| c.key().clone())
                    .filter(|agent| allow(agent))
                    .collect();
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                match pick_auto(&order, &online, cursor) {
                    Some(agent) => Resolution::Online(agent),
                    None => Resolution::NoAgents,
                }
            }
        }
    }

    /// Admin snapshot of every registered agent.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.connections
            .iter()
            .map(|conn| AgentSnapshot {
                agent_id: conn.key().as_str().to_string(),
                status: conn.status,
                connected_at: conn.connected_at,
                last_heartbeat: conn.last_heartbeat,
                active_task_ids: conn
                    .active_task_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect()
    }
}

/// Picks the next online agent in insertion order, starting at `cursor`.
/// Pure so `auto` resolution stays unit-testable.
#[must_use]
pub fn pick_auto(
    order: &[AgentId],
    online: &HashSet<AgentId>,
    cursor: usize,
) -> Option<AgentId> {
    if order.is_empty() {
        return None;
    }
    (0..order.len())
        .map(|i| &order[(cursor + i) % order.len()])
        .find(|agent| online.contains(*agent))
        .cloned()
}
