//! Offline-queue drain service.
//!
//! Durable rows live in [`crate::storage::OfflineQueueStore`]; this service
//! owns the delivery protocol: drain on (re)connect and on a periodic tick,
//! in strict enqueue order, halting an agent's drain at the first failed
//! hand-off so ordering survives flaky connections.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::StorageResult;
use crate::domain::AgentId;
use crate::protocol::Frame;
use crate::registry::{AgentEvent, AgentRegistry};
use crate::storage::OfflineQueueStore;

/// Outcome of one per-agent drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub delivered: usize,
    /// True when a send failure stopped the pass early.
    pub halted: bool,
}

/// Durable per-agent outbox with TTL and ordered redelivery.
pub struct OfflineQueue {
    store: OfflineQueueStore,
    registry: Arc<AgentRegistry>,
    ttl: Duration,
    delivered_retention: Duration,
}

impl OfflineQueue {
    /// Creates the drain service.
    #[must_use]
    pub fn new(
        store: OfflineQueueStore,
        registry: Arc<AgentRegistry>,
        ttl: Duration,
        delivered_retention: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            ttl,
            delivered_retention,
        }
    }

    /// Encodes and parks a frame for an offline agent.
    pub async fn enqueue(&self, agent: &AgentId, frame: &Frame) -> StorageResult<i64> {
        let payload = frame.encode().map_err(|e| crate::database::StorageError::CorruptRow {
            table: "offline_queue".to_string(),
            reason: e.to_string(),
        })?;
        let id = self
            .store
            .enqueue(agent, frame.type_name(), &payload, self.ttl)
            .await?;
        info!(agent = %agent, frame = frame.type_name(), row = id, "frame parked in offline queue");
        Ok(id)
    }

    /// Drains pending rows for one agent in insertion order. The first
    /// failed hand-off halts the pass; the remainder stays queued for the
    /// next tick or reconnect.
    pub async fn drain_agent(&self, agent: &AgentId) -> StorageResult<DrainOutcome> {
        let pending = self.store.find_pending_by_agent(agent).await?;
        if pending.is_empty() {
            return Ok(DrainOutcome {
                delivered: 0,
                halted: false,
            });
        }

        let mut delivered = 0;
        for entry in pending {
            let frame = match Frame::decode(&entry.payload) {
                Ok(frame) => frame,
                Err(err) => {
                    // Undecodable rows would wedge the queue forever; mark
                    // them delivered and move on.
                    warn!(agent = %agent, row = entry.id, error = %err, "dropping undecodable queued frame");
                    self.store.mark_delivered(entry.id).await?;
                    continue;
                }
            };
            if self.registry.send(agent, frame) {
                self.store.mark_delivered(entry.id).await?;
                delivered += 1;
            } else {
                debug!(agent = %agent, row = entry.id, "drain halted at first failed send");
                return Ok(DrainOutcome {
                    delivered,
                    halted: true,
                });
            }
        }
        if delivered > 0 {
            info!(agent = %agent, delivered, "offline queue drained");
        }
        Ok(DrainOutcome {
            delivered,
            halted: false,
        })
    }

    /// One sweep of expired undelivered rows and aged delivered rows.
    pub async fn sweep(&self) -> StorageResult<u64> {
        self.store.clean_expired(self.delivered_retention).await
    }

    /// Service loop: drain on connect edges and every `tick`, sweep expired
    /// rows alongside.
    pub async fn run(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        let mut events = self.registry.subscribe();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, "offline queue sweep failed");
                    }
                    match self.store.pending_counts().await {
                        Ok(counts) => {
                            for (agent, _) in counts {
                                if self.registry.is_online(&agent) {
                                    if let Err(err) = self.drain_agent(&agent).await {
                                        warn!(agent = %agent, error = %err, "drain failed");
                                    }
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "pending count query failed"),
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(AgentEvent::Connected(agent)) => {
                            if let Err(err) = self.drain_agent(&agent).await {
                                warn!(agent = %agent, error = %err, "drain on connect failed");
                            }
                        }
                        Ok(AgentEvent::Disconnected(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "registry event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                () = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::protocol::TaskCancel;
    use crate::domain::TaskId;
    use tokio::sync::mpsc;

    async fn queue() -> (Arc<AgentRegistry>, OfflineQueue) {
        let db = Database::in_memory().await.unwrap();
        let store = OfflineQueueStore::new(db);
        store.ensure_schema().await.unwrap();
        let registry = Arc::new(AgentRegistry::new());
        let queue = OfflineQueue::new(
            store,
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        (registry, queue)
    }

    fn cancel_frame(reason: &str) -> Frame {
        Frame::TaskCancel(TaskCancel {
            task_id: TaskId::generate(),
            reason: reason.to_string(),
        })
    }

    #[tokio::test]
    async fn drain_preserves_enqueue_order() {
        let (registry, queue) = queue().await;
        let agent = AgentId::try_new("worker-1".to_string()).unwrap();

        for i in 0..4 {
            queue.enqueue(&agent, &cancel_frame(&format!("r{i}"))).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        registry.register(agent.clone(), tx, CancellationToken::new());

        let outcome = queue.drain_agent(&agent).await.unwrap();
        assert_eq!(outcome, DrainOutcome { delivered: 4, halted: false });

        let mut reasons = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::TaskCancel(payload) = frame {
                reasons.push(payload.reason);
            }
        }
        assert_eq!(reasons, vec!["r0", "r1", "r2", "r3"]);

        // Nothing left pending; a second drain is a no-op.
        let again = queue.drain_agent(&agent).await.unwrap();
        assert_eq!(again.delivered, 0);
    }

    #[tokio::test]
    async fn send_failure_halts_the_drain_head_of_line() {
        let (registry, queue) = queue().await;
        let agent = AgentId::try_new("worker-1".to_string()).unwrap();

        for i in 0..5 {
            queue.enqueue(&agent, &cancel_frame(&format!("r{i}"))).await.unwrap();
        }

        // Queue of capacity 2: the third hand-off fails.
        let (tx, mut rx) = mpsc::channel(2);
        registry.register(agent.clone(), tx, CancellationToken::new());

        let outcome = queue.drain_agent(&agent).await.unwrap();
        assert_eq!(outcome, DrainOutcome { delivered: 2, halted: true });

        // Free the queue and drain again: the remainder arrives in order.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        let outcome = queue.drain_agent(&agent).await.unwrap();
        assert_eq!(outcome.delivered, 3);
    }

    #[tokio::test]
    async fn offline_agent_delivers_nothing() {
        let (_registry, queue) = queue().await;
        let agent = AgentId::try_new("ghost".to_string()).unwrap();
        queue.enqueue(&agent, &cancel_frame("r")).await.unwrap();
        let outcome = queue.drain_agent(&agent).await.unwrap();
        assert_eq!(outcome, DrainOutcome { delivered: 0, halted: true });
    }
}
