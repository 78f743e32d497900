//! Request-id correlation tables for deploy and path-validate round-trips.
//!
//! Bounded maps with a TTL sweep instead of persistent callbacks, so an
//! agent disconnect cannot leak registrations. Path validation hands out a
//! one-shot channel; deploys record where the outcome should be posted.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::{RequestId, WorkflowId};
use crate::protocol::PathValidateResult;

/// Where a deploy outcome goes once the agent reports it.
#[derive(Debug, Clone)]
pub struct DeployRegistration {
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub requested_by: String,
    /// Set when the deploy is a sync-workflow step.
    pub workflow_id: Option<WorkflowId>,
}

struct DeployEntry {
    registration: DeployRegistration,
    registered_at: Instant,
}

/// Outstanding deploy requests.
pub struct DeployTable {
    map: DashMap<RequestId, DeployEntry>,
    ttl: Duration,
}

impl DeployTable {
    /// Creates the table; entries older than `ttl` are swept.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Registers an outstanding deploy.
    pub fn register(&self, request_id: RequestId, registration: DeployRegistration) {
        self.map.insert(
            request_id,
            DeployEntry {
                registration,
                registered_at: Instant::now(),
            },
        );
    }

    /// Consumes a registration; a second result for the same id finds
    /// nothing.
    #[must_use]
    pub fn take(&self, request_id: RequestId) -> Option<DeployRegistration> {
        self.map.remove(&request_id).map(|(_, e)| e.registration)
    }

    /// Drops registrations past the TTL. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.registered_at.elapsed() < self.ttl);
        let swept = before - self.map.len();
        if swept > 0 {
            debug!(swept, "expired deploy registrations dropped");
        }
        swept
    }

    /// Outstanding registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct ValidationEntry {
    sender: oneshot::Sender<PathValidateResult>,
    registered_at: Instant,
}

/// Outstanding path validations, resolved through one-shot channels.
pub struct PathValidations {
    map: DashMap<RequestId, ValidationEntry>,
    ttl: Duration,
}

impl PathValidations {
    /// Creates the table; entries older than `ttl` are swept (dropping the
    /// sender wakes the waiter with an error).
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Registers a request and returns the receiver the caller awaits.
    #[must_use]
    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<PathValidateResult> {
        let (tx, rx) = oneshot::channel();
        self.map.insert(
            request_id,
            ValidationEntry {
                sender: tx,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolves a request. Returns false for unknown or already-resolved
    /// ids (logged and discarded by the router).
    pub fn resolve(&self, request_id: RequestId, result: PathValidateResult) -> bool {
        match self.map.remove(&request_id) {
            Some((_, entry)) => entry.sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Drops registrations past the TTL. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.registered_at.elapsed() < self.ttl);
        before - self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_registration_resolves_once() {
        let table = DeployTable::new(Duration::from_secs(60));
        let id = RequestId::generate();
        table.register(
            id,
            DeployRegistration {
                channel_id: "C1".into(),
                thread_ts: None,
                requested_by: "U1".into(),
                workflow_id: None,
            },
        );
        assert!(table.take(id).is_some());
        assert!(table.take(id).is_none(), "second result finds nothing");
    }

    #[tokio::test]
    async fn path_validation_round_trip() {
        let table = PathValidations::new(Duration::from_secs(60));
        let id = RequestId::generate();
        let rx = table.register(id);

        assert!(table.resolve(
            id,
            PathValidateResult {
                request_id: id,
                success: true,
                exists: true,
                created: false,
                error: None,
            }
        ));
        let result = rx.await.unwrap();
        assert!(result.exists);
        assert!(!table.resolve(
            id,
            PathValidateResult {
                request_id: id,
                success: true,
                exists: true,
                created: false,
                error: None,
            }
        ));
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let table = DeployTable::new(Duration::from_millis(0));
        table.register(
            RequestId::generate(),
            DeployRegistration {
                channel_id: "C1".into(),
                thread_ts: None,
                requested_by: "U1".into(),
                workflow_id: None,
            },
        );
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(table.sweep_expired(), 1);
        assert!(table.is_empty());
    }
}
