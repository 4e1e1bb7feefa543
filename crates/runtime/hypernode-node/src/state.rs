//! Single owned node state, published by replacement.
//!
//! Every mutation goes through [`NodeHandle`], which serializes writers inside the
//! watch channel and bumps `version` once per replacement. Readers (health probes,
//! heartbeat payloads, admission) take a cheap clone of the latest value and never
//! block writers.

use chrono::{DateTime, Utc};
use hypernode_types::{LifecycleError, LifecycleState, NodeCapability, NodeStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct NodeHandle {
    tx: Arc<watch::Sender<NodeStatus>>,
}

impl NodeHandle {
    pub fn new(capability: NodeCapability, capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(NodeStatus::new(capability, capacity));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> NodeStatus {
        self.tx.borrow().clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.tx.borrow().lifecycle
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.tx.subscribe()
    }

    /// Move along a lifecycle edge. Returns the previous state.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        let mut outcome = Ok(next);
        self.tx.send_if_modified(|status| {
            let prev = status.lifecycle;
            match prev.transition(next) {
                Ok(state) => {
                    status.lifecycle = state;
                    bump(status);
                    outcome = Ok(prev);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if let Ok(prev) = outcome {
            info!(from = %prev, to = %next, "Node lifecycle transition");
        }
        outcome
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        self.publish(|s| s.in_flight = in_flight);
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.publish(|s| s.capacity = capacity);
    }

    pub fn mark_heartbeat(&self, at: DateTime<Utc>) {
        self.publish(|s| s.last_heartbeat_at = Some(at));
    }

    fn publish(&self, f: impl FnOnce(&mut NodeStatus)) {
        self.tx.send_modify(|status| {
            f(status);
            bump(status);
        });
    }
}

fn bump(status: &mut NodeStatus) {
    status.version += 1;
    status.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> NodeHandle {
        let cap = NodeCapability::cpu_only("test-cpu".into(), 8, 16_000, "linux".into());
        NodeHandle::new(cap, 2)
    }

    #[test]
    fn transitions_bump_version() {
        let node = handle();
        let v0 = node.snapshot().version;
        assert_eq!(
            node.transition(LifecycleState::Registering),
            Ok(LifecycleState::Initializing)
        );
        assert_eq!(node.transition(LifecycleState::Online), Ok(LifecycleState::Registering));
        let snap = node.snapshot();
        assert_eq!(snap.lifecycle, LifecycleState::Online);
        assert_eq!(snap.version, v0 + 2);
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let node = handle();
        let before = node.snapshot();
        assert!(node.transition(LifecycleState::Online).is_err());
        let after = node.snapshot();
        assert_eq!(after.lifecycle, LifecycleState::Initializing);
        assert_eq!(after.version, before.version);
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let node = handle();
        let mut rx = node.subscribe();
        node.set_in_flight(1);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().in_flight, 1);
    }
}
