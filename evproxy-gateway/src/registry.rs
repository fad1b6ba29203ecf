//! Backend registry and event fan-out.
//!
//! Tracks every live backend, inbound and outbound, each with a bounded
//! frame queue drained by that backend's own socket task. The queue is the
//! backpressure isolation boundary: a full queue drops frames for that
//! backend only and bumps its drop counter; the charger and the other
//! backends never notice.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use evproxy_core::{ChargerEvent, ProtocolVersion, ProxyError, ServerFrame};

/// Frames a backend may have in flight before the registry starts dropping.
pub const BACKEND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

struct BackendEntry {
    kind: BackendKind,
    sender: mpsc::Sender<ServerFrame>,
    state: BackendState,
    subscribed: bool,
    dropped: u64,
    /// OCPP version of the forward leg; inbound backends speak the control
    /// protocol and carry none.
    version: Option<ProtocolVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub kind: BackendKind,
    pub state: BackendState,
    pub subscribed: bool,
    pub dropped: u64,
    pub version: Option<ProtocolVersion>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, BackendEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under a unique id. Subscription defaults to on.
    pub async fn register(
        &self,
        id: &str,
        kind: BackendKind,
        sender: mpsc::Sender<ServerFrame>,
        version: Option<ProtocolVersion>,
    ) -> Result<(), ProxyError> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(id) {
            return Err(ProxyError::DuplicateBackend);
        }
        inner.insert(
            id.to_string(),
            BackendEntry {
                kind,
                sender,
                state: BackendState::Connecting,
                subscribed: true,
                dropped: 0,
                version,
            },
        );
        info!(backend = id, ?kind, "backend registered");
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.write().await.remove(id).is_some();
        if removed {
            info!(backend = id, "backend unregistered");
        }
        removed
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn set_state(&self, id: &str, state: BackendState) {
        if let Some(entry) = self.inner.write().await.get_mut(id) {
            entry.state = state;
        }
    }

    pub async fn set_subscribed(&self, id: &str, subscribed: bool) -> bool {
        match self.inner.write().await.get_mut(id) {
            Some(entry) => {
                entry.subscribed = subscribed;
                true
            }
            None => false,
        }
    }

    /// Deliver one event to every subscribed backend, dropping per backend
    /// on overflow.
    pub async fn broadcast(&self, event: &ChargerEvent) {
        let mut inner = self.inner.write().await;
        for (id, entry) in inner.iter_mut() {
            if !entry.subscribed {
                continue;
            }
            let frame = ServerFrame::event(event.clone());
            if entry.sender.try_send(frame).is_err() {
                entry.dropped += 1;
                debug!(backend = %id, dropped = entry.dropped, "backend queue full, event dropped");
            }
        }
    }

    /// Push a control notice (grant revocations and the like) at a single
    /// backend. Same overflow policy as events.
    pub async fn send_to(&self, id: &str, frame: ServerFrame) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(entry) => {
                if entry.sender.try_send(frame).is_err() {
                    entry.dropped += 1;
                    debug!(backend = id, "backend queue full, frame dropped");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<BackendInfo> {
        let inner = self.inner.read().await;
        let mut infos: Vec<BackendInfo> = inner
            .iter()
            .map(|(id, entry)| BackendInfo {
                id: id.clone(),
                kind: entry.kind,
                state: entry.state,
                subscribed: entry.subscribed,
                dropped: entry.dropped,
                version: entry.version,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evproxy_core::ChargerStatus;

    fn status_event(connector_id: i64) -> ChargerEvent {
        ChargerEvent::StatusChanged {
            connector_id,
            status: ChargerStatus::Available,
            error_code: None,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register("A", BackendKind::Inbound, tx, None).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(4);
        let err = registry
            .register("A", BackendKind::Inbound, tx2, None)
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::DuplicateBackend);

        registry.unregister("A").await;
        let (tx3, _rx3) = mpsc::channel(4);
        assert!(registry.register("A", BackendKind::Inbound, tx3, None).await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_respects_subscription_and_order() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register("A", BackendKind::Inbound, tx_a, None).await.unwrap();
        registry.register("B", BackendKind::Inbound, tx_b, None).await.unwrap();
        registry.set_subscribed("B", false).await;

        registry.broadcast(&status_event(1)).await;
        registry.broadcast(&status_event(2)).await;

        match rx_a.recv().await {
            Some(ServerFrame::Event {
                event: ChargerEvent::StatusChanged { connector_id, .. },
            }) => assert_eq!(connector_id, 1),
            other => panic!("unexpected frame: {other:?}"),
        }
        match rx_a.recv().await {
            Some(ServerFrame::Event {
                event: ChargerEvent::StatusChanged { connector_id, .. },
            }) => assert_eq!(connector_id, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_drops_for_that_backend_only() {
        let registry = Registry::new();
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        registry
            .register("slow", BackendKind::Inbound, tx_slow, None)
            .await
            .unwrap();
        registry
            .register("fast", BackendKind::Inbound, tx_fast, None)
            .await
            .unwrap();

        registry.broadcast(&status_event(1)).await;
        registry.broadcast(&status_event(2)).await;
        registry
            .broadcast(&ChargerEvent::Heartbeat { time: Utc::now() })
            .await;

        // Slow backend kept only the first event and counted the drops.
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.try_recv().is_err());
        let info = registry
            .snapshot()
            .await
            .into_iter()
            .find(|b| b.id == "slow")
            .unwrap();
        assert_eq!(info.dropped, 2);

        // Fast backend saw everything.
        assert!(rx_fast.recv().await.is_some());
        assert!(rx_fast.recv().await.is_some());
        assert!(rx_fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_complete() {
        let registry = Registry::new();
        let (tx_b, _rx_b) = mpsc::channel(1);
        let (tx_a, _rx_a) = mpsc::channel(1);
        registry.register("b", BackendKind::Outbound, tx_b, Some(ProtocolVersion::V16)).await.unwrap();
        registry.register("a", BackendKind::Inbound, tx_a, None).await.unwrap();
        registry.set_state("b", BackendState::Connected).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[1].id, "b");
        assert_eq!(snapshot[1].state, BackendState::Connected);
        assert!(snapshot[0].subscribed);
        // Outbound services expose their forward-leg version.
        assert_eq!(snapshot[0].version, None);
        assert_eq!(snapshot[1].version, Some(ProtocolVersion::V16));
    }
}
