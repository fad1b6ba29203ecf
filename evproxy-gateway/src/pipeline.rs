//! Charger event pipeline.
//!
//! One task drains the charger event bus and pushes each event through the
//! stages in a fixed order: arbitration first (so revocations reach a
//! backend before the event that caused them), then session accounting,
//! then the fan-out. Per-backend queues in the registry keep a slow
//! consumer from holding anyone else up.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use evproxy_core::{ChargerEvent, ChargerStatus};

use crate::arbiter::ArbiterHandle;
use crate::automation::Notifier;
use crate::charger::ChargerGateway;
use crate::registry::Registry;
use crate::store::StoreHandle;

pub fn spawn(
    gateway: Arc<ChargerGateway>,
    arbiter: ArbiterHandle,
    store: StoreHandle,
    registry: Arc<Registry>,
    notifier: Notifier,
) -> JoinHandle<()> {
    let events = gateway.subscribe();
    tokio::spawn(run(events, arbiter, store, registry, notifier))
}

async fn run(
    mut events: tokio::sync::broadcast::Receiver<ChargerEvent>,
    arbiter: ArbiterHandle,
    store: StoreHandle,
    registry: Arc<Registry>,
    notifier: Notifier,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event pipeline lagged, events lost");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        arbiter.on_charger_event(&event).await;
        account(&event, &arbiter, &store, &notifier).await;
        registry.broadcast(&event).await;
    }
}

/// Derive durable session records from the transaction events, and raise
/// the advisory notifications the automation side expects. A failed log
/// write degrades accounting but never breaks the event stream.
async fn account(
    event: &ChargerEvent,
    arbiter: &ArbiterHandle,
    store: &StoreHandle,
    notifier: &Notifier,
) {
    match event {
        ChargerEvent::TransactionStarted {
            transaction_id,
            meter_start_wh,
            timestamp,
            ..
        } => {
            let backend = arbiter.holder().unwrap_or_default();
            match store
                .open_session(&backend, transaction_id, *meter_start_wh, *timestamp)
                .await
            {
                Ok(session) => {
                    info!(session, backend = %backend, "charging session opened");
                }
                Err(err) => warn!(error = %err, "session open not recorded"),
            }
        }
        ChargerEvent::TransactionEnded {
            transaction_id,
            meter_stop_wh,
            timestamp,
            reason,
        } => {
            match store
                .close_session(transaction_id, *meter_stop_wh, *timestamp, reason.clone())
                .await
            {
                Ok(Some(record)) => {
                    info!(session = record.session_id, "charging session closed");
                    let energy = record.energy_wh().unwrap_or(0.0);
                    let duration = record
                        .stop_ts
                        .map(|stop| (stop - record.start_ts).num_seconds())
                        .unwrap_or(0);
                    notifier
                        .notify(
                            "Charging session ended",
                            &format!(
                                "Provider={}, energy={energy:.0} Wh, duration={duration}s",
                                record.backend_id
                            ),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "session close not recorded"),
            }
        }
        ChargerEvent::StatusChanged {
            status, error_code, ..
        } if matches!(
            status,
            ChargerStatus::Faulted | ChargerStatus::Unavailable
        ) =>
        {
            notifier
                .notify(
                    "Charger fault",
                    &format!(
                        "Status={status}, Error={}",
                        error_code.as_deref().unwrap_or("N/A")
                    ),
                )
                .await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::sync::mpsc;

    use evproxy_core::{ProxyConfig, ServerFrame, SessionFilter, SessionLog};

    use crate::automation::{OverrideSource, PresenceSource};
    use crate::registry::BackendKind;
    use crate::{arbiter, store};

    struct World {
        gateway: Arc<ChargerGateway>,
        arbiter: ArbiterHandle,
        store: StoreHandle,
        registry: Arc<Registry>,
        _dir: tempfile::TempDir,
    }

    async fn world() -> World {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(ChargerGateway::new());
        let registry = Arc::new(Registry::new());
        let store = store::spawn(SessionLog::open(dir.path().join("s.jsonl")).unwrap());
        let arbiter = arbiter::spawn(
            ProxyConfig::default(),
            registry.clone(),
            gateway.clone(),
            PresenceSource::disabled(),
            OverrideSource::disabled(),
        );
        spawn(
            gateway.clone(),
            arbiter.clone(),
            store.clone(),
            registry.clone(),
            Notifier::disabled(),
        );
        World {
            gateway,
            arbiter,
            store,
            registry,
            _dir: dir,
        }
    }

    // Test stand-in for the charger session task.
    fn publish(world: &World, event: ChargerEvent) {
        world.gateway.publish(event);
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn transaction_events_become_sessions() {
        // S1 tail: started + ended events persist a session stamped with
        // the lock holder, and subscribed backends see both events.
        let world = world().await;
        let (tx, mut rx) = mpsc::channel(16);
        world
            .registry
            .register("A", BackendKind::Inbound, tx, None)
            .await
            .unwrap();
        world.arbiter.request_control("A").await.unwrap();

        publish(
            &world,
            ChargerEvent::TransactionStarted {
                transaction_id: "1".into(),
                connector_id: 1,
                id_tag: "ABC".into(),
                meter_start_wh: 1000.0,
                timestamp: "2026-03-01T10:00:00Z".parse().unwrap(),
            },
        );
        publish(
            &world,
            ChargerEvent::TransactionEnded {
                transaction_id: "1".into(),
                meter_stop_wh: 4500.0,
                timestamp: "2026-03-01T11:00:00Z".parse().unwrap(),
                reason: Some("Remote".into()),
            },
        );
        settle().await;

        let sessions = world.store.list(SessionFilter::default()).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].backend_id, "A");
        assert_eq!(sessions[0].start_meter_wh, 1000.0);
        assert_eq!(sessions[0].energy_wh(), Some(3500.0));

        match rx.recv().await {
            Some(ServerFrame::Event {
                event: ChargerEvent::TransactionStarted { .. },
            }) => {}
            other => panic!("expected started event, got {other:?}"),
        }
        match rx.recv().await {
            Some(ServerFrame::Event {
                event: ChargerEvent::TransactionEnded { .. },
            }) => {}
            other => panic!("expected ended event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fault_revocation_precedes_the_fault_event() {
        // S4 ordering: the holder sees the revocation frame before the
        // status event that caused it.
        let world = world().await;
        let (tx, mut rx) = mpsc::channel(16);
        world
            .registry
            .register("A", BackendKind::Inbound, tx, None)
            .await
            .unwrap();
        world.arbiter.request_control("A").await.unwrap();

        publish(
            &world,
            ChargerEvent::StatusChanged {
                connector_id: 1,
                status: ChargerStatus::Faulted,
                error_code: Some("GroundFailure".into()),
            },
        );
        settle().await;

        match rx.recv().await {
            Some(ServerFrame::Control { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some("ChargerFaulted"));
            }
            other => panic!("expected revocation first, got {other:?}"),
        }
        match rx.recv().await {
            Some(ServerFrame::Event {
                event: ChargerEvent::StatusChanged { status, .. },
            }) => assert!(status.is_faulted()),
            other => panic!("expected the fault event second, got {other:?}"),
        }
    }
}
