//! Charger session manager.
//!
//! Exactly one charger connection exists at a time. The session task owns
//! the WebSocket exclusively: it serializes all writes, keeps the
//! pending-call table, publishes decoded events on the broadcast bus and
//! answers charger-initiated calls with the replies the adapter builds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use evproxy_core::ocpp::frame::{salvage_message_id, ErrorCode, Frame};
use evproxy_core::{
    ChargerCommand, ChargerEvent, ChargerState, ChargerStatus, Decoded, ProtocolAdapter,
    ProtocolVersion, ProxyError,
};

/// Default deadline for calls the proxy sends to the charger.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_BUS_DEPTH: usize = 256;
const CALL_QUEUE_DEPTH: usize = 16;

/// What `/status` and the HTTP edge need to know about the charger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChargerSnapshot {
    pub connected: bool,
    pub identity: Option<String>,
    pub version: Option<ProtocolVersion>,
    pub status: ChargerStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One in-flight command heading for the charger.
pub struct CallRequest {
    pub command: ChargerCommand,
    pub reply: oneshot::Sender<Result<Value, ProxyError>>,
}

struct ActiveCharger {
    calls: mpsc::Sender<CallRequest>,
}

/// Shared entry point to the charger side: holds the single-connection
/// slot, the event bus and the status snapshot.
pub struct ChargerGateway {
    events: broadcast::Sender<ChargerEvent>,
    active: Mutex<Option<ActiveCharger>>,
    snapshot: watch::Sender<ChargerSnapshot>,
}

impl Default for ChargerGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargerGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_DEPTH);
        let (snapshot, _) = watch::channel(ChargerSnapshot::default());
        Self {
            events,
            active: Mutex::new(None),
            snapshot,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChargerEvent> {
        self.events.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ChargerSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ChargerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Claim the charger slot. Fails while another session is live; the
    /// HTTP edge turns that into a 409.
    pub async fn try_attach(
        &self,
        identity: &str,
        version: ProtocolVersion,
    ) -> Result<mpsc::Receiver<CallRequest>, ProxyError> {
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            return Err(ProxyError::HandshakeFailed(
                "a charger connection is already live".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        *slot = Some(ActiveCharger { calls: tx });
        self.snapshot.send_replace(ChargerSnapshot {
            connected: true,
            identity: Some(identity.to_string()),
            version: Some(version),
            status: ChargerStatus::Unknown,
            last_seen: Some(Utc::now()),
        });
        Ok(rx)
    }

    pub(crate) async fn detach(&self) {
        *self.active.lock().await = None;
        self.snapshot.send_replace(ChargerSnapshot::default());
    }

    /// Send a command to the charger and wait for its answer. The session
    /// task enforces the call deadline; connection loss completes all
    /// pending calls with `ConnectionLost`.
    pub async fn call(&self, command: ChargerCommand) -> Result<Value, ProxyError> {
        let sender = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.calls.clone())
            .ok_or(ProxyError::ChargerUnavailable)?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(CallRequest { command, reply: tx })
            .await
            .map_err(|_| ProxyError::ChargerUnavailable)?;
        rx.await.map_err(|_| ProxyError::ConnectionLost)?
    }

    pub(crate) fn publish(&self, event: ChargerEvent) {
        // No receivers just means nobody is listening yet.
        let _ = self.events.send(event);
    }

    fn note_event(&self, event: &ChargerEvent) {
        self.snapshot.send_modify(|snap| {
            snap.last_seen = Some(Utc::now());
            if let ChargerEvent::StatusChanged { status, .. } = event {
                snap.status = *status;
            }
        });
    }
}

struct PendingCall {
    reply: oneshot::Sender<Result<Value, ProxyError>>,
    deadline: Instant,
}

/// Run one charger connection to completion. Spawned by the HTTP edge after
/// a successful upgrade and slot claim.
pub async fn run_charger_session(
    gateway: Arc<ChargerGateway>,
    mut socket: WebSocket,
    version: ProtocolVersion,
    identity: String,
    mut calls: mpsc::Receiver<CallRequest>,
) {
    info!(charger = %identity, version = %version, "charger connected");

    let mut adapter = ProtocolAdapter::new(version);
    let mut state = ChargerState::default();
    let mut pending: HashMap<String, PendingCall> = HashMap::new();
    let mut sweep = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match adapter.decode(text.as_str(), &mut state) {
                        Ok(Decoded::Event { event, reply }) => {
                            if socket.send(Message::Text(reply.encode().into())).await.is_err() {
                                break;
                            }
                            debug!(charger = %identity, event = event.kind(), "charger event");
                            gateway.note_event(&event);
                            gateway.publish(event);
                        }
                        Ok(Decoded::Reply { reply }) => {
                            if socket.send(Message::Text(reply.encode().into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(Decoded::CallAnswered { message_id, outcome }) => {
                            match pending.remove(&message_id) {
                                Some(call) => {
                                    let _ = call.reply.send(outcome);
                                }
                                None => {
                                    debug!(message_id, "answer for unknown or expired call");
                                }
                            }
                        }
                        Err(err) => {
                            warn!(charger = %identity, error = %err, "invalid frame from charger");
                            match salvage_message_id(text.as_str()) {
                                Some(id) => {
                                    let reply =
                                        Frame::error(id, ErrorCode::ProtocolError, err.to_string());
                                    if socket
                                        .send(Message::Text(reply.encode().into()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                // No message id to answer on: the frame is
                                // unrecoverable, drop the connection.
                                None => break,
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(charger = %identity, error = %err, "charger socket error");
                    break;
                }
            },

            Some(request) = calls.recv() => {
                match adapter.encode_command(&request.command) {
                    Ok((message_id, text)) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            let _ = request.reply.send(Err(ProxyError::ConnectionLost));
                            break;
                        }
                        pending.insert(message_id, PendingCall {
                            reply: request.reply,
                            deadline: Instant::now() + CALL_TIMEOUT,
                        });
                    }
                    Err(err) => {
                        let _ = request.reply.send(Err(err));
                    }
                }
            },

            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<String> = pending
                    .iter()
                    .filter(|(_, call)| call.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some(call) = pending.remove(&id) {
                        warn!(message_id = %id, "charger call timed out");
                        let _ = call.reply.send(Err(ProxyError::CallTimeout));
                    }
                }
            }
        }
    }

    for (_, call) in pending.drain() {
        let _ = call.reply.send(Err(ProxyError::ConnectionLost));
    }
    gateway.detach().await;
    gateway.publish(ChargerEvent::ChargerDisconnected);
    info!(charger = %identity, "charger disconnected");
}
