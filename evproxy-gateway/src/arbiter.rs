//! Control arbitration engine.
//!
//! A single actor owns the control lock. All mutations flow through its
//! message queue, which gives one linearization order for grants, releases,
//! commands, disconnects and charger events. The actor never awaits charger
//! I/O itself: commands are handed to a task that talks to the charger
//! session and answers the backend directly.
//!
//! Lock state machine: `Free` -> `Held(id)` -> `Free`, with `Suspended`
//! entered from anywhere on a charger fault and left when the charger
//! reports a non-faulted status again. While an administrative override is
//! active the override itself is the effective holder and every backend
//! request is turned away with `UserOverride`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use evproxy_core::{ChargerCommand, ChargerEvent, ProxyConfig, ProxyError, ServerFrame};

use crate::automation::{OverrideSource, PresenceSource};
use crate::charger::{ChargerGateway, CALL_TIMEOUT};
use crate::registry::Registry;

/// Extra slack a backend command gets on top of the charger call deadline.
const COMMAND_MARGIN: Duration = Duration::from_secs(1);

enum ArbiterMsg {
    Request {
        backend_id: String,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Release {
        backend_id: String,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Command {
        backend_id: String,
        command: ChargerCommand,
        reply: oneshot::Sender<Result<Value, ProxyError>>,
    },
    BackendGone {
        backend_id: String,
    },
    SetOverride {
        active: bool,
        reply: oneshot::Sender<()>,
    },
    ChargerEvent {
        event: ChargerEvent,
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<ArbiterMsg>,
    holder: watch::Receiver<Option<String>>,
}

impl ArbiterHandle {
    pub async fn request_control(&self, backend_id: &str) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ArbiterMsg::Request {
                backend_id: backend_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| ProxyError::ConnectionLost)?;
        rx.await.map_err(|_| ProxyError::ConnectionLost)?
    }

    pub async fn release_control(&self, backend_id: &str) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ArbiterMsg::Release {
                backend_id: backend_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| ProxyError::ConnectionLost)?;
        rx.await.map_err(|_| ProxyError::ConnectionLost)?
    }

    pub async fn command(
        &self,
        backend_id: &str,
        command: ChargerCommand,
    ) -> Result<Value, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ArbiterMsg::Command {
                backend_id: backend_id.to_string(),
                command,
                reply,
            })
            .await
            .map_err(|_| ProxyError::ConnectionLost)?;
        rx.await.map_err(|_| ProxyError::ConnectionLost)?
    }

    pub async fn backend_gone(&self, backend_id: &str) {
        let _ = self
            .tx
            .send(ArbiterMsg::BackendGone {
                backend_id: backend_id.to_string(),
            })
            .await;
    }

    pub async fn set_override(&self, active: bool) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ArbiterMsg::SetOverride { active, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Feed one charger event through the engine and wait until it has been
    /// acted on. The event pipeline calls this before fanning the event out,
    /// so revocation frames reach a backend ahead of the event that caused
    /// them.
    pub async fn on_charger_event(&self, event: &ChargerEvent) {
        let (done, rx) = oneshot::channel();
        if self
            .tx
            .send(ArbiterMsg::ChargerEvent {
                event: event.clone(),
                done,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.borrow().clone()
    }

    pub fn watch_holder(&self) -> watch::Receiver<Option<String>> {
        self.holder.clone()
    }
}

enum LockState {
    Free,
    Held {
        id: String,
        since: DateTime<Utc>,
        deadline: Instant,
    },
    Suspended,
}

pub fn spawn(
    config: ProxyConfig,
    registry: Arc<Registry>,
    charger: Arc<ChargerGateway>,
    presence: PresenceSource,
    override_source: OverrideSource,
) -> ArbiterHandle {
    let (tx, rx) = mpsc::channel(64);
    let (holder_tx, holder_rx) = watch::channel(None);
    let (cancel, _) = broadcast::channel(4);

    let source_override = override_source.is_active();
    let arbiter = Arbiter {
        config,
        registry,
        charger,
        presence,
        override_source,
        state: LockState::Free,
        rest_override: false,
        source_override,
        last_request: HashMap::new(),
        holder_tx,
        cancel,
        rx,
    };
    tokio::spawn(arbiter.run());

    ArbiterHandle {
        tx,
        holder: holder_rx,
    }
}

struct Arbiter {
    config: ProxyConfig,
    registry: Arc<Registry>,
    charger: Arc<ChargerGateway>,
    presence: PresenceSource,
    override_source: OverrideSource,
    state: LockState,
    rest_override: bool,
    source_override: bool,
    last_request: HashMap<String, Instant>,
    holder_tx: watch::Sender<Option<String>>,
    cancel: broadcast::Sender<()>,
    rx: mpsc::Receiver<ArbiterMsg>,
}

impl Arbiter {
    async fn run(mut self) {
        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    async fn handle(&mut self, msg: ArbiterMsg) {
        match msg {
            ArbiterMsg::Request { backend_id, reply } => {
                let result = self.evaluate_request(&backend_id);
                if result.is_ok() {
                    self.grant(&backend_id).await;
                } else if let Err(err) = &result {
                    debug!(backend = %backend_id, reason = err.code(), "control denied");
                }
                let _ = reply.send(result);
            }
            ArbiterMsg::Release { backend_id, reply } => {
                let result = match &self.state {
                    LockState::Held { id, .. } if *id == backend_id => {
                        info!(backend = %backend_id, "control released");
                        self.free();
                        Ok(())
                    }
                    _ => Err(ProxyError::NotLockHolder),
                };
                let _ = reply.send(result);
            }
            ArbiterMsg::Command {
                backend_id,
                command,
                reply,
            } => self.run_command(backend_id, command, reply),
            ArbiterMsg::BackendGone { backend_id } => {
                self.last_request.remove(&backend_id);
                if let LockState::Held { id, .. } = &self.state {
                    if *id == backend_id {
                        info!(backend = %backend_id, "holder disconnected, lock released");
                        self.free();
                    }
                }
            }
            ArbiterMsg::SetOverride { active, reply } => {
                self.rest_override = active;
                info!(active, "administrative override toggled");
                self.enforce_override().await;
                let _ = reply.send(());
            }
            ArbiterMsg::ChargerEvent { event, done } => {
                self.apply_charger_event(&event).await;
                let _ = done.send(());
            }
        }
    }

    fn override_active(&self) -> bool {
        self.rest_override || self.source_override
    }

    /// Policy pipeline for a control request. The rate-limit clock is
    /// bumped whenever the rule is reached, on acceptance and rejection
    /// alike.
    fn evaluate_request(&mut self, backend_id: &str) -> Result<(), ProxyError> {
        if self.override_active() {
            return Err(ProxyError::UserOverride);
        }
        if matches!(self.state, LockState::Suspended) {
            return Err(ProxyError::ChargerFaulted);
        }

        let preferred = self.config.preferred_provider.as_deref();

        if !self.config.allow_shared_charging && Some(backend_id) != preferred {
            return Err(ProxyError::ProviderNotAllowed);
        }
        if self.config.disallowed_providers.iter().any(|p| p == backend_id) {
            return Err(ProxyError::ProviderBlocked);
        }
        if !self.config.allowed_providers.is_empty()
            && !self.config.allowed_providers.iter().any(|p| p == backend_id)
        {
            return Err(ProxyError::ProviderNotAllowed);
        }

        let now = Instant::now();
        let limit = Duration::from_secs(self.config.rate_limit_seconds);
        let last = self.last_request.insert(backend_id.to_string(), now);
        if let Some(last) = last {
            if now.duration_since(last) < limit {
                return Err(ProxyError::RateLimited);
            }
        }

        if self.presence.is_configured()
            && self.presence.is_present()
            && Some(backend_id) != preferred
        {
            return Err(ProxyError::PresenceBlocked);
        }

        match &self.state {
            LockState::Free => Ok(()),
            LockState::Held { id, .. } if id == backend_id => Ok(()),
            LockState::Held { id, .. } => {
                // Preemption is reserved for the preferred provider.
                if Some(backend_id) == preferred && Some(id.as_str()) != preferred {
                    Ok(())
                } else {
                    Err(ProxyError::AlreadyHeld)
                }
            }
            LockState::Suspended => Err(ProxyError::ChargerFaulted),
        }
    }

    async fn grant(&mut self, backend_id: &str) {
        if let LockState::Held { id, .. } = &self.state {
            if id != backend_id {
                let displaced = id.clone();
                self.cancel_inflight();
                self.registry
                    .send_to(&displaced, ServerFrame::revoked(ProxyError::Preempted.code()))
                    .await;
                info!(from = %displaced, to = %backend_id, "lock preempted");
            }
        }
        self.state = LockState::Held {
            id: backend_id.to_string(),
            since: Utc::now(),
            deadline: Instant::now() + Duration::from_secs(self.config.lock_timeout_seconds),
        };
        self.holder_tx.send_replace(Some(backend_id.to_string()));
        info!(backend = %backend_id, "control granted");
    }

    fn free(&mut self) {
        self.state = LockState::Free;
        self.holder_tx.send_replace(None);
        self.cancel_inflight();
    }

    fn cancel_inflight(&mut self) {
        let _ = self.cancel.send(());
    }

    fn run_command(
        &mut self,
        backend_id: String,
        command: ChargerCommand,
        reply: oneshot::Sender<Result<Value, ProxyError>>,
    ) {
        match &mut self.state {
            LockState::Held { id, deadline, .. } if *id == backend_id => {
                // Holder is active, push the auto-expiry out.
                *deadline =
                    Instant::now() + Duration::from_secs(self.config.lock_timeout_seconds);

                let charger = self.charger.clone();
                let mut cancel = self.cancel.subscribe();
                // The actor must not await charger I/O; the command runs in
                // its own task and answers the backend directly.
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        result = tokio::time::timeout(
                            CALL_TIMEOUT + COMMAND_MARGIN,
                            charger.call(command),
                        ) => match result {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ProxyError::CallTimeout),
                        },
                        _ = cancel.recv() => Err(ProxyError::Preempted),
                    };
                    let _ = reply.send(outcome);
                });
            }
            _ => {
                let _ = reply.send(Err(ProxyError::NotLockHolder));
            }
        }
    }

    async fn apply_charger_event(&mut self, event: &ChargerEvent) {
        match event {
            ChargerEvent::StatusChanged { status, .. } => {
                if status.is_faulted() {
                    if let LockState::Held { id, .. } = &self.state {
                        let holder = id.clone();
                        self.cancel_inflight();
                        self.registry
                            .send_to(
                                &holder,
                                ServerFrame::revoked(ProxyError::ChargerFaulted.code()),
                            )
                            .await;
                        warn!(backend = %holder, "control revoked, charger faulted");
                    }
                    self.state = LockState::Suspended;
                    self.holder_tx.send_replace(None);
                } else if matches!(self.state, LockState::Suspended) {
                    info!("charger recovered, lock free");
                    self.state = LockState::Free;
                }
            }
            ChargerEvent::ChargerDisconnected => {
                if let LockState::Held { id, .. } = &self.state {
                    let holder = id.clone();
                    self.cancel_inflight();
                    self.registry
                        .send_to(
                            &holder,
                            ServerFrame::revoked(ProxyError::ConnectionLost.code()),
                        )
                        .await;
                }
                self.state = LockState::Free;
                self.holder_tx.send_replace(None);
            }
            _ => {}
        }
    }

    async fn enforce_override(&mut self) {
        if !self.override_active() {
            return;
        }
        if let LockState::Held { id, .. } = &self.state {
            let holder = id.clone();
            self.cancel_inflight();
            self.registry
                .send_to(&holder, ServerFrame::revoked(ProxyError::UserOverride.code()))
                .await;
            info!(backend = %holder, "control revoked by override");
            self.free();
        }
    }

    async fn on_tick(&mut self) {
        let source = self.override_source.is_active();
        if source != self.source_override {
            self.source_override = source;
            info!(active = source, "override source changed");
            self.enforce_override().await;
        }

        if let LockState::Held { id, deadline, since } = &self.state {
            if Instant::now() >= *deadline {
                let holder = id.clone();
                let held_for = Utc::now() - *since;
                info!(
                    backend = %holder,
                    held_secs = held_for.num_seconds(),
                    "lock expired without activity"
                );
                self.cancel_inflight();
                self.registry
                    .send_to(&holder, ServerFrame::revoked("Expired"))
                    .await;
                self.free();
            }
        }
    }
}
