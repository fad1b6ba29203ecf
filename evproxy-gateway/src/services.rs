//! Outbound OCPP client supervisor.
//!
//! One long-lived WebSocket client per configured service. On the forward
//! leg the proxy plays the charge point: it boots, heartbeats and re-encodes
//! charger events as OCPP calls. Toward the arbitration engine the service
//! is just another backend; command-class calls the remote sends translate
//! through the same action tables as everything else and go through the
//! normal request-control path.
//!
//! Reconnects back off exponentially from one second to a minute, with 20%
//! jitter so a fleet of services does not thunder back in step.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use evproxy_core::ocpp::adapter::decode_remote_command;
use evproxy_core::ocpp::frame::{ErrorCode, Frame};
use evproxy_core::{
    AuthType, ChargerEvent, ProtocolAdapter, ProxyConfig, ProxyError, ServerFrame, ServiceConfig,
};

use crate::arbiter::ArbiterHandle;
use crate::registry::{BackendKind, BackendState, Registry, BACKEND_QUEUE_DEPTH};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Vendor and model the proxy reports on its forward legs.
const PROXY_VENDOR: &str = "OCPPProxy";
const PROXY_MODEL: &str = "EVProxy";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Spawn one supervisor task per enabled service.
pub fn spawn_all(
    config: &ProxyConfig,
    registry: Arc<Registry>,
    arbiter: ArbiterHandle,
) -> Vec<JoinHandle<()>> {
    config
        .ocpp_services
        .iter()
        .filter(|s| s.enabled)
        .cloned()
        .map(|service| {
            let registry = registry.clone();
            let arbiter = arbiter.clone();
            tokio::spawn(run_service(service, registry, arbiter))
        })
        .collect()
}

async fn run_service(config: ServiceConfig, registry: Arc<Registry>, arbiter: ArbiterHandle) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        info!(service = %config.id, url = %config.url, "connecting to OCPP service");
        match connect(&config).await {
            Ok(stream) => {
                backoff = INITIAL_BACKOFF;
                let registered = match serve(&config, stream, &registry, &arbiter).await {
                    Ok(()) => {
                        info!(service = %config.id, "service connection closed");
                        true
                    }
                    // The id belongs to someone else; tearing it down here
                    // would evict them.
                    Err(ProxyError::DuplicateBackend) => {
                        warn!(service = %config.id, "backend id already taken");
                        false
                    }
                    Err(err) => {
                        warn!(service = %config.id, error = %err, "service connection lost");
                        true
                    }
                };
                if registered && registry.unregister(&config.id).await {
                    arbiter.backend_gone(&config.id).await;
                }
            }
            Err(err) => {
                warn!(service = %config.id, error = %err, "service connect failed");
            }
        }

        let delay = jittered(backoff);
        debug!(service = %config.id, ?delay, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Apply 20% jitter around the nominal backoff.
fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

async fn connect(config: &ServiceConfig) -> Result<WsStream, ProxyError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        config
            .version
            .subprotocol()
            .parse()
            .map_err(|_| ProxyError::HandshakeFailed("bad subprotocol".into()))?,
    );
    match config.auth_type {
        AuthType::None => {}
        AuthType::Basic => {
            let (Some(username), Some(password)) = (&config.username, &config.password) else {
                return Err(ProxyError::ConfigInvalid(format!(
                    "service {} lacks basic credentials",
                    config.id
                )));
            };
            let credentials = BASE64_STANDARD.encode(format!("{username}:{password}"));
            headers.insert(
                AUTHORIZATION,
                format!("Basic {credentials}")
                    .parse()
                    .map_err(|_| ProxyError::HandshakeFailed("bad credentials".into()))?,
            );
        }
        AuthType::Token => {
            let Some(token) = &config.token else {
                return Err(ProxyError::ConfigInvalid(format!(
                    "service {} lacks a token",
                    config.id
                )));
            };
            headers.insert(
                AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ProxyError::HandshakeFailed("bad token".into()))?,
            );
        }
    }

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;

    let accepted = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(config.version.subprotocol()) {
        warn!(
            service = %config.id,
            accepted = ?accepted,
            "service did not accept the {} subprotocol",
            config.version.subprotocol()
        );
    }

    Ok(stream)
}

async fn serve(
    config: &ServiceConfig,
    stream: WsStream,
    registry: &Arc<Registry>,
    arbiter: &ArbiterHandle,
) -> Result<(), ProxyError> {
    let (mut sink, mut stream) = stream.split();
    let mut adapter = ProtocolAdapter::new(config.version);

    let (frame_tx, mut frame_rx) = mpsc::channel(BACKEND_QUEUE_DEPTH);
    registry
        .register(&config.id, BackendKind::Outbound, frame_tx, Some(config.version))
        .await?;
    registry.set_state(&config.id, BackendState::Connected).await;

    // We are the charge point on this leg: introduce ourselves.
    send_event(
        &mut adapter,
        &mut sink,
        &ChargerEvent::BootNotification {
            vendor: PROXY_VENDOR.to_string(),
            model: PROXY_MODEL.to_string(),
        },
    )
    .await?;

    let mut heartbeat = interval(HEARTBEAT_PERIOD);
    heartbeat.tick().await; // first tick is immediate, skip it

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(ServerFrame::Event { event }) => {
                    send_event(&mut adapter, &mut sink, &event).await?;
                }
                Some(ServerFrame::Control { status, reason }) => {
                    debug!(service = %config.id, ?status, ?reason, "control update");
                }
                Some(_) => {}
                None => return Ok(()),
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_remote_frame(config, text.as_str(), &mut sink, arbiter).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Err(ProxyError::ConnectionLost),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(service = %config.id, error = %err, "socket error");
                    return Err(ProxyError::ConnectionLost);
                }
            },

            _ = heartbeat.tick() => {
                send_event(
                    &mut adapter,
                    &mut sink,
                    &ChargerEvent::Heartbeat { time: Utc::now() },
                )
                .await?;
            }
        }
    }
}

async fn send_event(
    adapter: &mut ProtocolAdapter,
    sink: &mut WsSink,
    event: &ChargerEvent,
) -> Result<(), ProxyError> {
    match adapter.encode_event(event) {
        Ok(Some((_, text))) => sink
            .send(Message::text(text))
            .await
            .map_err(|_| ProxyError::ConnectionLost),
        Ok(None) => Ok(()),
        Err(err) => {
            // Unrepresentable event on this dialect; skip it.
            debug!(error = %err, "event not forwarded");
            Ok(())
        }
    }
}

/// React to a frame from the remote service. Calls carrying command actions
/// go through arbitration under this service's backend id; everything else
/// is acknowledged or logged.
async fn handle_remote_frame(
    config: &ServiceConfig,
    text: &str,
    sink: &mut WsSink,
    arbiter: &ArbiterHandle,
) -> Result<(), ProxyError> {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(service = %config.id, error = %err, "unparseable frame from service");
            return Ok(());
        }
    };

    match frame {
        Frame::Call {
            message_id,
            action,
            payload,
        } => {
            let reply = match decode_remote_command(config.version, &action, &payload) {
                Ok(command) => {
                    let result = request_and_run(config, arbiter, command).await;
                    match result {
                        Ok(_) => Frame::result(message_id, json!({"status": "Accepted"})),
                        Err(err) => {
                            debug!(service = %config.id, reason = err.code(), "command rejected");
                            Frame::result(message_id, json!({"status": "Rejected"}))
                        }
                    }
                }
                Err(ProxyError::NotImplemented(action)) => {
                    Frame::error(message_id, ErrorCode::NotImplemented, action)
                }
                Err(err) => Frame::error(message_id, ErrorCode::FormatViolation, err.to_string()),
            };
            sink.send(Message::text(reply.encode()))
                .await
                .map_err(|_| ProxyError::ConnectionLost)
        }
        Frame::CallResult { message_id, .. } => {
            // Acks for our boot, heartbeat and event forwards.
            debug!(service = %config.id, message_id = %message_id, "call acknowledged");
            Ok(())
        }
        Frame::CallError {
            code, description, ..
        } => {
            warn!(service = %config.id, code = %code, description = %description, "service rejected a call");
            Ok(())
        }
    }
}

/// Acquire the lock if this service does not already hold it, then run the
/// command. The service is subject to the same policy as any backend.
async fn request_and_run(
    config: &ServiceConfig,
    arbiter: &ArbiterHandle,
    command: evproxy_core::ChargerCommand,
) -> Result<serde_json::Value, ProxyError> {
    if arbiter.holder().as_deref() != Some(config.id.as_str()) {
        arbiter.request_control(&config.id).await?;
    }
    arbiter.command(&config.id, command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[5], Duration::from_secs(32));
        assert_eq!(seen[6], Duration::from_secs(60));
        assert_eq!(seen[7], Duration::from_secs(60));
    }
}
