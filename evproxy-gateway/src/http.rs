//! HTTP and WebSocket edge.
//!
//! One axum router carries the whole external surface: the charger CSMS
//! endpoint, the backend control sockets, the session query surface and the
//! small operational endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use evproxy_core::ocpp::version::{negotiate, UpgradeOffer};
use evproxy_core::{
    ClientOp, ProxyError, ServerFrame, SessionFilter, Settings,
};

use crate::arbiter::ArbiterHandle;
use crate::charger::{run_charger_session, ChargerGateway};
use crate::registry::{BackendKind, BackendState, Registry, BACKEND_QUEUE_DEPTH};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub charger: Arc<ChargerGateway>,
    pub registry: Arc<Registry>,
    pub arbiter: ArbiterHandle,
    pub store: StoreHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/charger", get(charger_upgrade))
        // Version hint via path suffix, e.g. /charger/v1.6.
        .route("/charger/{hint}", get(charger_upgrade))
        .route("/backend", get(backend_upgrade))
        .route("/sessions", get(sessions_json))
        .route("/sessions.csv", get(sessions_csv))
        .route("/status", get(status))
        .route("/override", post(override_control))
        .with_state(state)
}

async fn welcome() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>EV Charger Proxy</title>
</head>
<body>
  <h1>EV Charger Proxy</h1>
  <p>Proxy one EV charger to multiple backends and log charging sessions.</p>
  <ul>
    <li><code>/charger</code> &mdash; WebSocket for the charger (ocpp1.6, ocpp2.0.1)</li>
    <li><code>/backend?id=your_backend_id</code> &mdash; WebSocket for backends</li>
    <li><a href="/sessions">/sessions</a> &mdash; session data as JSON</li>
    <li><a href="/sessions.csv">/sessions.csv</a> &mdash; session data as CSV</li>
    <li><a href="/status">/status</a> &mdash; charger, lock and backend status</li>
    <li><code>POST /override</code> &mdash; toggle the administrative override</li>
  </ul>
</body>
</html>
"#,
    )
}

fn upgrade_offer(headers: &HeaderMap, uri: &Uri, params: &HashMap<String, String>) -> UpgradeOffer {
    let subprotocols = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    UpgradeOffer {
        subprotocols,
        version_header: headers
            .get("x-ocpp-version")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        query_version: params.get("version").cloned(),
        path: uri.path().to_string(),
    }
}

async fn charger_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let offer = upgrade_offer(&headers, &uri, &params);
    let version = match negotiate(
        &offer,
        state.settings.proxy.ocpp_version,
        state.settings.proxy.auto_detect_ocpp_version,
    ) {
        Ok(version) => version,
        Err(err) => {
            warn!(error = %err, "charger handshake rejected");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let identity = params
        .get("id")
        .cloned()
        .unwrap_or_else(|| "CP-1".to_string());

    let calls = match state.charger.try_attach(&identity, version).await {
        Ok(calls) => calls,
        // A charger session is already live.
        Err(_) => {
            return (
                StatusCode::CONFLICT,
                "a charger connection is already live",
            )
                .into_response();
        }
    };

    let gateway = state.charger.clone();
    let on_failure = gateway.clone();
    ws.protocols(["ocpp1.6", "ocpp2.0.1"])
        .on_failed_upgrade(move |err| {
            // Release the slot again or the charger could never reconnect.
            warn!(error = %err, "charger upgrade failed");
            tokio::spawn(async move { on_failure.detach().await });
        })
        .on_upgrade(move |socket| {
            run_charger_session(gateway, socket, version, identity, calls)
        })
        .into_response()
}

async fn backend_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id").cloned().filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing id query parameter").into_response();
    };
    ws.on_upgrade(move |socket| backend_session(state, id, socket))
        .into_response()
}

/// Drive one backend socket. This task is the single writer for the socket:
/// fan-out frames from the registry queue and direct replies both leave
/// through it.
async fn backend_session(state: AppState, id: String, mut socket: WebSocket) {
    let (frame_tx, mut frame_rx) = mpsc::channel(BACKEND_QUEUE_DEPTH);
    if let Err(err) = state
        .registry
        .register(&id, BackendKind::Inbound, frame_tx, None)
        .await
    {
        // Duplicate id: refuse the newcomer, the original keeps its slot.
        let _ = socket
            .send(Message::Text(ServerFrame::error(&err, None).encode().into()))
            .await;
        return;
    }
    state.registry.set_state(&id, BackendState::Connected).await;
    info!(backend = %id, "backend connected");

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if socket
                        .send(Message::Text(frame.encode().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            },

            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let op: ClientOp = match serde_json::from_str(text.as_str()) {
                        Ok(op) => op,
                        Err(err) => {
                            // Protocol errors on a backend socket close that
                            // socket only.
                            let frame = ServerFrame::error(
                                &ProxyError::InvalidFrame(err.to_string()),
                                None,
                            );
                            let _ = socket.send(Message::Text(frame.encode().into())).await;
                            break;
                        }
                    };
                    let reply = handle_op(&state, &id, op).await;
                    if let Some(reply) = reply {
                        if socket
                            .send(Message::Text(reply.encode().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    state.registry.unregister(&id).await;
    state.arbiter.backend_gone(&id).await;
    info!(backend = %id, "backend disconnected");
}

async fn handle_op(state: &AppState, id: &str, op: ClientOp) -> Option<ServerFrame> {
    match op {
        ClientOp::Subscribe => {
            state.registry.set_subscribed(id, true).await;
            None
        }
        ClientOp::Unsubscribe => {
            state.registry.set_subscribed(id, false).await;
            None
        }
        ClientOp::RequestControl { .. } => match state.arbiter.request_control(id).await {
            Ok(()) => Some(ServerFrame::granted()),
            Err(err) => Some(ServerFrame::denied(&err)),
        },
        ClientOp::ReleaseControl { request_id } => match state.arbiter.release_control(id).await {
            Ok(()) => Some(ServerFrame::revoked("Released")),
            Err(err) => Some(ServerFrame::error(&err, request_id)),
        },
        ClientOp::Command {
            request_id,
            command,
        } => match state.arbiter.command(id, command).await {
            Ok(result) => Some(ServerFrame::result(request_id, result)),
            Err(err) => Some(ServerFrame::error(&err, request_id)),
        },
    }
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    from: Option<String>,
    to: Option<String>,
    backend_id: Option<String>,
}

fn parse_filter(query: SessionsQuery) -> Result<SessionFilter, Response> {
    let parse_ts = |raw: Option<String>| -> Result<Option<DateTime<Utc>>, Response> {
        match raw {
            None => Ok(None),
            Some(raw) => raw
                .parse::<DateTime<Utc>>()
                .map(Some)
                .map_err(|_| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("not an RFC 3339 timestamp: {raw}"),
                    )
                        .into_response()
                }),
        }
    };
    Ok(SessionFilter {
        from: parse_ts(query.from)?,
        to: parse_ts(query.to)?,
        backend_id: query.backend_id,
    })
}

async fn sessions_json(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let filter = match parse_filter(query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    Json(state.store.list(filter).await).into_response()
}

async fn sessions_csv(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let filter = match parse_filter(query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    let csv = state.store.export_csv(filter).await;
    ([(header::CONTENT_TYPE, "text/csv")], csv).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let snapshot = state.charger.snapshot();
    let backends = state.registry.snapshot().await;
    Json(json!({
        "charger_status": snapshot.status,
        "charger_connected": snapshot.connected,
        "control_holder": state.arbiter.holder(),
        "backends": backends,
        "version": snapshot.version,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct OverrideBody {
    active: bool,
}

async fn override_control(State(state): State<AppState>, body: String) -> Response {
    let parsed: OverrideBody = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid body: {err}")).into_response()
        }
    };
    state.arbiter.set_override(parsed.active).await;
    Json(json!({ "active": parsed.active })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    use evproxy_core::{ProxyConfig, SessionLog};

    use crate::automation::{OverrideSource, PresenceSource};
    use crate::{arbiter, store};

    async fn test_state(dir: &std::path::Path) -> AppState {
        let settings = Settings {
            port: 0,
            ha_url: None,
            ha_token: None,
            log_db_path: dir.join("s.jsonl"),
            proxy: ProxyConfig::default(),
        };
        let charger = Arc::new(ChargerGateway::new());
        let registry = Arc::new(Registry::new());
        let store = store::spawn(SessionLog::open(&settings.log_db_path).unwrap());
        let arbiter = arbiter::spawn(
            settings.proxy.clone(),
            registry.clone(),
            charger.clone(),
            PresenceSource::disabled(),
            OverrideSource::disabled(),
        );
        AppState {
            settings: Arc::new(settings),
            charger,
            registry,
            arbiter,
            store,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn welcome_page_lists_endpoints() {
        let dir = tempdir().unwrap();
        let app = build_router(test_state(dir.path()).await);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("/charger"));
        assert!(text.contains("/sessions.csv"));
    }

    #[tokio::test]
    async fn backend_upgrade_rejects_plain_requests() {
        // A bare GET is not an upgradable connection; the missing-id 400
        // only applies once a real WebSocket handshake reaches the handler.
        let dir = tempdir().unwrap();
        let app = build_router(test_state(dir.path()).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/backend?id=A")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn sessions_csv_filters_by_backend() {
        // S6: header row plus only the matching backend's sessions, in the
        // contract column order.
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;

        state
            .store
            .open_session("A", "1", 1000.0, "2026-03-01T10:00:00Z".parse().unwrap())
            .await
            .unwrap();
        state
            .store
            .close_session("1", 4500.0, "2026-03-01T11:00:00Z".parse().unwrap(), None)
            .await
            .unwrap();
        state
            .store
            .open_session("B", "2", 4500.0, "2026-03-01T12:00:00Z".parse().unwrap())
            .await
            .unwrap();
        state
            .store
            .close_session("2", 5000.0, "2026-03-01T13:00:00Z".parse().unwrap(), None)
            .await
            .unwrap();

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions.csv?backend_id=A")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("session_id,backend_id,start_ts,stop_ts,start_meter_wh,stop_meter_wh,energy_wh,reason")
        );
        assert_eq!(
            lines.next(),
            Some("1,A,2026-03-01T10:00:00Z,2026-03-01T11:00:00Z,1000,4500,3500,")
        );
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn sessions_rejects_bad_timestamps() {
        let dir = tempdir().unwrap();
        let app = build_router(test_state(dir.path()).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions?from=yesterday")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_shape() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let (tx, _rx) = mpsc::channel(4);
        state
            .registry
            .register(
                "grid",
                BackendKind::Outbound,
                tx,
                Some(evproxy_core::ProtocolVersion::V201),
            )
            .await
            .unwrap();

        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["charger_status"], "Unknown");
        assert_eq!(value["control_holder"], serde_json::Value::Null);
        let backends = value["backends"].as_array().unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0]["id"], "grid");
        assert_eq!(backends[0]["state"], "connecting");
        assert!(backends[0]["subscribed"].as_bool().unwrap());
        // Outbound services report their negotiated version.
        assert_eq!(backends[0]["version"], "2.0.1");
    }

    #[tokio::test]
    async fn override_round_trip_and_validation() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/override")
                    .body(Body::from(r#"{"active":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.arbiter.request_control("A").await.unwrap_err(),
            ProxyError::UserOverride
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/override")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
