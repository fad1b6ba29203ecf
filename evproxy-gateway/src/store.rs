//! Session store actor.
//!
//! The durable log has exactly one writer: this task. Everyone else, the
//! event pipeline included, talks to it through the handle; HTTP readers
//! get cloned records back.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use evproxy_core::{ProxyError, SessionFilter, SessionLog, SessionRecord};

enum StoreMsg {
    Open {
        backend_id: String,
        transaction_id: String,
        start_meter_wh: f64,
        start_ts: DateTime<Utc>,
        reply: oneshot::Sender<Result<u64, ProxyError>>,
    },
    Close {
        transaction_id: String,
        stop_meter_wh: f64,
        stop_ts: DateTime<Utc>,
        reason: Option<String>,
        reply: oneshot::Sender<Result<Option<SessionRecord>, ProxyError>>,
    },
    List {
        filter: SessionFilter,
        reply: oneshot::Sender<Vec<SessionRecord>>,
    },
    Csv {
        filter: SessionFilter,
        reply: oneshot::Sender<String>,
    },
}

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreMsg>,
}

impl StoreHandle {
    pub async fn open_session(
        &self,
        backend_id: &str,
        transaction_id: &str,
        start_meter_wh: f64,
        start_ts: DateTime<Utc>,
    ) -> Result<u64, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreMsg::Open {
                backend_id: backend_id.to_string(),
                transaction_id: transaction_id.to_string(),
                start_meter_wh,
                start_ts,
                reply,
            })
            .await
            .map_err(|_| ProxyError::LogWriteFailed("store task gone".into()))?;
        rx.await
            .map_err(|_| ProxyError::LogWriteFailed("store task gone".into()))?
    }

    /// Close the current open session. Returns the closed record, or `None`
    /// when no session was open (a stop without a start is not an error,
    /// the charger is authoritative).
    pub async fn close_session(
        &self,
        transaction_id: &str,
        stop_meter_wh: f64,
        stop_ts: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<Option<SessionRecord>, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreMsg::Close {
                transaction_id: transaction_id.to_string(),
                stop_meter_wh,
                stop_ts,
                reason,
                reply,
            })
            .await
            .map_err(|_| ProxyError::LogWriteFailed("store task gone".into()))?;
        rx.await
            .map_err(|_| ProxyError::LogWriteFailed("store task gone".into()))?
    }

    pub async fn list(&self, filter: SessionFilter) -> Vec<SessionRecord> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(StoreMsg::List { filter, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn export_csv(&self, filter: SessionFilter) -> String {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Csv { filter, reply }).await.is_err() {
            return String::new();
        }
        rx.await.unwrap_or_default()
    }
}

pub fn spawn(log: SessionLog) -> StoreHandle {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(log, rx));
    StoreHandle { tx }
}

async fn run(mut log: SessionLog, mut rx: mpsc::Receiver<StoreMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            StoreMsg::Open {
                backend_id,
                transaction_id,
                start_meter_wh,
                start_ts,
                reply,
            } => {
                let result = log
                    .open_session(&backend_id, Some(&transaction_id), start_meter_wh, start_ts)
                    .map_err(|e| ProxyError::LogWriteFailed(e.to_string()));
                let _ = reply.send(result);
            }
            StoreMsg::Close {
                transaction_id,
                stop_meter_wh,
                stop_ts,
                reason,
                reply,
            } => {
                let open = log
                    .current_open()
                    .map(|r| (r.session_id, r.transaction_id.clone()));
                let result = match open {
                    Some((id, open_tx)) => {
                        if open_tx.as_deref() != Some(transaction_id.as_str()) {
                            warn!(
                                expected = ?open_tx,
                                got = %transaction_id,
                                "stop for a different transaction, closing anyway"
                            );
                        }
                        log.close_session(id, stop_meter_wh, stop_ts, reason)
                            .map(|_| log.get(id).cloned())
                            .map_err(|e| ProxyError::LogWriteFailed(e.to_string()))
                    }
                    None => {
                        warn!(transaction = %transaction_id, "stop without an open session");
                        Ok(None)
                    }
                };
                let _ = reply.send(result);
            }
            StoreMsg::List { filter, reply } => {
                let _ = reply.send(log.list(&filter));
            }
            StoreMsg::Csv { filter, reply } => {
                let _ = reply.send(log.export_csv(&filter));
            }
        }
    }
}
