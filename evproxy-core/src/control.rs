//! Backend control protocol.
//!
//! Backends speak plain JSON frames, independent of the OCPP framing on the
//! charger side. Clients send operations, the proxy answers with typed
//! frames; `request_id` is echoed back where the client supplied one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::ChargerCommand;
use crate::error::ProxyError;
use crate::event::ChargerEvent;

/// Client -> proxy operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Subscribe,
    Unsubscribe,
    RequestControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    ReleaseControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Command {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        command: ChargerCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Granted,
    Revoked,
    Denied,
}

/// Proxy -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        #[serde(flatten)]
        event: ChargerEvent,
    },
    Control {
        status: ControlStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        result: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
}

impl ServerFrame {
    pub fn event(event: ChargerEvent) -> Self {
        ServerFrame::Event { event }
    }

    pub fn granted() -> Self {
        ServerFrame::Control {
            status: ControlStatus::Granted,
            reason: None,
        }
    }

    pub fn denied(reason: &ProxyError) -> Self {
        ServerFrame::Control {
            status: ControlStatus::Denied,
            reason: Some(reason.code().to_string()),
        }
    }

    pub fn revoked(reason: impl Into<String>) -> Self {
        ServerFrame::Control {
            status: ControlStatus::Revoked,
            reason: Some(reason.into()),
        }
    }

    pub fn result(request_id: Option<u64>, result: Value) -> Self {
        ServerFrame::Result { request_id, result }
    }

    pub fn error(err: &ProxyError, request_id: Option<u64>) -> Self {
        ServerFrame::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            request_id,
        }
    }

    /// Wire text for this frame. Serialization of our own types cannot
    /// fail, so this is total.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
