//! OCPP-over-WebSocket JSON-RPC framing.
//!
//! Both supported dialects share the same outer shape; every text frame is a
//! JSON array:
//! - CALL: `[2, messageId, action, payload]`
//! - CALLRESULT: `[3, messageId, payload]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription, errorDetails]`

use serde_json::{json, Value};
use thiserror::Error;

/// Message type identifiers at array position zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// Error codes the proxy puts in CALLERROR frames it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    NotImplemented,
    ProtocolError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::ProtocolError => "ProtocolError",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("malformed {0} frame")]
    BadShape(&'static str),

    #[error("unknown message type {0}")]
    UnknownMessageType(i64),
}

/// A parsed OCPP frame, action still uninterpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        code: String,
        description: String,
        details: Value,
    },
}

impl Frame {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Frame::Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn result(message_id: impl Into<String>, payload: Value) -> Self {
        Frame::CallResult {
            message_id: message_id.into(),
            payload,
        }
    }

    pub fn error(
        message_id: impl Into<String>,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Frame::CallError {
            message_id: message_id.into(),
            code: code.as_str().to_string(),
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call { message_id, .. }
            | Frame::CallResult { message_id, .. }
            | Frame::CallError { message_id, .. } => message_id,
        }
    }

    /// Parse a text frame into its typed shape.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let array = value.as_array().ok_or(FrameError::NotAnArray)?;
        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(FrameError::NotAnArray)?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::BadShape("CALL"));
                }
                let message_id = array[1]
                    .as_str()
                    .ok_or(FrameError::BadShape("CALL"))?
                    .to_string();
                let action = array[2]
                    .as_str()
                    .ok_or(FrameError::BadShape("CALL"))?
                    .to_string();
                Ok(Frame::Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                })
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::BadShape("CALLRESULT"));
                }
                let message_id = array[1]
                    .as_str()
                    .ok_or(FrameError::BadShape("CALLRESULT"))?
                    .to_string();
                Ok(Frame::CallResult {
                    message_id,
                    payload: array[2].clone(),
                })
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::BadShape("CALLERROR"));
                }
                let message_id = array[1]
                    .as_str()
                    .ok_or(FrameError::BadShape("CALLERROR"))?
                    .to_string();
                let code = array[2]
                    .as_str()
                    .ok_or(FrameError::BadShape("CALLERROR"))?
                    .to_string();
                let description = array[3].as_str().unwrap_or("").to_string();
                Ok(Frame::CallError {
                    message_id,
                    code,
                    description,
                    details: array[4].clone(),
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize to the wire array form.
    pub fn encode(&self) -> String {
        let array = match self {
            Frame::Call {
                message_id,
                action,
                payload,
            } => json!([MessageType::Call as i64, message_id, action, payload]),
            Frame::CallResult {
                message_id,
                payload,
            } => json!([MessageType::CallResult as i64, message_id, payload]),
            Frame::CallError {
                message_id,
                code,
                description,
                details,
            } => json!([
                MessageType::CallError as i64,
                message_id,
                code,
                description,
                details
            ]),
        };
        array.to_string()
    }
}

/// Try to recover a message id from a frame that failed full parsing, so the
/// proxy can answer with a CALLERROR instead of dropping the connection.
pub fn salvage_message_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let array = value.as_array()?;
    array.get(1)?.as_str().map(str::to_string)
}
