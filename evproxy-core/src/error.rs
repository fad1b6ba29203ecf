//! Proxy error taxonomy.
//!
//! Codes are part of the public contract: backends receive them verbatim in
//! `{"type":"error"}` and `{"type":"control"}` frames, so the mapping in
//! [`ProxyError::code`] must stay stable.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    // Transport
    #[error("connection lost")]
    ConnectionLost,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Protocol
    #[error("action not implemented: {0}")]
    NotImplemented(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    // Arbitration
    #[error("control lock already held")]
    AlreadyHeld,
    #[error("backend does not hold the control lock")]
    NotLockHolder,
    #[error("control request rate limit exceeded")]
    RateLimited,
    #[error("provider is blocked")]
    ProviderBlocked,
    #[error("provider is not on the allow list")]
    ProviderNotAllowed,
    #[error("control blocked while presence reports home")]
    PresenceBlocked,
    #[error("administrative override is active")]
    UserOverride,
    #[error("charger reported a fault")]
    ChargerFaulted,

    // Operation
    #[error("call timed out")]
    CallTimeout,
    #[error("command preempted")]
    Preempted,
    #[error("charger is not connected")]
    ChargerUnavailable,

    // System
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("session log write failed: {0}")]
    LogWriteFailed(String),

    /// The charger answered one of our calls with a CallError frame. The
    /// charger's own error code is surfaced to the requesting backend.
    #[error("charger rejected call: {code}: {description}")]
    ChargerRejected { code: String, description: String },

    /// A backend tried to register an identifier that is already live.
    #[error("backend id already registered")]
    DuplicateBackend,
}

impl ProxyError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &str {
        use ProxyError::*;
        match self {
            ConnectionLost => "ConnectionLost",
            InvalidFrame(_) => "InvalidFrame",
            HandshakeFailed(_) => "HandshakeFailed",
            NotImplemented(_) => "NotImplemented",
            MalformedPayload(_) => "MalformedPayload",
            VersionMismatch(_) => "VersionMismatch",
            AlreadyHeld => "AlreadyHeld",
            NotLockHolder => "NotLockHolder",
            RateLimited => "RateLimited",
            ProviderBlocked => "ProviderBlocked",
            ProviderNotAllowed => "ProviderNotAllowed",
            PresenceBlocked => "PresenceBlocked",
            UserOverride => "UserOverride",
            ChargerFaulted => "ChargerFaulted",
            CallTimeout => "CallTimeout",
            Preempted => "Preempted",
            ChargerUnavailable => "ChargerUnavailable",
            ConfigInvalid(_) => "ConfigInvalid",
            LogWriteFailed(_) => "LogWriteFailed",
            ChargerRejected { code, .. } => code,
            DuplicateBackend => "DuplicateBackend",
        }
    }
}
