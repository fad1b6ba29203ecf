//! OCPP wire handling: JSON-RPC framing, version negotiation and the
//! per-dialect codecs behind the version-agnostic adapter.

pub mod adapter;
pub mod frame;
pub mod v16;
pub mod v201;
pub mod version;
