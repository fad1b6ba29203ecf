//! Running half of the EV charger proxy.
//!
//! The pure model lives in `evproxy-core`; this crate owns every socket and
//! task: the single charger session, the arbitration engine, the backend
//! registry and fan-out, the outbound OCPP client supervisor, the session
//! store actor and the HTTP/WebSocket edge.

pub mod arbiter;
pub mod automation;
pub mod charger;
pub mod http;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod store;
