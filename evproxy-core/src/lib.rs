//! Core model of the EV charger proxy.
//!
//! This crate is the pure half of the proxy: the OCPP wire codecs for both
//! supported dialects (1.6 and 2.0.1), the version-agnostic event and command
//! vocabulary they collapse into, the backend control protocol frames, the
//! configuration schema and the durable session store. Nothing in here opens
//! a socket; the gateway crate owns all I/O.

pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod ocpp;
pub mod sessionlog;
pub mod status;

pub use command::{AvailabilityKind, ChargerCommand, ResetKind};
pub use config::{AuthType, ProxyConfig, ServiceConfig, Settings};
pub use control::{ClientOp, ControlStatus, ServerFrame};
pub use error::ProxyError;
pub use event::ChargerEvent;
pub use ocpp::adapter::{ChargerState, Decoded, ProtocolAdapter};
pub use ocpp::version::{ProtocolVersion, UpgradeOffer};
pub use sessionlog::{SessionFilter, SessionLog, SessionRecord};
pub use status::ChargerStatus;
