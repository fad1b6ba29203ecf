//! Version-agnostic command vocabulary.
//!
//! Commands are what a lock-holding backend may submit; the adapter encodes
//! them into the wire dialect the charger negotiated. The JSON shape here is
//! also the `command` object of the backend control protocol.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ChargerCommand {
    RemoteStart {
        id_tag: String,
        #[serde(default = "default_connector")]
        connector_id: i64,
    },
    RemoteStop {
        transaction_id: String,
    },
    Reset {
        kind: ResetKind,
    },
    ChangeAvailability {
        connector_id: i64,
        kind: AvailabilityKind,
    },
}

fn default_connector() -> i64 {
    1
}

/// Reset flavour, in 1.6 terms. 2.0.1 maps Hard to Immediate and Soft to
/// OnIdle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityKind {
    Operative,
    Inoperative,
}

impl ChargerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ChargerCommand::RemoteStart { .. } => "RemoteStart",
            ChargerCommand::RemoteStop { .. } => "RemoteStop",
            ChargerCommand::Reset { .. } => "Reset",
            ChargerCommand::ChangeAvailability { .. } => "ChangeAvailability",
        }
    }
}
