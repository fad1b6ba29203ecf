//! Version-agnostic charger event vocabulary.
//!
//! Every message the charger pushes at the proxy is collapsed into one of
//! these variants before it reaches the arbitration engine, the session
//! store or the backend fan-out. Meter quantities are always watt-hours.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::ChargerStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChargerEvent {
    BootNotification {
        vendor: String,
        model: String,
    },
    Heartbeat {
        time: DateTime<Utc>,
    },
    StatusChanged {
        connector_id: i64,
        status: ChargerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    MeterSample {
        connector_id: i64,
        energy_wh: f64,
        timestamp: DateTime<Utc>,
    },
    TransactionStarted {
        transaction_id: String,
        connector_id: i64,
        id_tag: String,
        meter_start_wh: f64,
        timestamp: DateTime<Utc>,
    },
    TransactionEnded {
        transaction_id: String,
        meter_stop_wh: f64,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Synthetic event emitted by the proxy itself when the charger socket
    /// drops; it never crosses the charger wire.
    ChargerDisconnected,
}

impl ChargerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChargerEvent::BootNotification { .. } => "boot_notification",
            ChargerEvent::Heartbeat { .. } => "heartbeat",
            ChargerEvent::StatusChanged { .. } => "status_changed",
            ChargerEvent::MeterSample { .. } => "meter_sample",
            ChargerEvent::TransactionStarted { .. } => "transaction_started",
            ChargerEvent::TransactionEnded { .. } => "transaction_ended",
            ChargerEvent::ChargerDisconnected => "charger_disconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_shape() {
        let event = ChargerEvent::StatusChanged {
            connector_id: 1,
            status: ChargerStatus::Charging,
            error_code: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["connectorId"], 1);
        assert_eq!(json["status"], "Charging");
    }

    #[test]
    fn round_trips_through_json() {
        let event = ChargerEvent::TransactionStarted {
            transaction_id: "42".into(),
            connector_id: 1,
            id_tag: "ABC".into(),
            meter_start_wh: 1000.0,
            timestamp: "2026-03-01T10:00:00Z".parse().unwrap(),
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: ChargerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
