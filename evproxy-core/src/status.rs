//! Unified charger status.

use serde::{Deserialize, Serialize};

/// Charger operational status, normalized across both wire dialects.
///
/// The variants follow the OCPP 1.6 `ChargePointStatus` enumeration; 2.0.1
/// connector states are folded into it by the adapter. `Unknown` covers
/// states the proxy does not care to distinguish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    #[default]
    Unknown,
}

impl ChargerStatus {
    pub fn is_faulted(self) -> bool {
        matches!(self, ChargerStatus::Faulted)
    }
}

impl std::fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChargerStatus::SuspendedEV).unwrap(),
            "\"SuspendedEV\""
        );
        let parsed: ChargerStatus = serde_json::from_str("\"Faulted\"").unwrap();
        assert!(parsed.is_faulted());
    }
}
