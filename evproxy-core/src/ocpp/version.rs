//! Protocol version tags and negotiation at charger upgrade time.

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.0.1")]
    V201,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V16 => "1.6",
            ProtocolVersion::V201 => "2.0.1",
        }
    }

    /// WebSocket subprotocol name for this version.
    pub fn subprotocol(self) -> &'static str {
        match self {
            ProtocolVersion::V16 => "ocpp1.6",
            ProtocolVersion::V201 => "ocpp2.0.1",
        }
    }

    pub fn from_subprotocol(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ocpp1.6" => Some(ProtocolVersion::V16),
            // Plain 2.0 offers are folded into 2.0.1.
            "ocpp2.0.1" | "ocpp2.0" => Some(ProtocolVersion::V201),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.6" => Ok(ProtocolVersion::V16),
            "2.0.1" | "2.0" => Ok(ProtocolVersion::V201),
            other => Err(ProxyError::VersionMismatch(other.to_string())),
        }
    }
}

/// Everything the upgrade request tells us that could carry a version hint.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOffer {
    /// Entries of the `Sec-WebSocket-Protocol` header, already split.
    pub subprotocols: Vec<String>,
    /// `X-OCPP-Version` header, verbatim.
    pub version_header: Option<String>,
    /// `version=` query parameter.
    pub query_version: Option<String>,
    /// Request path.
    pub path: String,
}

/// Pick the protocol version for a charger connection.
///
/// Hint priority: subprotocol list, custom header, query parameter, path
/// suffix, configured default. A non-empty subprotocol list with no
/// recognized entry is a handshake failure regardless of other hints.
pub fn negotiate(
    offer: &UpgradeOffer,
    default: ProtocolVersion,
    auto_detect: bool,
) -> Result<ProtocolVersion, ProxyError> {
    if !offer.subprotocols.is_empty() {
        let recognized = offer
            .subprotocols
            .iter()
            .find_map(|p| ProtocolVersion::from_subprotocol(p));
        return match recognized {
            Some(version) if auto_detect => Ok(version),
            Some(_) => Ok(default),
            None => Err(ProxyError::HandshakeFailed(format!(
                "unsupported subprotocols: {}",
                offer.subprotocols.join(", ")
            ))),
        };
    }

    if !auto_detect {
        return Ok(default);
    }

    if let Some(hint) = offer.version_header.as_deref().and_then(version_hint) {
        return Ok(hint);
    }
    if let Some(hint) = offer.query_version.as_deref().and_then(version_hint) {
        return Ok(hint);
    }
    if let Some(hint) = path_hint(&offer.path) {
        return Ok(hint);
    }

    Ok(default)
}

fn version_hint(value: &str) -> Option<ProtocolVersion> {
    if value.contains("1.6") {
        Some(ProtocolVersion::V16)
    } else if value.contains("2.0.1") || value.contains("2.0") {
        Some(ProtocolVersion::V201)
    } else {
        None
    }
}

fn path_hint(path: &str) -> Option<ProtocolVersion> {
    let path = path.trim_end_matches('/');
    if path.ends_with("/v1.6") {
        Some(ProtocolVersion::V16)
    } else if path.ends_with("/v2.0.1") || path.ends_with("/v2.0") {
        Some(ProtocolVersion::V201)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> UpgradeOffer {
        UpgradeOffer {
            path: "/charger".into(),
            ..Default::default()
        }
    }

    #[test]
    fn subprotocol_wins_over_everything() {
        let offer = UpgradeOffer {
            subprotocols: vec!["ocpp2.0.1".into()],
            query_version: Some("1.6".into()),
            path: "/charger/v1.6".into(),
            ..Default::default()
        };
        let version = negotiate(&offer, ProtocolVersion::V16, true).unwrap();
        assert_eq!(version, ProtocolVersion::V201);
    }

    #[test]
    fn unrecognized_subprotocols_fail_the_handshake() {
        let offer = UpgradeOffer {
            subprotocols: vec!["mqtt".into(), "soap".into()],
            ..offer()
        };
        assert!(matches!(
            negotiate(&offer, ProtocolVersion::V16, true),
            Err(ProxyError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn custom_header_checked_before_query() {
        let offer = UpgradeOffer {
            version_header: Some("2.0.1".into()),
            query_version: Some("1.6".into()),
            ..offer()
        };
        assert_eq!(
            negotiate(&offer, ProtocolVersion::V16, true).unwrap(),
            ProtocolVersion::V201
        );
    }

    #[test]
    fn query_parameter_detection() {
        // S5: charger opens /charger?version=2.0.1 with no subprotocol.
        let offer = UpgradeOffer {
            query_version: Some("2.0.1".into()),
            ..offer()
        };
        assert_eq!(
            negotiate(&offer, ProtocolVersion::V16, true).unwrap(),
            ProtocolVersion::V201
        );
    }

    #[test]
    fn path_suffix_detection() {
        let offer = UpgradeOffer {
            path: "/charger/v2.0.1".into(),
            ..Default::default()
        };
        assert_eq!(
            negotiate(&offer, ProtocolVersion::V16, true).unwrap(),
            ProtocolVersion::V201
        );
    }

    #[test]
    fn falls_back_to_configured_default() {
        assert_eq!(
            negotiate(&offer(), ProtocolVersion::V201, true).unwrap(),
            ProtocolVersion::V201
        );
    }

    #[test]
    fn detection_disabled_uses_default() {
        let offer = UpgradeOffer {
            query_version: Some("2.0.1".into()),
            ..offer()
        };
        assert_eq!(
            negotiate(&offer, ProtocolVersion::V16, false).unwrap(),
            ProtocolVersion::V16
        );
    }
}
