//! Immutable configuration snapshot.
//!
//! The policy file is JSON, named by `CONFIG_FILE`; runtime knobs come from
//! the environment (`PORT`, `HA_URL`, `HA_TOKEN`, `LOG_DB_PATH`). The
//! snapshot is loaded once at startup and threaded through the actor
//! constructors; rebinding requires a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::ocpp::version::ProtocolVersion;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// When false, only `preferred_provider` may hold the control lock.
    pub allow_shared_charging: bool,
    /// Exempt from the presence gate; may preempt other holders.
    pub preferred_provider: Option<String>,
    /// Minimum interval between a backend's control requests.
    pub rate_limit_seconds: u64,
    /// A holder that issues no command for this long loses the lock.
    pub lock_timeout_seconds: u64,
    /// Default charger protocol version when detection finds nothing.
    pub ocpp_version: ProtocolVersion,
    /// When false, version hints are ignored and the default is used.
    pub auto_detect_ocpp_version: bool,
    /// Entity consulted through the presence source.
    pub presence_sensor: Option<String>,
    /// Entity consulted through the override source.
    pub override_input_boolean: Option<String>,
    /// Whitelist; empty means no whitelist.
    pub allowed_providers: Vec<String>,
    /// Blacklist.
    pub disallowed_providers: Vec<String>,
    /// Outbound OCPP service connections.
    pub ocpp_services: Vec<ServiceConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_shared_charging: true,
            preferred_provider: None,
            rate_limit_seconds: 10,
            lock_timeout_seconds: 60,
            ocpp_version: ProtocolVersion::V16,
            auto_detect_ocpp_version: true,
            presence_sensor: None,
            override_input_boolean: None,
            allowed_providers: Vec::new(),
            disallowed_providers: Vec::new(),
            ocpp_services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "ServiceConfig::default_version")]
    pub version: ProtocolVersion,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "ServiceConfig::default_enabled")]
    pub enabled: bool,
}

impl ServiceConfig {
    fn default_version() -> ProtocolVersion {
        ProtocolVersion::V16
    }

    fn default_enabled() -> bool {
        true
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ProxyConfig = serde_json::from_str(&text).map_err(|e| {
            ProxyError::ConfigInvalid(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.ocpp_services {
            if service.id.is_empty() {
                return Err(ProxyError::ConfigInvalid(
                    "ocpp service with empty id".to_string(),
                ));
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ProxyError::ConfigInvalid(format!(
                    "duplicate ocpp service id: {}",
                    service.id
                )));
            }
            if !service.url.starts_with("ws://") && !service.url.starts_with("wss://") {
                return Err(ProxyError::ConfigInvalid(format!(
                    "service {} url must be a ws:// or wss:// url",
                    service.id
                )));
            }
            match service.auth_type {
                AuthType::Basic
                    if service.username.is_none() || service.password.is_none() =>
                {
                    return Err(ProxyError::ConfigInvalid(format!(
                        "service {} uses basic auth but lacks username/password",
                        service.id
                    )));
                }
                AuthType::Token if service.token.is_none() => {
                    return Err(ProxyError::ConfigInvalid(format!(
                        "service {} uses token auth but lacks a token",
                        service.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Full runtime settings: the policy snapshot plus environment bindings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub ha_url: Option<String>,
    pub ha_token: Option<String>,
    pub log_db_path: PathBuf,
    pub proxy: ProxyConfig,
}

impl Settings {
    /// Assemble settings from the environment, optionally overridden by CLI
    /// arguments. A missing config file is fine when `CONFIG_FILE` is unset;
    /// an unreadable or invalid one is fatal.
    pub fn load(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ProxyError> {
        let config_path = config_path.or_else(|| std::env::var("CONFIG_FILE").ok().map(Into::into));
        let proxy = match config_path {
            Some(path) => ProxyConfig::load(&path)?,
            None => ProxyConfig::default(),
        };

        let port = match port_override {
            Some(port) => port,
            None => match std::env::var("PORT") {
                Ok(raw) => raw.parse().map_err(|_| {
                    ProxyError::ConfigInvalid(format!("PORT is not a port number: {raw}"))
                })?,
                Err(_) => 9000,
            },
        };

        let log_db_path = std::env::var("LOG_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("usage_log.jsonl"));

        Ok(Self {
            port,
            ha_url: std::env::var("HA_URL").ok(),
            ha_token: std::env::var("HA_TOKEN").ok(),
            log_db_path,
            proxy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let config = ProxyConfig::default();
        assert!(config.allow_shared_charging);
        assert_eq!(config.rate_limit_seconds, 10);
        assert_eq!(config.ocpp_version, ProtocolVersion::V16);
        assert!(config.auto_detect_ocpp_version);
        assert!(config.allowed_providers.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "allow_shared_charging": false,
                "preferred_provider": "P",
                "rate_limit_seconds": 5,
                "ocpp_version": "2.0.1",
                "disallowed_providers": ["evil"],
                "ocpp_services": [{{
                    "id": "grid",
                    "url": "wss://grid.example/ocpp",
                    "version": "1.6",
                    "auth_type": "token",
                    "token": "secret"
                }}]
            }}"#
        )
        .unwrap();

        let config = ProxyConfig::load(file.path()).unwrap();
        assert!(!config.allow_shared_charging);
        assert_eq!(config.preferred_provider.as_deref(), Some("P"));
        assert_eq!(config.ocpp_version, ProtocolVersion::V201);
        assert_eq!(config.ocpp_services.len(), 1);
        assert_eq!(config.ocpp_services[0].auth_type, AuthType::Token);
    }

    #[test]
    fn rejects_duplicate_service_ids() {
        let config = ProxyConfig {
            ocpp_services: vec![
                ServiceConfig {
                    id: "grid".into(),
                    url: "ws://a.example".into(),
                    version: ProtocolVersion::V16,
                    auth_type: AuthType::None,
                    username: None,
                    password: None,
                    token: None,
                    enabled: true,
                },
                ServiceConfig {
                    id: "grid".into(),
                    url: "ws://b.example".into(),
                    version: ProtocolVersion::V16,
                    auth_type: AuthType::None,
                    username: None,
                    password: None,
                    token: None,
                    enabled: true,
                },
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_incomplete_auth() {
        let config = ProxyConfig {
            ocpp_services: vec![ServiceConfig {
                id: "grid".into(),
                url: "ws://a.example".into(),
                version: ProtocolVersion::V16,
                auth_type: AuthType::Basic,
                username: Some("u".into()),
                password: None,
                token: None,
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }
}
