//! Home-automation coupling, reduced to three small surfaces: a presence
//! flag, an override flag and a notification sink.
//!
//! The flags are polled at 1 Hz by background tasks and cached, so the
//! arbitration engine reads them without suspending. The concrete binding
//! is a construction choice: the Home Assistant HTTP API when `HA_URL` and
//! `HA_TOKEN` are set, a fixed constant otherwise (and in tests).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use evproxy_core::{ProxyError, Settings};

const POLL_PERIOD: Duration = Duration::from_secs(1);

/// A remote boolean the proxy can sample.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self) -> Result<bool, ProxyError>;
}

pub struct FixedProbe(pub bool);

#[async_trait]
impl StateProbe for FixedProbe {
    async fn probe(&self) -> Result<bool, ProxyError> {
        Ok(self.0)
    }
}

/// Polls a Home Assistant entity and reports whether its state equals the
/// expected active value ("home" for presence, "on" for the override).
pub struct HaEntityProbe {
    client: reqwest::Client,
    base_url: String,
    token: String,
    entity_id: String,
    active_state: &'static str,
}

impl HaEntityProbe {
    pub fn new(
        base_url: &str,
        token: &str,
        entity_id: &str,
        active_state: &'static str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            entity_id: entity_id.to_string(),
            active_state,
        }
    }
}

#[async_trait]
impl StateProbe for HaEntityProbe {
    async fn probe(&self) -> Result<bool, ProxyError> {
        let url = format!("{}/api/states/{}", self.base_url, self.entity_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProxyError::MalformedPayload(e.to_string()))?;
        Ok(body.get("state").and_then(|s| s.as_str()) == Some(self.active_state))
    }
}

/// Cached boolean kept fresh by a 1 Hz poll task. Probe failures keep the
/// last known value; the original fails open rather than blocking charging
/// when the automation system is unreachable.
#[derive(Clone)]
struct CachedFlag {
    value: Arc<AtomicBool>,
}

impl CachedFlag {
    fn fixed(value: bool) -> Self {
        Self {
            value: Arc::new(AtomicBool::new(value)),
        }
    }

    fn polled(probe: Arc<dyn StateProbe>) -> Self {
        let value = Arc::new(AtomicBool::new(false));
        let cache = value.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_PERIOD);
            loop {
                tick.tick().await;
                match probe.probe().await {
                    Ok(state) => cache.store(state, Ordering::Relaxed),
                    Err(err) => debug!(error = %err, "state probe failed, keeping last value"),
                }
            }
        });
        Self { value }
    }

    fn get(&self) -> bool {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct PresenceSource {
    inner: Option<CachedFlag>,
}

impl PresenceSource {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn fixed(present: bool) -> Self {
        Self {
            inner: Some(CachedFlag::fixed(present)),
        }
    }

    pub fn polled(probe: Arc<dyn StateProbe>) -> Self {
        Self {
            inner: Some(CachedFlag::polled(probe)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_present(&self) -> bool {
        self.inner.as_ref().map(CachedFlag::get).unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct OverrideSource {
    inner: Option<CachedFlag>,
}

impl OverrideSource {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn fixed(active: bool) -> Self {
        Self {
            inner: Some(CachedFlag::fixed(active)),
        }
    }

    pub fn polled(probe: Arc<dyn StateProbe>) -> Self {
        Self {
            inner: Some(CachedFlag::polled(probe)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.as_ref().map(CachedFlag::get).unwrap_or(false)
    }
}

/// Push notifications into the automation system. Failures are logged and
/// swallowed; notifications are advisory.
#[derive(Clone)]
pub struct Notifier {
    inner: Option<Arc<HaNotifier>>,
}

pub struct HaNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn home_assistant(base_url: &str, token: &str) -> Self {
        Self {
            inner: Some(Arc::new(HaNotifier {
                client: reqwest::Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
                token: token.to_string(),
            })),
        }
    }

    pub async fn notify(&self, title: &str, message: &str) {
        let Some(ha) = &self.inner else {
            return;
        };
        let url = format!("{}/api/services/persistent_notification/create", ha.base_url);
        let body = serde_json::json!({ "title": title, "message": message });
        if let Err(err) = ha
            .client
            .post(&url)
            .bearer_auth(&ha.token)
            .json(&body)
            .send()
            .await
        {
            warn!(error = %err, "notification delivery failed");
        }
    }
}

/// Wire the three surfaces up from runtime settings.
pub fn from_settings(settings: &Settings) -> (PresenceSource, OverrideSource, Notifier) {
    let (Some(url), Some(token)) = (&settings.ha_url, &settings.ha_token) else {
        return (
            PresenceSource::disabled(),
            OverrideSource::disabled(),
            Notifier::disabled(),
        );
    };

    let presence = match &settings.proxy.presence_sensor {
        Some(entity) => {
            PresenceSource::polled(Arc::new(HaEntityProbe::new(url, token, entity, "home")))
        }
        None => PresenceSource::disabled(),
    };
    let override_source = match &settings.proxy.override_input_boolean {
        Some(entity) => {
            OverrideSource::polled(Arc::new(HaEntityProbe::new(url, token, entity, "on")))
        }
        None => OverrideSource::disabled(),
    };
    (presence, override_source, Notifier::home_assistant(url, token))
}
