use std::sync::{Arc, RwLock};

use url::Url;

use super::error::ProxyError;
use super::settings::ExtensionSettings;
use super::types::ProxyType;

pub const PROXY_BYPASS: [&str; 2] = ["localhost", "127.0.0.1"];

/// A fixed proxy server plus the hosts that must never go through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: ProxyType,
    pub host: String,
    pub port: u16,
    pub bypass: Vec<String>,
}

impl ProxyConfig {
    /// `None` when retry is disabled or the address/port cannot form a proxy URL.
    pub fn from_settings(settings: &ExtensionSettings) -> Option<Self> {
        if !settings.enable_proxy_retry {
            return None;
        }
        let host = settings.proxy_address.trim();
        let port = settings.proxy_port.trim().parse::<u16>().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        let config = Self {
            scheme: settings.proxy_type,
            host: host.to_string(),
            port,
            bypass: PROXY_BYPASS.iter().map(|h| h.to_string()).collect(),
        };
        let parsed = Url::parse(&config.url()).ok()?;
        let host_matches = parsed
            .host_str()
            .map(|h| h.trim_matches(['[', ']']).eq_ignore_ascii_case(host.trim_matches(['[', ']'])))
            .unwrap_or(false);
        if !host_matches || parsed.path() != "/" && !parsed.path().is_empty() {
            return None;
        }
        Some(config)
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme.scheme(), self.host, self.port)
    }

    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, ProxyError> {
        let proxy =
            reqwest::Proxy::all(self.url()).map_err(|err| ProxyError::Rejected(err.to_string()))?;
        Ok(proxy.no_proxy(reqwest::NoProxy::from_string(&self.bypass.join(","))))
    }
}

/// The system-wide proxy switch the controller drives.
pub trait ProxyBackend: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }
    fn set(&self, config: &ProxyConfig) -> Result<(), ProxyError>;
    fn clear(&self) -> Result<(), ProxyError>;
}

/// Process-wide egress slot. Every probe client is built from whatever
/// configuration is installed here at request time.
#[derive(Default)]
pub struct EgressProxy {
    active: RwLock<Option<ProxyConfig>>,
}

impl EgressProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ProxyConfig> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProxyBackend for EgressProxy {
    fn set(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        config.to_reqwest()?;
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ProxyError> {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

pub struct ProxyController {
    backend: Arc<dyn ProxyBackend>,
}

impl ProxyController {
    pub fn new(backend: Arc<dyn ProxyBackend>) -> Self {
        Self { backend }
    }

    /// Installs the proxy described by `settings`. Returns `false` without
    /// touching the backend when retry is off, the backend is unavailable or
    /// the address/port are malformed.
    pub fn apply(&self, settings: &ExtensionSettings) -> bool {
        if !settings.enable_proxy_retry {
            return false;
        }
        if !self.backend.is_available() {
            tracing::error!(error = %ProxyError::Unavailable, "cannot retry through proxy");
            return false;
        }
        let Some(config) = ProxyConfig::from_settings(settings) else {
            tracing::warn!(
                address = %settings.proxy_address,
                port = %settings.proxy_port,
                "proxy configuration incomplete, skipping proxy retry"
            );
            return false;
        };
        match self.backend.set(&config) {
            Ok(()) => {
                tracing::info!(proxy = %config.url(), "proxy applied");
                true
            }
            Err(err) => {
                tracing::error!(proxy = %config.url(), error = %err, "failed to apply proxy");
                false
            }
        }
    }

    /// Removes any installed proxy. Safe to call when nothing is installed.
    pub fn clear(&self) -> bool {
        match self.backend.clear() {
            Ok(()) => {
                tracing::info!("proxy cleared");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to clear proxy");
                false
            }
        }
    }
}
