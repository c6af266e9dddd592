use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::error::SettingsError;
use super::store::KeyValueStore;
use super::types::ProxyType;

pub const SETTINGS_KEY: &str = "extensionSettings";
pub const DEFAULT_THREADS_PER_BATCH: usize = 10;
pub const MAX_THREADS_PER_BATCH: usize = 20;

/// User configuration consumed read-only by the check engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionSettings {
    pub enable_proxy_retry: bool,
    pub proxy_type: ProxyType,
    pub proxy_address: String,
    #[serde(deserialize_with = "lenient_string")]
    pub proxy_port: String,
    #[serde(deserialize_with = "lenient_threads")]
    pub threads_per_batch: usize,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            enable_proxy_retry: false,
            proxy_type: ProxyType::Http,
            proxy_address: String::new(),
            proxy_port: String::new(),
            threads_per_batch: DEFAULT_THREADS_PER_BATCH,
        }
    }
}

impl ExtensionSettings {
    /// Applies the same rules the settings form enforces before saving.
    pub fn validated(mut self) -> Result<Self, SettingsError> {
        self.proxy_address = self.proxy_address.trim().to_string();
        self.threads_per_batch = sanitize_threads_per_batch(self.threads_per_batch);
        let port = self.proxy_port.trim().to_string();

        if !self.enable_proxy_retry {
            self.proxy_port = String::new();
            return Ok(self);
        }
        if self.proxy_address.is_empty() || port.is_empty() {
            return Err(SettingsError::IncompleteProxy);
        }
        match port.parse::<u16>() {
            Ok(value) if value >= 1 => self.proxy_port = value.to_string(),
            _ => return Err(SettingsError::InvalidPort(port)),
        }
        Ok(self)
    }
}

pub fn sanitize_threads_per_batch(value: usize) -> usize {
    value.clamp(1, MAX_THREADS_PER_BATCH)
}

fn parse_leading_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let end = raw
        .char_indices()
        .find(|(idx, ch)| !(ch.is_ascii_digit() || (*idx == 0 && (*ch == '-' || *ch == '+'))))
        .map(|(idx, _)| idx)
        .unwrap_or(raw.len());
    raw[..end].parse::<i64>().ok()
}

fn threads_from_value(value: &Value) -> usize {
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f.trunc() as i64)),
        Value::String(raw) => parse_leading_int(raw),
        _ => None,
    };
    match parsed {
        Some(n) => n.clamp(1, MAX_THREADS_PER_BATCH as i64) as usize,
        None => DEFAULT_THREADS_PER_BATCH,
    }
}

fn lenient_threads<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(threads_from_value(&value))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Cached settings plus a change feed.
///
/// Readers always see the most recent copy; the engine snapshots the batch
/// size once at check start and reads the proxy fields when it needs them.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    tx: Arc<watch::Sender<ExtensionSettings>>,
}

impl SettingsStore {
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let initial = match read_settings(store.as_ref()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load settings, using defaults");
                ExtensionSettings::default()
            }
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            store,
            tx: Arc::new(tx),
        }
    }

    pub fn get(&self) -> ExtensionSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExtensionSettings> {
        self.tx.subscribe()
    }

    pub fn set(&self, settings: ExtensionSettings) -> Result<ExtensionSettings, SettingsError> {
        let settings = settings.validated()?;
        self.store
            .set(SETTINGS_KEY, serde_json::to_value(&settings)?)?;
        self.tx.send_replace(settings.clone());
        tracing::info!(
            proxy_retry = settings.enable_proxy_retry,
            threads = settings.threads_per_batch,
            "settings saved"
        );
        Ok(settings)
    }

    /// Re-reads the backing store and publishes the result if it changed.
    pub fn reload(&self) -> bool {
        match read_settings(self.store.as_ref()) {
            Ok(fresh) => self.tx.send_if_modified(|current| {
                if *current == fresh {
                    false
                } else {
                    *current = fresh;
                    true
                }
            }),
            Err(err) => {
                tracing::warn!(error = %err, "failed to reload settings");
                false
            }
        }
    }
}

fn read_settings(store: &dyn KeyValueStore) -> Result<ExtensionSettings, SettingsError> {
    match store.get(SETTINGS_KEY)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(ExtensionSettings::default()),
    }
}
