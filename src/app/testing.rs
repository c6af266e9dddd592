//! Fakes shared by the engine and session tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use super::bookmarks::ChromeBookmarks;
use super::error::{ProxyError, StoreError};
use super::probe::Probe;
use super::proxy::{ProxyBackend, ProxyConfig};
use super::store::{KeyValueStore, MemoryStore};
use super::types::{CheckingState, Notice, Renderer};

type ProbeHook = Box<dyn Fn(&str) + Send + Sync>;

/// Scripted prober. Unknown URLs are unreachable. When wired to a
/// `RecordingProxy`, answers come from the proxied table while a proxy is set.
#[derive(Default)]
pub struct FakeProber {
    direct: HashMap<String, bool>,
    proxied: HashMap<String, bool>,
    proxy: Option<Arc<RecordingProxy>>,
    delay: Duration,
    hook: Option<ProbeHook>,
    calls: Mutex<Vec<String>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direct(mut self, url: &str, available: bool) -> Self {
        self.direct.insert(url.to_string(), available);
        self
    }

    pub fn proxied(mut self, url: &str, available: bool) -> Self {
        self.proxied.insert(url.to_string(), available);
        self
    }

    pub fn through(mut self, proxy: Arc<RecordingProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_probe(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Probe for FakeProber {
    async fn probe(&self, url: &str) -> bool {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(hook) = &self.hook {
            hook(url);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let via_proxy = self.proxy.as_ref().is_some_and(|p| p.is_active());
        let table = if via_proxy { &self.proxied } else { &self.direct };
        table.get(url).copied().unwrap_or(false)
    }
}

/// Proxy backend that only counts calls.
pub struct RecordingProxy {
    available: AtomicBool,
    reject: AtomicBool,
    active: AtomicBool,
    set_calls: AtomicUsize,
    clear_calls: AtomicUsize,
}

impl Default for RecordingProxy {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            reject: AtomicBool::new(false),
            active: AtomicBool::new(false),
            set_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
        }
    }
}

impl RecordingProxy {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reject_sets(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }
}

impl ProxyBackend for RecordingProxy {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn set(&self, _config: &ProxyConfig) -> Result<(), ProxyError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyError::Rejected("scripted rejection".into()));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), ProxyError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Memory store that keeps every value written under each key.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingStore {
    pub fn states(&self, key: &str) -> Vec<CheckingState> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect()
    }
}

impl KeyValueStore for RecordingStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.clone()));
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
}

pub struct FailingStore;

impl KeyValueStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk on fire")))
    }

    fn set(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk on fire")))
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk on fire")))
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    renders: Mutex<Vec<CheckingState>>,
    notices: Mutex<Vec<Notice>>,
}

impl RecordingRenderer {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn renders(&self) -> Vec<CheckingState> {
        self.renders.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, state: &CheckingState) {
        self.renders.lock().unwrap().push(state.clone());
    }

    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// Writes a profile whose bookmark bar holds `entries` (title, url), with
/// ids starting at 10.
pub fn bookmarks_file(dir: &Path, entries: &[(&str, &str)]) -> ChromeBookmarks {
    let children: Vec<Value> = entries
        .iter()
        .enumerate()
        .map(|(idx, (title, url))| {
            json!({"id": (idx + 10).to_string(), "name": title, "type": "url", "url": url})
        })
        .collect();
    let doc = json!({
        "roots": {
            "bookmark_bar": {"id": "1", "name": "Bookmarks bar", "type": "folder", "children": children},
            "other": {"id": "2", "name": "Other bookmarks", "type": "folder", "children": []},
            "synced": {"id": "3", "name": "Mobile bookmarks", "type": "folder", "children": []}
        },
        "version": 1
    });
    let path = dir.join("Bookmarks");
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
    ChromeBookmarks::new(path)
}
