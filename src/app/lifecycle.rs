use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use super::bookmarks::{BookmarkStore, collect_candidates, find_folder};
use super::error::BookmarkError;
use super::persistence::PersistenceBridge;
use super::probe::Probe;
use super::proxy::ProxyController;
use super::scheduler::{CancelFlag, Engine, Pacing, SharedState, lock_state};
use super::settings::{SettingsStore, sanitize_threads_per_batch};
use super::types::{CheckResult, CheckingState, Notice, Outcome, ProbeUpdate, Renderer, Visibility};

/// Collaborators a session drives.
pub struct Services<P> {
    pub prober: Arc<P>,
    pub proxy: Arc<ProxyController>,
    pub persistence: Arc<PersistenceBridge>,
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub renderer: Arc<dyn Renderer>,
    pub settings: SettingsStore,
    pub pacing: Pacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { total: usize },
    NoBookmarks,
    /// A check was running; the request turned into a cancel.
    Cancelling,
    AlreadyCancelling,
}

/// One open "popup": owns the checking state and at most one engine task.
pub struct Session<P: Probe> {
    services: Services<P>,
    state: SharedState,
    cancel: CancelFlag,
    driver: Option<JoinHandle<Option<Outcome>>>,
}

impl<P: Probe> Session<P> {
    /// Reconciles the durable checkpoint and resumes a live check.
    pub fn open(services: Services<P>) -> Self {
        let mut session = Self::attach(services);
        let resumed = {
            let state = lock_state(&session.state);
            state
                .is_checking
                .then(|| (state.checked_count, state.total_count))
        };
        if let Some((checked, total)) = resumed {
            tracing::info!(checked, total, "resuming saved check");
            session
                .services
                .renderer
                .notify(Notice::Resumed { checked, total });
            session.resume();
        }
        session
    }

    /// Loads the durable checkpoint without running anything. A stale check
    /// is settled to idle with its results kept for display; a live one is
    /// adopted as is.
    pub fn attach(services: Services<P>) -> Self {
        let mut session = Self {
            services,
            state: Arc::new(Mutex::new(CheckingState::default())),
            cancel: CancelFlag::new(),
            driver: None,
        };
        match session.services.persistence.load_checkpoint() {
            None => tracing::debug!("no saved check"),
            Some(saved) if !saved.is_checking || saved.should_cancel => session.settle_stale(saved),
            Some(saved) => session.adopt(saved),
        }
        session
    }

    fn settle_stale(&mut self, mut saved: CheckingState) {
        let was_running = saved.is_checking;
        if saved.proxy_applied {
            tracing::warn!("saved check left a proxy behind, clearing it");
            self.services.proxy.clear();
            saved.proxy_applied = false;
        }
        saved.finish();
        self.services.persistence.discard_session();
        if was_running {
            tracing::info!("discarding cancelled check");
            self.services.persistence.save_results(&saved);
        }
        self.adopt(saved);
    }

    fn adopt(&mut self, state: CheckingState) {
        self.services.renderer.render(&state);
        *lock_state(&self.state) = state;
    }

    /// Starts the engine for the current state unless one is already running.
    fn resume(&mut self) {
        if self.is_running() {
            return;
        }
        if !lock_state(&self.state).is_checking {
            return;
        }
        self.cancel = CancelFlag::new();
        let engine = Engine::new(
            self.state.clone(),
            self.cancel.clone(),
            self.services.prober.clone(),
            self.services.proxy.clone(),
            self.services.persistence.clone(),
            self.services.renderer.clone(),
            self.services.settings.clone(),
            self.services.pacing,
        );
        self.driver = Some(tokio::spawn(engine.run()));
    }

    /// Token of the current engine run. Replaced whenever a run starts.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|driver| !driver.is_finished())
    }

    pub fn snapshot(&self) -> CheckingState {
        lock_state(&self.state).clone()
    }

    pub fn on_visibility(&mut self, visibility: Visibility) {
        match visibility {
            Visibility::Hidden => {
                let snapshot = self.snapshot();
                if snapshot.is_checking {
                    tracing::debug!("hidden, checkpointing");
                    self.services.persistence.checkpoint_now(&snapshot);
                }
            }
            Visibility::Visible => {
                if self.is_running() {
                    self.services.renderer.render(&self.snapshot());
                    return;
                }
                match self.services.persistence.load_session() {
                    Some(saved) if saved.is_checking && !saved.should_cancel => {
                        tracing::info!(checked = saved.checked_count, "resuming after visibility change");
                        self.adopt(saved);
                        self.resume();
                    }
                    Some(saved) => self.settle_stale(saved),
                    None => self.services.renderer.render(&self.snapshot()),
                }
            }
        }
    }

    /// Starts a check over every bookmark, or the bookmarks below `folder`.
    /// While a check is running this requests cancellation instead.
    pub async fn start_check(&mut self, folder: Option<&str>) -> Result<StartOutcome, BookmarkError> {
        if lock_state(&self.state).is_checking {
            return Ok(if self.cancel() {
                StartOutcome::Cancelling
            } else {
                StartOutcome::AlreadyCancelling
            });
        }
        // finalize already ran; let the task return before replacing it
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }

        let tree = self.services.bookmarks.list_all()?;
        if let Some(id) = folder {
            if find_folder(&tree, id).is_none() {
                return Err(BookmarkError::NotFound(id.to_string()));
            }
        }
        let candidates = collect_candidates(&tree, folder);
        if candidates.is_empty() {
            self.services.renderer.notify(Notice::NoBookmarks);
            return Ok(StartOutcome::NoBookmarks);
        }

        let batch_size = sanitize_threads_per_batch(self.services.settings.get().threads_per_batch);
        let state = CheckingState::start(candidates, batch_size);
        let total = state.total_count;
        tracing::info!(total, batch_size, folder = folder.unwrap_or("all"), "starting check");

        self.services.persistence.checkpoint_now(&state);
        self.adopt(state);
        self.services.renderer.notify(Notice::Started { total });
        self.resume();
        Ok(StartOutcome::Started { total })
    }

    /// Requests cancellation. Returns `false` when nothing is running or a
    /// cancel is already pending.
    pub fn cancel(&mut self) -> bool {
        {
            let mut state = lock_state(&self.state);
            if !state.is_checking || state.should_cancel {
                return false;
            }
            state.should_cancel = true;
        }
        self.cancel.cancel();
        self.services.renderer.notify(Notice::Cancelling);
        true
    }

    /// Awaits the running engine, if any.
    pub async fn wait(&mut self) -> Option<Outcome> {
        let driver = self.driver.take()?;
        match driver.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "check task failed");
                None
            }
        }
    }

    /// Removes the bookmark behind `url` and its result. The one delete path
    /// used by every surface.
    pub fn delete_result(&mut self, url: &str) -> Result<Option<CheckResult>, BookmarkError> {
        let Some(id) = self.services.bookmarks.find_by_url(url)? else {
            self.services.renderer.notify(Notice::BookmarkNotFound {
                url: url.to_string(),
            });
            return Ok(None);
        };
        self.services.bookmarks.remove(&id)?;

        let (removed, snapshot) = {
            let mut state = lock_state(&self.state);
            let removed = state.remove_url(url);
            (removed, state.clone())
        };
        tracing::info!(url, id, "deleted bookmark");
        self.services.persistence.checkpoint_now(&snapshot);
        self.services.renderer.render(&snapshot);
        let title = removed
            .as_ref()
            .map(|r| r.title.clone())
            .unwrap_or_else(|| url.to_string());
        self.services.renderer.notify(Notice::Deleted { title });
        Ok(removed)
    }

    /// Deletes every bookmark whose result is unavailable. Entries that fail
    /// to delete are logged and kept.
    pub fn delete_invalid(&mut self) -> usize {
        let urls: Vec<String> = lock_state(&self.state)
            .invalid()
            .map(|(_, result)| result.url.clone())
            .collect();

        let mut deleted = 0;
        for url in &urls {
            let removed = self
                .services
                .bookmarks
                .find_by_url(url)
                .and_then(|id| match id {
                    Some(id) => self.services.bookmarks.remove(&id).map(|()| true),
                    None => Ok(false),
                });
            match removed {
                Ok(true) => {
                    lock_state(&self.state).remove_url(url);
                    deleted += 1;
                }
                Ok(false) => tracing::warn!(url, "no bookmark for invalid result"),
                Err(err) => tracing::warn!(url, error = %err, "failed to delete bookmark"),
            }
        }

        let snapshot = self.snapshot();
        self.services.persistence.checkpoint_now(&snapshot);
        self.services.renderer.render(&snapshot);
        self.services
            .renderer
            .notify(Notice::DeletedInvalid { count: deleted });
        deleted
    }

    /// Probes one URL out of band and records the answer on its result.
    pub async fn recheck(&mut self, url: &str) -> bool {
        let available = self.services.prober.probe(url).await;
        if let Some(snapshot) = self.record(url, available) {
            self.services.persistence.checkpoint_now(&snapshot);
            self.services.renderer.render(&snapshot);
        }
        tracing::info!(url, available, "rechecked");
        self.services.renderer.notify(Notice::Rechecked {
            url: url.to_string(),
            available,
        });
        available
    }

    /// Probes every unavailable result again, one at a time, rendering after
    /// each answer. Returns how many came back.
    pub async fn recheck_invalid(&mut self) -> usize {
        let urls: Vec<String> = lock_state(&self.state)
            .invalid()
            .map(|(_, result)| result.url.clone())
            .collect();

        let mut recovered = 0;
        for url in &urls {
            let available = self.services.prober.probe(url).await;
            if let Some(snapshot) = self.record(url, available) {
                self.services.renderer.render(&snapshot);
                if available {
                    recovered += 1;
                }
            }
        }

        if !urls.is_empty() {
            self.services.persistence.checkpoint_now(&self.snapshot());
        }
        tracing::info!(checked = urls.len(), recovered, "rechecked invalid bookmarks");
        self.services.renderer.notify(Notice::RecheckedInvalid {
            checked: urls.len(),
            recovered,
        });
        recovered
    }

    /// Stores a single answer. `None` when `url` has no result.
    fn record(&self, url: &str, available: bool) -> Option<CheckingState> {
        let mut state = lock_state(&self.state);
        let index = state.results.iter().position(|r| r.url == url)?;
        state.apply_updates(&[ProbeUpdate {
            index,
            url: url.to_string(),
            available,
        }]);
        Some(state.clone())
    }

    /// Stops the engine without finishing the check, removes any proxy and
    /// saves the state so the next `open` resumes from here.
    pub async fn close(mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
        if lock_state(&self.state).proxy_applied {
            self.services.proxy.clear();
            lock_state(&self.state).proxy_applied = false;
        }
        let snapshot = self.snapshot();
        if snapshot.is_checking {
            tracing::info!(
                checked = snapshot.checked_count,
                total = snapshot.total_count,
                "closing with check in progress"
            );
            self.services.persistence.checkpoint_now(&snapshot);
        }
    }
}
