use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;

use super::persistence::PersistenceBridge;
use super::probe::Probe;
use super::proxy::ProxyController;
use super::settings::SettingsStore;
use super::types::{CheckingState, Notice, Outcome, Phase, ProbeUpdate, Renderer};

pub const BATCH_DELAY: Duration = Duration::from_millis(300);
pub const RESCHEDULE_DELAY: Duration = Duration::from_millis(100);
pub const MIN_REFRESH_EVERY: usize = 5;

pub type SharedState = Arc<Mutex<CheckingState>>;

pub fn lock_state(state: &SharedState) -> MutexGuard<'_, CheckingState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cooperative cancellation token, polled at iteration boundaries, after a
/// batch settles and before pacing. In-flight probes are never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub batch_delay: Duration,
    pub reschedule: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            batch_delay: BATCH_DELAY,
            reschedule: RESCHEDULE_DELAY,
        }
    }
}

/// What the next iteration has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Idle,
    Cancel,
    /// A resumed proxy-phase check whose proxy did not survive the restart.
    RestoreProxy,
    EnterProxyPhase,
    Complete,
    Probe {
        batch: Vec<(usize, String)>,
        last: bool,
    },
}

/// Pure transition function of the check state machine.
pub fn plan(state: &CheckingState, proxy_retry_enabled: bool) -> Step {
    if !state.is_checking {
        return Step::Idle;
    }
    if state.should_cancel {
        return Step::Cancel;
    }
    if state.phase == Phase::Proxy && !state.proxy_applied {
        return Step::RestoreProxy;
    }

    let pending = state.pending();
    if pending.is_empty() {
        return if state.phase == Phase::Direct && proxy_retry_enabled && state.has_failures() {
            Step::EnterProxyPhase
        } else {
            Step::Complete
        };
    }

    let batch_size = state.batch_size.max(1);
    let last = pending.len() <= batch_size;
    Step::Probe {
        batch: pending.into_iter().take(batch_size).collect(),
        last,
    }
}

/// Checked URLs between two observer refreshes: 5% of the total, at least 5.
pub fn refresh_threshold(total: usize) -> usize {
    (total * 5 / 100).max(MIN_REFRESH_EVERY)
}

enum Flow {
    Continue(Duration),
    Stop(Option<Outcome>),
}

/// Executes `plan` steps against the shared state until the check finishes,
/// is cancelled or is found idle.
pub struct Engine<P: Probe> {
    state: SharedState,
    cancel: CancelFlag,
    prober: Arc<P>,
    proxy: Arc<ProxyController>,
    persistence: Arc<PersistenceBridge>,
    renderer: Arc<dyn Renderer>,
    settings: SettingsStore,
    pacing: Pacing,
    since_refresh: usize,
}

impl<P: Probe> Engine<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        cancel: CancelFlag,
        prober: Arc<P>,
        proxy: Arc<ProxyController>,
        persistence: Arc<PersistenceBridge>,
        renderer: Arc<dyn Renderer>,
        settings: SettingsStore,
        pacing: Pacing,
    ) -> Self {
        Self {
            state,
            cancel,
            prober,
            proxy,
            persistence,
            renderer,
            settings,
            pacing,
            since_refresh: 0,
        }
    }

    pub async fn run(mut self) -> Option<Outcome> {
        loop {
            match self.iterate().await {
                Flow::Continue(delay) => {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                Flow::Stop(outcome) => return outcome,
            }
        }
    }

    async fn iterate(&mut self) -> Flow {
        let step = {
            let mut state = lock_state(&self.state);
            if state.is_checking && self.cancel.is_cancelled() {
                state.should_cancel = true;
            }
            plan(&state, self.settings.get().enable_proxy_retry)
        };

        match step {
            Step::Idle => Flow::Stop(None),
            Step::Cancel => Flow::Stop(Some(self.finalize(Outcome::Cancelled))),
            Step::Complete => {
                let invalid = lock_state(&self.state).invalid_count();
                Flow::Stop(Some(self.finalize(Outcome::Completed { invalid })))
            }
            Step::RestoreProxy => self.restore_proxy(),
            Step::EnterProxyPhase => self.enter_proxy_phase(),
            Step::Probe { batch, last } => self.run_batch(batch, last).await,
        }
    }

    fn restore_proxy(&mut self) -> Flow {
        if !self.proxy.apply(&self.settings.get()) {
            return Flow::Stop(Some(self.finalize(Outcome::ProxyFailed)));
        }
        lock_state(&self.state).proxy_applied = true;
        tracing::info!("proxy restored for resumed check");
        Flow::Continue(Duration::ZERO)
    }

    fn enter_proxy_phase(&mut self) -> Flow {
        let retrying = lock_state(&self.state).invalid_count();
        self.renderer.notify(Notice::SwitchingToProxy { retrying });

        let applied = self.proxy.apply(&self.settings.get());
        let snapshot = {
            let mut state = lock_state(&self.state);
            if !applied {
                state.phase = Phase::Proxy;
                None
            } else {
                state.proxy_applied = true;
                state.enter_proxy_phase();
                Some(state.clone())
            }
        };
        let Some(snapshot) = snapshot else {
            return Flow::Stop(Some(self.finalize(Outcome::ProxyFailed)));
        };

        tracing::info!(retrying, "entered proxy phase");
        self.since_refresh = 0;
        self.renderer.render(&snapshot);
        self.persistence.checkpoint_now(&snapshot);
        Flow::Continue(self.pacing.reschedule)
    }

    async fn run_batch(&mut self, batch: Vec<(usize, String)>, last: bool) -> Flow {
        let mut set = JoinSet::new();
        for (index, url) in batch.iter().cloned() {
            let prober = self.prober.clone();
            set.spawn(async move {
                let available = prober.probe(&url).await;
                ProbeUpdate {
                    index,
                    url,
                    available,
                }
            });
        }

        let mut updates = Vec::with_capacity(batch.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(update) => updates.push(update),
                Err(err) => tracing::warn!(error = %err, "probe task failed"),
            }
        }
        // A probe that died still resolves its entry, as unavailable.
        for (index, url) in batch {
            if !updates.iter().any(|u| u.index == index) {
                updates.push(ProbeUpdate {
                    index,
                    url,
                    available: false,
                });
            }
        }
        updates.sort_by_key(|u| u.index);

        if self.cancel.is_cancelled() {
            tracing::debug!(discarded = updates.len(), "batch settled after cancel");
            lock_state(&self.state).should_cancel = true;
            return Flow::Stop(Some(self.finalize(Outcome::Cancelled)));
        }

        let total = {
            let mut state = lock_state(&self.state);
            self.since_refresh += state.apply_updates(&updates);
            state.total_count
        };
        if self.since_refresh >= refresh_threshold(total) || last {
            self.refresh().await;
        }

        if self.cancel.is_cancelled() {
            return Flow::Continue(Duration::ZERO);
        }
        tokio::time::sleep(self.pacing.batch_delay).await;
        Flow::Continue(self.pacing.reschedule)
    }

    /// Renders and checkpoints the current state. Awaited inline, so two
    /// refreshes never overlap. The store write runs on the blocking pool.
    async fn refresh(&mut self) {
        let snapshot = lock_state(&self.state).clone();
        self.since_refresh = 0;
        self.renderer.render(&snapshot);
        let persistence = self.persistence.clone();
        let write = tokio::task::spawn_blocking(move || persistence.checkpoint(&snapshot));
        if let Err(err) = write.await {
            tracing::warn!(error = %err, "checkpoint task failed");
        }
    }

    /// Single exit path: proxy teardown first, then idle.
    fn finalize(&mut self, outcome: Outcome) -> Outcome {
        let proxy_applied = lock_state(&self.state).proxy_applied;
        if proxy_applied {
            self.proxy.clear();
        }
        let snapshot = {
            let mut state = lock_state(&self.state);
            state.proxy_applied = false;
            state.finish();
            state.clone()
        };

        tracing::info!(
            ?outcome,
            checked = snapshot.checked_count,
            total = snapshot.total_count,
            invalid = snapshot.invalid_count(),
            "check finished"
        );
        self.renderer.render(&snapshot);
        self.renderer.notify(Notice::Finished(outcome));
        self.persistence.checkpoint_now(&snapshot);
        outcome
    }
}
