use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use super::settings::sanitize_threads_per_batch;
use super::store::KeyValueStore;
use super::types::CheckingState;

/// Durable copy, read back when the popup opens.
pub const DURABLE_KEY: &str = "bookmarkCheckResults";
/// Tab-local copy, read back when the popup becomes visible again.
pub const SESSION_KEY: &str = "bookmarkCheckingStatus";
/// Throttled checkpoints between two durable writes.
pub const DURABLE_EVERY: usize = 4;

/// Mirrors the checking state into the fast and durable stores.
///
/// Every write is a full snapshot. Failures are logged and swallowed; the
/// next successful checkpoint restores durability.
pub struct PersistenceBridge {
    session: Arc<dyn KeyValueStore>,
    durable: Arc<dyn KeyValueStore>,
    durable_every: usize,
    checkpoints: AtomicUsize,
}

impl PersistenceBridge {
    pub fn new(session: Arc<dyn KeyValueStore>, durable: Arc<dyn KeyValueStore>) -> Self {
        Self {
            session,
            durable,
            durable_every: DURABLE_EVERY,
            checkpoints: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub fn with_durable_every(mut self, every: usize) -> Self {
        self.durable_every = every.max(1);
        self
    }

    /// Progress-cadence checkpoint: always tab-local, durable every
    /// `durable_every` calls.
    pub fn checkpoint(&self, state: &CheckingState) {
        self.write_session(state);
        let count = self.checkpoints.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.durable_every == 0 {
            self.save_results(state);
        }
    }

    /// Writes both copies right away.
    pub fn checkpoint_now(&self, state: &CheckingState) {
        self.write_session(state);
        self.save_results(state);
    }

    /// Durable write. An empty result set removes the key so a reload does not
    /// resurrect a finished, empty check.
    pub fn save_results(&self, state: &CheckingState) {
        let outcome = if state.results.is_empty() {
            self.durable.remove(DURABLE_KEY)
        } else {
            match serde_json::to_value(state) {
                Ok(value) => self.durable.set(DURABLE_KEY, value),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode check results");
                    return;
                }
            }
        };
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "failed to persist check results");
        }
    }

    pub fn load_checkpoint(&self) -> Option<CheckingState> {
        read_state(self.durable.as_ref(), DURABLE_KEY)
    }

    pub fn load_session(&self) -> Option<CheckingState> {
        read_state(self.session.as_ref(), SESSION_KEY)
    }

    pub fn discard_session(&self) {
        if let Err(err) = self.session.remove(SESSION_KEY) {
            tracing::warn!(error = %err, "failed to discard session checkpoint");
        }
    }

    fn write_session(&self, state: &CheckingState) {
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode checkpoint");
                return;
            }
        };
        if let Err(err) = self.session.set(SESSION_KEY, value) {
            tracing::warn!(error = %err, "failed to write session checkpoint");
        }
    }
}

fn read_state(store: &dyn KeyValueStore, key: &str) -> Option<CheckingState> {
    let value: Value = match store.get(key) {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(key, error = %err, "failed to read checkpoint");
            return None;
        }
    };
    match serde_json::from_value::<CheckingState>(value) {
        Ok(mut state) => {
            state.batch_size = sanitize_threads_per_batch(state.batch_size);
            state.recount();
            Some(state)
        }
        Err(err) => {
            tracing::warn!(key, error = %err, "discarding unreadable checkpoint");
            if let Err(err) = store.remove(key) {
                tracing::warn!(key, error = %err, "failed to remove unreadable checkpoint");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::store::MemoryStore;
    use crate::app::testing::FailingStore;
    use crate::app::types::CheckResult;
    use serde_json::json;

    fn bridge() -> (Arc<MemoryStore>, Arc<MemoryStore>, PersistenceBridge) {
        let session = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryStore::new());
        let bridge = PersistenceBridge::new(session.clone(), durable.clone());
        (session, durable, bridge)
    }

    fn running() -> CheckingState {
        CheckingState::start(vec![CheckResult::pending("a", "http://a")], 3)
    }

    #[test]
    fn durable_copy_follows_coarser_cadence() {
        let (session, durable, bridge) = bridge();
        let state = running();
        for _ in 0..DURABLE_EVERY - 1 {
            bridge.checkpoint(&state);
        }
        assert!(session.get(SESSION_KEY).unwrap().is_some());
        assert!(durable.get(DURABLE_KEY).unwrap().is_none());

        bridge.checkpoint(&state);
        assert_eq!(bridge.load_checkpoint(), Some(state));
    }

    #[test]
    fn empty_results_delete_the_durable_key() {
        let (_session, durable, bridge) = bridge();
        bridge.checkpoint_now(&running());
        assert!(durable.get(DURABLE_KEY).unwrap().is_some());

        bridge.save_results(&CheckingState::default());
        assert!(durable.get(DURABLE_KEY).unwrap().is_none());
    }

    #[test]
    fn loaded_counts_are_rebuilt_from_results() {
        let (_session, durable, bridge) = bridge();
        durable
            .set(
                DURABLE_KEY,
                json!({
                    "isChecking": true,
                    "checkedCount": 40,
                    "totalCount": 1,
                    "batchSize": 0,
                    "results": [
                        {"title": "a", "url": "http://a", "status": false},
                        {"title": "b", "url": "http://b", "status": null}
                    ]
                }),
            )
            .unwrap();
        let state = bridge.load_checkpoint().unwrap();
        assert_eq!((state.checked_count, state.total_count), (1, 2));
        assert_eq!(state.batch_size, 1);
    }

    #[test]
    fn loaded_batch_size_is_clamped_to_the_thread_limit() {
        let (_session, durable, bridge) = bridge();
        durable
            .set(
                DURABLE_KEY,
                json!({
                    "isChecking": true,
                    "batchSize": 500,
                    "results": [{"title": "a", "url": "http://a", "status": null}]
                }),
            )
            .unwrap();
        assert_eq!(bridge.load_checkpoint().unwrap().batch_size, 20);
    }

    #[test]
    fn unreadable_checkpoint_is_dropped() {
        let (session, _durable, bridge) = bridge();
        session.set(SESSION_KEY, json!({"results": 5})).unwrap();
        assert!(bridge.load_session().is_none());
        assert!(session.get(SESSION_KEY).unwrap().is_none());
    }

    #[test]
    fn store_failures_are_swallowed() {
        let bridge = PersistenceBridge::new(Arc::new(FailingStore), Arc::new(FailingStore))
            .with_durable_every(1);
        bridge.checkpoint(&running());
        bridge.checkpoint_now(&running());
        bridge.discard_session();
        assert!(bridge.load_checkpoint().is_none());
        assert!(bridge.load_session().is_none());
    }
}
