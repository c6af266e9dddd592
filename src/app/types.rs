use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use super::settings::sanitize_threads_per_batch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub fn scheme(self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5",
        }
    }
}

/// Which pass over the pending set is running. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Direct,
    Proxy,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Direct => "direct",
            Phase::Proxy => "proxy",
        }
    }
}

/// One candidate bookmark URL and its status in the current phase.
/// `status == None` means the URL is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub status: Option<bool>,
}

impl CheckResult {
    pub fn pending(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            status: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_none()
    }

    pub fn is_invalid(&self) -> bool {
        self.status == Some(false)
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            None => "checking",
            Some(true) => "available",
            Some(false) => "unavailable",
        }
    }
}

/// A buffered probe result. `url` lets the update find its entry again if the
/// result list shifted while the probe was in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeUpdate {
    pub index: usize,
    pub url: String,
    pub available: bool,
}

/// Single source of truth for a running or finished check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckingState {
    pub is_checking: bool,
    pub should_cancel: bool,
    pub phase: Phase,
    pub proxy_applied: bool,
    pub batch_size: usize,
    pub total_count: usize,
    pub checked_count: usize,
    pub results: Vec<CheckResult>,
}

impl Default for CheckingState {
    fn default() -> Self {
        Self {
            is_checking: false,
            should_cancel: false,
            phase: Phase::Direct,
            proxy_applied: false,
            batch_size: 1,
            total_count: 0,
            checked_count: 0,
            results: Vec::new(),
        }
    }
}

impl CheckingState {
    pub fn start(results: Vec<CheckResult>, batch_size: usize) -> Self {
        let mut state = Self {
            is_checking: true,
            batch_size: sanitize_threads_per_batch(batch_size),
            results,
            ..Self::default()
        };
        state.recount();
        state
    }

    pub fn progress(&self) -> u8 {
        if self.total_count == 0 {
            return 0;
        }
        ((self.checked_count.min(self.total_count) * 100) / self.total_count) as u8
    }

    /// Pending entries in discovery order.
    pub fn pending(&self) -> Vec<(usize, String)> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.is_pending())
            .map(|(index, result)| (index, result.url.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_pending()).count()
    }

    pub fn invalid_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_invalid()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(CheckResult::is_invalid)
    }

    pub fn invalid(&self) -> impl Iterator<Item = (usize, &CheckResult)> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.is_invalid())
    }

    /// Recomputes both counters from `results`.
    pub fn recount(&mut self) {
        self.total_count = self.results.len();
        self.checked_count = self.results.len() - self.pending_count();
    }

    /// Applies one settled batch. `checked_count` moves only for entries that
    /// were still pending right before the update. Returns how many updates
    /// landed on an entry.
    pub fn apply_updates(&mut self, updates: &[ProbeUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            let Some(index) = self.locate(update) else {
                tracing::debug!(url = %update.url, "dropping update for removed result");
                continue;
            };
            let entry = &mut self.results[index];
            if entry.status.is_none() {
                self.checked_count += 1;
            }
            entry.status = Some(update.available);
            applied += 1;
        }
        applied
    }

    fn locate(&self, update: &ProbeUpdate) -> Option<usize> {
        if self
            .results
            .get(update.index)
            .is_some_and(|r| r.url == update.url)
        {
            return Some(update.index);
        }
        self.results
            .iter()
            .position(|r| r.url == update.url && r.is_pending())
            .or_else(|| self.results.iter().position(|r| r.url == update.url))
    }

    /// Moves a check into the proxy pass: every failed entry becomes pending
    /// again and the counters are rebuilt.
    pub fn enter_proxy_phase(&mut self) -> usize {
        debug_assert_eq!(self.phase, Phase::Direct);
        self.phase = Phase::Proxy;
        let mut reset = 0;
        for result in &mut self.results {
            if result.is_invalid() {
                result.status = None;
                reset += 1;
            }
        }
        self.recount();
        reset
    }

    pub fn remove_url(&mut self, url: &str) -> Option<CheckResult> {
        let index = self.results.iter().position(|r| r.url == url)?;
        let removed = self.results.remove(index);
        self.recount();
        Some(removed)
    }

    /// Marks the check idle. Callers tear the proxy down first.
    pub fn finish(&mut self) {
        debug_assert!(!self.proxy_applied, "proxy must be cleared before finishing");
        self.is_checking = false;
        self.should_cancel = false;
    }
}

/// How a check lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { invalid: usize },
    Cancelled,
    ProxyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// User-facing messages. Terminal variants are emitted once per check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Started { total: usize },
    Resumed { checked: usize, total: usize },
    NoBookmarks,
    Cancelling,
    SwitchingToProxy { retrying: usize },
    Finished(Outcome),
    Deleted { title: String },
    DeletedInvalid { count: usize },
    BookmarkNotFound { url: String },
    Rechecked { url: String, available: bool },
    RecheckedInvalid { checked: usize, recovered: usize },
    Error(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Started { total } => write!(f, "checking {total} bookmarks"),
            Notice::Resumed { checked, total } => {
                write!(f, "resumed check at {checked}/{total}")
            }
            Notice::NoBookmarks => write!(f, "no bookmarks found"),
            Notice::Cancelling => write!(f, "cancelling check..."),
            Notice::SwitchingToProxy { retrying } => {
                write!(f, "retrying {retrying} failed links through the proxy")
            }
            Notice::Finished(Outcome::Completed { invalid: 0 }) => {
                write!(f, "check completed, no invalid bookmarks found")
            }
            Notice::Finished(Outcome::Completed { invalid }) => {
                write!(f, "check completed: {invalid} invalid bookmarks found")
            }
            Notice::Finished(Outcome::Cancelled) => write!(f, "check cancelled"),
            Notice::Finished(Outcome::ProxyFailed) => {
                write!(f, "proxy setup failed, check stopped")
            }
            Notice::Deleted { title } => write!(f, "deleted bookmark '{title}'"),
            Notice::DeletedInvalid { count } => write!(f, "deleted {count} invalid bookmarks"),
            Notice::BookmarkNotFound { url } => write!(f, "no bookmark found for {url}"),
            Notice::Rechecked {
                url,
                available: true,
            } => write!(f, "{url} is reachable again"),
            Notice::Rechecked {
                url,
                available: false,
            } => write!(f, "{url} is still unreachable"),
            Notice::RecheckedInvalid { checked: 0, .. } => {
                write!(f, "no invalid bookmarks to recheck")
            }
            Notice::RecheckedInvalid {
                checked,
                recovered: 0,
            } => write!(f, "rechecked {checked} invalid bookmarks, none recovered"),
            Notice::RecheckedInvalid { checked, recovered } => {
                write!(f, "rechecked {checked} invalid bookmarks, {recovered} reachable again")
            }
            Notice::Error(message) => write!(f, "{message}"),
        }
    }
}

impl Notice {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notice::Error(_)
                | Notice::NoBookmarks
                | Notice::BookmarkNotFound { .. }
                | Notice::Finished(Outcome::ProxyFailed)
                | Notice::Rechecked {
                    available: false,
                    ..
                }
        )
    }
}

/// Where results and progress go. The engine never knows what draws them.
pub trait Renderer: Send + Sync {
    fn render(&self, state: &CheckingState);
    fn notify(&self, notice: Notice);
}

#[derive(Debug)]
pub enum UiEvent {
    Render(Box<CheckingState>),
    Notice(Notice),
}

impl Renderer for UnboundedSender<UiEvent> {
    fn render(&self, state: &CheckingState) {
        let _ = self.send(UiEvent::Render(Box::new(state.clone())));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.send(UiEvent::Notice(notice));
    }
}

/// Headless rendering: progress and notices become log lines.
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&self, state: &CheckingState) {
        tracing::info!(
            phase = state.phase.label(),
            checked = state.checked_count,
            total = state.total_count,
            invalid = state.invalid_count(),
            "{}%",
            state.progress()
        );
    }

    fn notify(&self, notice: Notice) {
        if notice.is_error() {
            tracing::warn!("{notice}");
        } else {
            tracing::info!("{notice}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn state_with(urls: &[&str]) -> CheckingState {
        CheckingState::start(
            urls.iter()
                .map(|url| CheckResult::pending(format!("title {url}"), *url))
                .collect(),
            5,
        )
    }

    fn update(index: usize, url: &str, available: bool) -> ProbeUpdate {
        ProbeUpdate {
            index,
            url: url.to_string(),
            available,
        }
    }

    #[test]
    fn checked_count_moves_once_per_entry() {
        let mut state = state_with(&["http://a", "http://b"]);
        let first = [update(0, "http://a", false)];
        state.apply_updates(&first);
        state.apply_updates(&first);
        state.apply_updates(&[update(0, "http://a", true)]);
        assert_eq!(state.checked_count, 1);
        assert_eq!(state.results[0].status, Some(true));

        state.apply_updates(&[update(1, "http://b", true), update(1, "http://b", true)]);
        assert_eq!(state.checked_count, 2);
        assert_eq!(state.progress(), 100);
    }

    #[test]
    fn start_clamps_batch_size() {
        assert_eq!(CheckingState::start(Vec::new(), 0).batch_size, 1);
        assert_eq!(CheckingState::start(Vec::new(), 64).batch_size, 20);
    }

    #[test]
    fn progress_is_floored() {
        let mut state = state_with(&["http://a", "http://b", "http://c"]);
        state.apply_updates(&[update(0, "http://a", true)]);
        assert_eq!(state.progress(), 33);
        assert_eq!(CheckingState::default().progress(), 0);
    }

    #[test]
    fn updates_follow_their_url_after_a_removal() {
        let mut state = state_with(&["http://a", "http://b", "http://c"]);
        state.remove_url("http://a");
        let applied = state.apply_updates(&[
            update(1, "http://b", true),
            update(2, "http://c", false),
            update(0, "http://a", true),
        ]);
        assert_eq!(applied, 2);
        assert_eq!(state.results[0].status, Some(true));
        assert_eq!(state.results[1].status, Some(false));
        assert_eq!((state.checked_count, state.total_count), (2, 2));
    }

    #[test]
    fn proxy_phase_resets_only_failures() {
        let mut state = state_with(&["http://a", "http://b", "http://c"]);
        state.apply_updates(&[
            update(0, "http://a", true),
            update(1, "http://b", false),
            update(2, "http://c", false),
        ]);
        let reset = state.enter_proxy_phase();
        assert_eq!(reset, 2);
        assert_eq!(state.phase, Phase::Proxy);
        assert_eq!(state.checked_count, 1);
        assert_eq!(
            state.pending(),
            vec![(1, "http://b".to_string()), (2, "http://c".to_string())]
        );
    }

    #[test]
    fn persisted_shape_is_camel_case_with_null_pending() {
        let state = state_with(&["http://a"]);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["isChecking"], json!(true));
        assert_eq!(value["phase"], json!("direct"));
        assert_eq!(value["results"][0]["status"], json!(null));

        let back: CheckingState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn notices_render_terminal_messages() {
        assert_eq!(
            Notice::Finished(Outcome::Completed { invalid: 3 }).to_string(),
            "check completed: 3 invalid bookmarks found"
        );
        assert!(Notice::Finished(Outcome::ProxyFailed).is_error());
        assert!(!Notice::Finished(Outcome::Cancelled).is_error());
    }
}
