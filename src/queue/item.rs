//! Queue item types: lifecycle state, per-item options, progress and parts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::manifest::{Manifest, Source};

/// Default split threshold (300 MB).
pub const DEFAULT_SPLIT_THRESHOLD_BYTES: u64 = 300 * 1024 * 1024;

/// Lifecycle of one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Submitted, manifest not yet resolved.
    Pending,
    /// Resolving the manifest.
    ManifestLoading,
    /// Manifest known, nothing downloaded yet.
    Ready,
    /// Page tasks are running.
    Downloading,
    /// Dispatch halted; in-flight pages drained.
    Paused,
    /// Every part written.
    Completed,
    /// Unrecoverable for this item.
    Failed,
    /// Cancelled by a queue-wide stop.
    Stopped,
}

impl ItemState {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ManifestLoading => "manifest_loading",
            Self::Ready => "ready",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// `Completed` or `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States `start`/`resume` pick up.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::Paused | Self::Stopped)
    }

    /// State to restore after an unclean shutdown.
    #[must_use]
    pub fn after_restart(self) -> Self {
        match self {
            Self::Downloading => Self::Paused,
            Self::ManifestLoading => Self::Pending,
            other => other,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "manifest_loading" => Ok(Self::ManifestLoading),
            "ready" => Ok(Self::Ready),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("invalid item state: {s}")),
        }
    }
}

/// Inclusive 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    /// Intersects the range with `1..=total`; `None` when nothing remains.
    #[must_use]
    pub fn clamp(&self, total: u32) -> Option<(u32, u32)> {
        let first = self.first.max(1);
        let last = self.last.min(total);
        (first <= last).then_some((first, last))
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl std::str::FromStr for PageRange {
    type Err = String;

    /// Accepts `N`, `A-B`, `A-` (to the end) and `-B`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |v: &str, default: u32| -> Result<u32, String> {
            if v.trim().is_empty() {
                Ok(default)
            } else {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid page number '{v}'"))
            }
        };
        let (first, last) = match s.split_once('-') {
            Some((a, b)) => (parse(a, 1)?, parse(b, u32::MAX)?),
            None => {
                let n = parse(s, 0)?;
                (n, n)
            }
        };
        if first == 0 || first > last {
            return Err(format!("invalid page range '{s}'"));
        }
        Ok(Self { first, last })
    }
}

/// Per-item download options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemOptions {
    /// Pages to fetch; all when `None`.
    pub page_range: Option<PageRange>,
    /// Item concurrency; the global setting when `None`.
    pub concurrency: Option<usize>,
    /// Part size bound in bytes.
    pub split_threshold_bytes: u64,
    /// When false the item is always a single part.
    pub split_enabled: bool,
}

impl Default for ItemOptions {
    fn default() -> Self {
        Self {
            page_range: None,
            concurrency: None,
            split_threshold_bytes: DEFAULT_SPLIT_THRESHOLD_BYTES,
            split_enabled: true,
        }
    }
}

impl ItemOptions {
    /// Selected `(first, last)` page indices for a manifest of `total` pages.
    #[must_use]
    pub fn selection(&self, total: u32) -> Option<(u32, u32)> {
        match self.page_range {
            Some(range) => range.clamp(total),
            None => (total > 0).then_some((1, total)),
        }
    }
}

/// Download counters and the per-page record used for resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressState {
    /// Pages in the selection.
    pub total_pages: u32,
    /// Pages that reached a terminal outcome.
    pub attempted: u32,
    /// Pages staged successfully.
    pub succeeded: u32,
    /// Pages replaced by placeholders.
    pub failed: u32,
    /// Bytes of page data received.
    pub bytes_transferred: u64,
    /// Failed page indices, ascending.
    pub failed_pages: Vec<u32>,
    /// Staged page index to staged size.
    pub completed_pages: BTreeMap<u32, u64>,
}

impl ProgressState {
    /// Fresh progress for a selection of `total` pages.
    #[must_use]
    pub fn for_selection(total: u32) -> Self {
        Self {
            total_pages: total,
            ..Self::default()
        }
    }

    /// Records a staged page. Repeats are ignored.
    pub fn record_success(&mut self, index: u32, bytes: u64) {
        if self.completed_pages.insert(index, bytes).is_some() {
            return;
        }
        if let Ok(pos) = self.failed_pages.binary_search(&index) {
            self.failed_pages.remove(pos);
            self.failed -= 1;
        } else {
            self.attempted += 1;
        }
        self.succeeded += 1;
        self.bytes_transferred += bytes;
    }

    /// Records a page that fell back to a placeholder. Repeats are ignored.
    pub fn record_failure(&mut self, index: u32) {
        if self.completed_pages.contains_key(&index) {
            return;
        }
        if let Err(pos) = self.failed_pages.binary_search(&index) {
            self.failed_pages.insert(pos, index);
            self.failed += 1;
            self.attempted += 1;
        }
    }

    /// Forgets failed pages at or after `from` so a retry fetches them again.
    pub fn clear_failures(&mut self, from: u32) {
        let before = self.failed_pages.len();
        self.failed_pages.retain(|&index| index < from);
        let cleared = u32::try_from(before - self.failed_pages.len()).unwrap_or(u32::MAX);
        self.failed = self.failed.saturating_sub(cleared);
        self.attempted = self.attempted.saturating_sub(cleared);
    }

    /// Drops a staged page whose file has gone missing.
    pub fn forget(&mut self, index: u32) {
        if let Some(bytes) = self.completed_pages.remove(&index) {
            self.succeeded = self.succeeded.saturating_sub(1);
            self.attempted = self.attempted.saturating_sub(1);
            self.bytes_transferred = self.bytes_transferred.saturating_sub(bytes);
        }
    }

    /// True once `index` has a terminal outcome.
    #[must_use]
    pub fn is_settled(&self, index: u32) -> bool {
        self.completed_pages.contains_key(&index) || self.failed_pages.binary_search(&index).is_ok()
    }
}

/// A finalized (or failed) output part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// 1-based creation order.
    pub number: u32,
    /// First page index, inclusive.
    pub first_page: u32,
    /// Last page index, inclusive.
    pub last_page: u32,
    /// Sum of staged page sizes.
    pub bytes: u64,
    /// Written artifact; `None` while unwritten or when writing failed.
    pub artifact: Option<PathBuf>,
}

/// Authoritative in-memory record of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub source: Source,
    pub title: Option<String>,
    pub state: ItemState,
    pub options: ItemOptions,
    pub progress: ProgressState,
    pub manifest: Option<Manifest>,
    pub parts: Vec<PartRecord>,
    /// Artifact name claimed for this item's output, unique across the queue.
    pub file_stem: Option<String>,
    pub status_message: Option<String>,
    pub last_error: Option<String>,
    /// Bumped on every mutation; persisted writes never go backwards.
    pub revision: i64,
    pub created_at: String,
}

/// Read-only projection handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemView {
    pub id: i64,
    pub url: String,
    pub adapter_id: String,
    pub title: Option<String>,
    pub state: ItemState,
    pub options: ItemOptions,
    pub progress: ProgressState,
    pub parts: Vec<PartRecord>,
    pub status_message: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl From<&QueueItem> for QueueItemView {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id,
            url: item.source.url.clone(),
            adapter_id: item.source.adapter_id.clone(),
            title: item.title.clone(),
            state: item.state,
            options: item.options.clone(),
            progress: item.progress.clone(),
            parts: item.parts.clone(),
            status_message: item.status_message.clone(),
            last_error: item.last_error.clone(),
            created_at: item.created_at.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== ItemState Tests ====================

    #[test]
    fn test_item_state_round_trips_through_str() {
        for state in [
            ItemState::Pending,
            ItemState::ManifestLoading,
            ItemState::Ready,
            ItemState::Downloading,
            ItemState::Paused,
            ItemState::Completed,
            ItemState::Failed,
            ItemState::Stopped,
        ] {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("in_progress".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_after_restart_normalizes_interrupted_states() {
        assert_eq!(ItemState::Downloading.after_restart(), ItemState::Paused);
        assert_eq!(ItemState::ManifestLoading.after_restart(), ItemState::Pending);
        assert_eq!(ItemState::Completed.after_restart(), ItemState::Completed);
    }

    // ==================== PageRange Tests ====================

    #[test]
    fn test_page_range_parse_forms() {
        assert_eq!("10-20".parse::<PageRange>().unwrap(), PageRange { first: 10, last: 20 });
        assert_eq!("7".parse::<PageRange>().unwrap(), PageRange { first: 7, last: 7 });
        assert_eq!("5-".parse::<PageRange>().unwrap().last, u32::MAX);
        assert_eq!("-3".parse::<PageRange>().unwrap().first, 1);
        assert!("0".parse::<PageRange>().is_err());
        assert!("9-2".parse::<PageRange>().is_err());
        assert!("a-b".parse::<PageRange>().is_err());
    }

    #[test]
    fn test_selection_is_clamped_to_manifest() {
        let mut options = ItemOptions::default();
        assert_eq!(options.selection(12), Some((1, 12)));
        options.page_range = Some(PageRange { first: 10, last: 40 });
        assert_eq!(options.selection(12), Some((10, 12)));
        assert_eq!(options.selection(9), None);
    }

    // ==================== ProgressState Tests ====================

    #[test]
    fn test_progress_counts_are_idempotent() {
        let mut progress = ProgressState::for_selection(4);
        progress.record_success(1, 100);
        progress.record_success(1, 100);
        progress.record_failure(3);
        progress.record_failure(3);
        progress.record_failure(2);
        assert_eq!(progress.attempted, 3);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 2);
        assert_eq!(progress.failed_pages, vec![2, 3]);
        assert_eq!(progress.bytes_transferred, 100);
    }

    #[test]
    fn test_retry_success_replaces_failure() {
        let mut progress = ProgressState::for_selection(2);
        progress.record_failure(2);
        progress.record_success(2, 50);
        assert_eq!(progress.failed, 0);
        assert!(progress.failed_pages.is_empty());
        assert_eq!(progress.attempted, 1);
        assert!(progress.is_settled(2));
        assert!(!progress.is_settled(1));
    }

    #[test]
    fn test_clear_failures_reopens_pages() {
        let mut progress = ProgressState::for_selection(3);
        progress.record_success(1, 10);
        progress.record_failure(2);
        progress.record_failure(3);
        progress.clear_failures(3);
        assert_eq!(progress.attempted, 2);
        assert_eq!(progress.failed_pages, vec![2]);
        assert!(!progress.is_settled(3));

        progress.clear_failures(1);
        assert_eq!(progress.attempted, 1);
        assert_eq!(progress.failed, 0);
        assert!(!progress.is_settled(2));
    }

    #[test]
    fn test_forget_missing_page() {
        let mut progress = ProgressState::for_selection(2);
        progress.record_success(1, 10);
        progress.record_success(2, 5);
        progress.forget(1);
        progress.forget(9);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.attempted, 1);
        assert_eq!(progress.bytes_transferred, 5);
        assert!(!progress.is_settled(1));
    }
}
