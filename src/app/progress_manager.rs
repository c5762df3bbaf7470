//! Progress bars for queue runs, driven by [`QueueEvent`]s.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use manuscript_core::{ItemState, Orchestrator, QueueEvent, QueueItemView};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const LABEL_WIDTH: usize = 48;

/// Spawns the progress UI when requested.
///
/// Returns `(handle, stop)`; cancel `stop` and await the handle once the run is
/// over. When disabled, the handle is `None` and `stop` is already cancelled.
/// The event subscription is taken before returning, so nothing emitted after
/// this call is missed.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    orchestrator: &Orchestrator,
) -> (Option<JoinHandle<()>>, CancellationToken) {
    let stop = CancellationToken::new();
    if !enabled {
        stop.cancel();
        return (None, stop);
    }
    let events = orchestrator.subscribe();
    let handle = tokio::spawn(render(orchestrator.clone(), events, stop.clone()));
    (Some(handle), stop)
}

async fn render(
    orchestrator: Orchestrator,
    mut events: tokio::sync::broadcast::Receiver<QueueEvent>,
    stop: CancellationToken,
) {
    let mut bars = ItemBars::new();
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => bars.apply(&orchestrator, &event),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress UI fell behind; resyncing");
                bars.resync(&orchestrator);
            }
            Err(RecvError::Closed) => break,
        }
    }
    bars.abandon_unfinished();
}

struct ItemBars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<i64, ProgressBar>,
}

impl ItemBars {
    fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({elapsed})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi: MultiProgress::new(),
            style,
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, orchestrator: &Orchestrator, id: i64) -> &ProgressBar {
        self.bars.entry(id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            bar.set_style(self.style.clone());
            bar.enable_steady_tick(Duration::from_millis(250));
            match orchestrator.item(id) {
                Some(view) => sync_bar(&bar, &view),
                None => bar.set_prefix(format!("#{id}")),
            }
            bar
        })
    }

    fn apply(&mut self, orchestrator: &Orchestrator, event: &QueueEvent) {
        match event {
            QueueEvent::StateChanged { id, state } => {
                let bar = self.bar(orchestrator, *id);
                if *state == ItemState::Downloading
                    && let Some(view) = orchestrator.item(*id)
                {
                    sync_bar(bar, &view);
                }
                bar.set_message(state.to_string());
            }
            QueueEvent::PageFinished { id, .. } => self.bar(orchestrator, *id).inc(1),
            QueueEvent::PartWritten { id, part } => {
                let line = match &part.artifact {
                    Some(path) => format!("#{id} wrote {}", path.display()),
                    None => format!("#{id} could not write part {}", part.number),
                };
                let _ = self.multi.println(line);
            }
            QueueEvent::ItemFinished { id, state, message } => {
                let bar = self.bar(orchestrator, *id);
                let text = message
                    .as_deref()
                    .map_or_else(|| state.to_string(), |m| format!("{state}: {m}"));
                if state.is_terminal() {
                    bar.finish_with_message(text);
                } else {
                    bar.set_message(text);
                }
            }
        }
    }

    fn resync(&mut self, orchestrator: &Orchestrator) {
        for (id, bar) in &self.bars {
            if let Some(view) = orchestrator.item(*id) {
                sync_bar(bar, &view);
            }
        }
    }

    fn abandon_unfinished(&self) {
        for bar in self.bars.values().filter(|bar| !bar.is_finished()) {
            bar.abandon();
        }
    }
}

fn sync_bar(bar: &ProgressBar, view: &QueueItemView) {
    bar.set_prefix(item_label(view));
    bar.set_length(u64::from(view.progress.total_pages));
    bar.set_position(u64::from(view.progress.attempted));
}

/// `#id title`, falling back to the URL, cut to a fixed width.
pub(crate) fn item_label(view: &QueueItemView) -> String {
    let name = view.title.as_deref().unwrap_or(&view.url);
    let label = format!("#{} {name}", view.id);
    if label.chars().count() <= LABEL_WIDTH {
        return label;
    }
    let cut: String = label.chars().take(LABEL_WIDTH - 1).collect();
    format!("{cut}…")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::app::context::AppContext;
    use crate::app_config::AppConfig;
    use manuscript_core::queue::ProgressState;
    use manuscript_core::{Database, ItemOptions};

    fn view(title: Option<&str>) -> QueueItemView {
        QueueItemView {
            id: 12,
            url: "https://iiif.test/codex/manifest.json".to_string(),
            adapter_id: "iiif".to_string(),
            title: title.map(str::to_string),
            state: ItemState::Pending,
            options: ItemOptions::default(),
            progress: ProgressState::default(),
            parts: Vec::new(),
            status_message: None,
            last_error: None,
            created_at: String::new(),
        }
    }

    async fn context() -> (tempfile::TempDir, AppContext) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::defaults(dir.path());
        let db = Database::new_in_memory().await.unwrap();
        let ctx = AppContext::with_database(config, db).await.unwrap();
        (dir, ctx)
    }

    // ==================== Label Tests ====================

    #[test]
    fn test_item_label_prefers_title() {
        assert_eq!(item_label(&view(Some("Codex Sangallensis"))), "#12 Codex Sangallensis");
        assert_eq!(
            item_label(&view(None)),
            "#12 https://iiif.test/codex/manifest.json"
        );
    }

    #[test]
    fn test_item_label_truncates_long_titles() {
        let label = item_label(&view(Some(&"x".repeat(100))));
        assert_eq!(label.chars().count(), LABEL_WIDTH);
        assert!(label.ends_with('…'));
    }

    #[test]
    fn test_item_label_truncates_long_urls() {
        let mut long = view(None);
        long.url = "https://iiif.test/collections/medieval/codex-0042/manifest.json".to_string();
        let label = item_label(&long);
        assert_eq!(label.chars().count(), LABEL_WIDTH);
        assert_eq!(label, "#12 https://iiif.test/collections/medieval/code…");
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_disabled_ui_has_no_task_and_is_already_stopped() {
        let (_dir, ctx) = context().await;
        let (handle, stop) = spawn_progress_ui(false, &ctx.orchestrator);
        assert!(handle.is_none());
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_enabled_ui_ends_when_stopped() {
        let (_dir, ctx) = context().await;
        let (handle, stop) = spawn_progress_ui(true, &ctx.orchestrator);
        assert!(handle.is_some());
        assert!(!stop.is_cancelled());

        stop.cancel();
        handle.unwrap().await.unwrap();
    }
}
