//! Queue orchestration: one driver task per item, queue-wide control and
//! progress events.
//!
//! # Concurrency Model
//!
//! - Each item runs in its own driver task, gated by an item semaphore of
//!   size `max_parallel_items`
//! - Page tasks hold a permit from the global page semaphore and one from the
//!   item's own pool
//! - `pause` halts dispatch and lets in-flight pages drain; `stop` also
//!   cancels in-flight fetches through a [`CancellationToken`]
//! - The [`QueueStore`] is the only shared mutable state; no lock is held
//!   across an `.await`

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::driver;
use super::error::{OrchestratorError, validate_concurrency};
use super::staging::Staging;
use super::worker::PageWorker;
use crate::fetch::{Fetcher, RetryPolicy};
use crate::manifest::Source;
use crate::output::OutputAssembler;
use crate::queue::{
    ItemOptions, ItemState, PartRecord, ProgressState, QueueError, QueueItemView, QueueStore,
};
use crate::resolver::{ManifestResolver, ResolveError};
use crate::tiles::{DEFAULT_TILE_CONCURRENCY, TileAssembler};

/// Default global page concurrency.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of items downloading at once.
pub const DEFAULT_MAX_PARALLEL_ITEMS: usize = 1;

const EVENT_CAPACITY: usize = 256;

/// Queue-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Progress notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// An item entered a new state.
    StateChanged { id: i64, state: ItemState },
    /// A page reached a terminal outcome.
    PageFinished {
        id: i64,
        page: u32,
        ok: bool,
        bytes: u64,
    },
    /// A part was written, or failed to be written (`artifact` is `None`).
    PartWritten { id: i64, part: PartRecord },
    /// A driver settled the item.
    ItemFinished {
        id: i64,
        state: ItemState,
        message: Option<String>,
    },
}

/// Settings for [`Orchestrator::new`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    pub max_parallel_items: usize,
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub tile_concurrency: usize,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_parallel_items: DEFAULT_MAX_PARALLEL_ITEMS,
            retry: RetryPolicy::default(),
            output_dir: output_dir.into(),
            staging_dir: staging_dir.into(),
            tile_concurrency: DEFAULT_TILE_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_max_parallel_items(mut self, items: usize) -> Self {
        self.max_parallel_items = items;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_tile_concurrency(mut self, tiles: usize) -> Self {
        self.tile_concurrency = tiles;
        self
    }
}

/// Stop signals for one driver. `halt` is a child of `cancel`, so a stop
/// also halts dispatch.
#[derive(Debug, Clone)]
pub(super) struct ItemControl {
    /// Stops dispatching new pages.
    pub(super) halt: CancellationToken,
    /// Aborts in-flight fetches.
    pub(super) cancel: CancellationToken,
}

impl ItemControl {
    fn new() -> Self {
        let cancel = CancellationToken::new();
        Self {
            halt: cancel.child_token(),
            cancel,
        }
    }
}

struct Run {
    control: ItemControl,
    handle: Option<JoinHandle<()>>,
}

/// State shared by the orchestrator handle and every driver.
pub(super) struct Inner {
    pub(super) store: Arc<QueueStore>,
    pub(super) resolver: ManifestResolver,
    pub(super) worker: PageWorker,
    pub(super) output: OutputAssembler,
    pub(super) staging: Staging,
    pub(super) output_dir: PathBuf,
    pub(super) concurrency: usize,
    pub(super) pages: Arc<Semaphore>,
    pub(super) item_slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
    runs: Mutex<HashMap<i64, Run>>,
    active: watch::Sender<usize>,
    events: broadcast::Sender<QueueEvent>,
}

impl Inner {
    fn lock_runs(&self) -> MutexGuard<'_, HashMap<i64, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_state(&self) -> QueueState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_queue_state(&self, state: QueueState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        debug!(state = ?state, "Queue state changed");
    }

    pub(super) fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(super) async fn set_state(&self, id: i64, state: ItemState) -> Result<(), QueueError> {
        self.store.update(id, |item| item.state = state).await?;
        self.emit(QueueEvent::StateChanged { id, state });
        Ok(())
    }

    /// Settles an item in `state` and announces it.
    pub(super) async fn settle(
        &self,
        id: i64,
        state: ItemState,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        let failed = state == ItemState::Failed;
        let status = message.clone();
        self.store
            .update(id, |item| {
                item.state = state;
                item.status_message = status;
                if failed {
                    item.last_error.clone_from(&item.status_message);
                }
            })
            .await?;
        self.emit(QueueEvent::StateChanged { id, state });
        self.emit(QueueEvent::ItemFinished { id, state, message });
        Ok(())
    }

    /// Called by a driver as its last step.
    pub(super) fn finish_run(&self, id: i64) {
        let mut runs = self.lock_runs();
        runs.remove(&id);
        if runs.is_empty() && self.queue_state() == QueueState::Running {
            self.set_queue_state(QueueState::Idle);
        }
        self.active.send_replace(runs.len());
    }

    /// Signals every live driver and takes their handles.
    fn signal_all(&self, signal: impl Fn(&ItemControl)) -> Vec<(i64, JoinHandle<()>)> {
        let mut runs = self.lock_runs();
        runs.iter_mut()
            .filter_map(|(id, run)| {
                signal(&run.control);
                run.handle.take().map(|handle| (*id, handle))
            })
            .collect()
    }
}

/// Download queue front end.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.inner.queue_state())
            .field("concurrency", &self.inner.concurrency)
            .field("active", &*self.inner.active.borrow())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator over an opened store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] if `config.concurrency`
    /// is out of range.
    pub fn new(
        store: Arc<QueueStore>,
        resolver: ManifestResolver,
        fetcher: Arc<dyn Fetcher>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let concurrency = validate_concurrency(config.concurrency)?;
        let tiles = TileAssembler::new(fetcher.clone(), config.tile_concurrency.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (active, _) = watch::channel(0);

        let inner = Inner {
            store,
            resolver,
            worker: PageWorker::new(fetcher, config.retry, tiles),
            output: OutputAssembler::new(),
            staging: Staging::new(config.staging_dir),
            output_dir: config.output_dir,
            concurrency,
            pages: Arc::new(Semaphore::new(concurrency)),
            item_slots: Arc::new(Semaphore::new(config.max_parallel_items.max(1))),
            state: Mutex::new(QueueState::Idle),
            runs: Mutex::new(HashMap::new()),
            active,
            events,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Adds a manuscript to the queue and returns its id.
    ///
    /// The URL is routed to an adapter up front; nothing is fetched. While the
    /// queue is running the new item starts right away.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Resolve`] with `UnsupportedSource` when no adapter
    /// claims the URL (no item is created), option validation errors, or a
    /// queue error.
    #[instrument(skip(self, options))]
    pub async fn enqueue(&self, url: &str, options: ItemOptions) -> Result<i64, OrchestratorError> {
        validate_options(&options)?;
        let url = url.trim();
        let adapter_id = self
            .inner
            .resolver
            .adapter_for(url)
            .map(|adapter| adapter.id())
            .ok_or_else(|| ResolveError::unsupported_source(url))?;

        let view = self
            .inner
            .store
            .insert(Source::new(url, adapter_id), options)
            .await?;
        info!(id = view.id, adapter = adapter_id, "Queued manuscript");
        self.inner.emit(QueueEvent::StateChanged {
            id: view.id,
            state: view.state,
        });

        if self.state() == QueueState::Running {
            self.launch(view.id);
        }
        Ok(view.id)
    }

    /// Starts a driver for every runnable item. Returns how many were started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> usize {
        self.inner.set_queue_state(QueueState::Running);
        let started = self.launch_where(ItemState::is_runnable);
        info!(started, "Queue started");
        started
    }

    /// Re-dispatches paused and stopped items, and any that never ran.
    ///
    /// Only pages without a staged result are fetched again.
    pub fn resume(&self) -> usize {
        self.inner.set_queue_state(QueueState::Running);
        let resumed = self.launch_where(ItemState::is_runnable);
        info!(resumed, "Queue resumed");
        resumed
    }

    /// Halts dispatch everywhere and waits for in-flight pages to drain.
    #[instrument(skip(self))]
    pub async fn pause(&self) {
        self.inner.set_queue_state(QueueState::Paused);
        let handles = self.inner.signal_all(|control| control.halt.cancel());
        join_drivers(handles).await;
    }

    /// Cancels every in-flight fetch and waits for drivers to settle.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.set_queue_state(QueueState::Stopped);
        let handles = self.inner.signal_all(|control| control.cancel.cancel());
        join_drivers(handles).await;
    }

    /// Waits until no driver is running.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        // The sender lives in `inner`, so this only ends at zero.
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Deletes an item and its staged pages. A running item is paused first.
    ///
    /// Written artifacts are left in place.
    ///
    /// # Errors
    ///
    /// [`QueueError::ItemNotFound`] (wrapped) or a database error.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: i64) -> Result<QueueItemView, OrchestratorError> {
        let handle = self.inner.lock_runs().get_mut(&id).and_then(|run| {
            run.control.halt.cancel();
            run.handle.take()
        });
        if let Some(handle) = handle {
            join_drivers(vec![(id, handle)]).await;
        }

        let removed = self.inner.store.remove(id).await?;
        self.inner.staging.remove_item(id).await;
        info!(id, "Removed item");
        Ok(QueueItemView::from(&removed))
    }

    /// Replaces an item's options.
    ///
    /// A changed page selection discards the item's parts and staged pages,
    /// and puts it back to `Ready` (or `Pending` before resolution).
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidState`] while the item is downloading or
    /// resolving, [`OrchestratorError::InvalidOptions`] when the new range
    /// selects no pages, plus validation and queue errors.
    #[instrument(skip(self, options))]
    pub async fn edit_options(
        &self,
        id: i64,
        options: ItemOptions,
    ) -> Result<QueueItemView, OrchestratorError> {
        validate_options(&options)?;
        let (view, reset) = self
            .inner
            .store
            .try_update(id, |item| {
                if matches!(item.state, ItemState::Downloading | ItemState::ManifestLoading) {
                    return Err(OrchestratorError::invalid_state(id, item.state, "edit"));
                }

                let total = item
                    .manifest
                    .as_ref()
                    .map(|manifest| u32::try_from(manifest.len()).unwrap_or(u32::MAX));
                let before = total.map(|total| item.options.selection(total));
                let after = total.map(|total| options.selection(total));
                if let (Some(total), Some(None)) = (total, after) {
                    let range = options.page_range.map(|range| range.to_string()).unwrap_or_default();
                    return Err(OrchestratorError::invalid_options(format!(
                        "page range {range} selects none of the {total} pages"
                    )));
                }
                let reset = before != after || item.options.page_range != options.page_range;

                item.options = options;
                if reset {
                    let selected = after.flatten().map_or(0, |(first, last)| last - first + 1);
                    item.progress = ProgressState::for_selection(selected);
                    item.parts.clear();
                    item.file_stem = None;
                    item.status_message = None;
                    item.last_error = None;
                    item.state = if item.manifest.is_some() {
                        ItemState::Ready
                    } else {
                        ItemState::Pending
                    };
                }
                Ok((QueueItemView::from(&*item), reset))
            })
            .await?;

        if reset {
            self.inner.staging.remove_item(id).await;
            info!(id, "Page selection changed; item reset");
            self.inner.emit(QueueEvent::StateChanged {
                id,
                state: view.state,
            });
            if self.state() == QueueState::Running {
                self.launch(id);
            }
        }
        Ok(view)
    }

    /// Puts a failed item back in the queue.
    ///
    /// The cached manifest is dropped so the item re-resolves. Failed pages
    /// not yet written into a part are fetched again, and output resumes at
    /// the first part that could not be written.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidState`] unless the item is `Failed`.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: i64) -> Result<QueueItemView, OrchestratorError> {
        let item = self
            .inner
            .store
            .snapshot(id)
            .ok_or(QueueError::ItemNotFound(id))?;
        if item.state != ItemState::Failed {
            return Err(OrchestratorError::invalid_state(id, item.state, "retry"));
        }
        self.inner.resolver.invalidate(&item.source.url);

        let keep = item
            .parts
            .iter()
            .position(|part| part.artifact.is_none())
            .unwrap_or(item.parts.len());
        let stale: Vec<PathBuf> = item.parts[keep..]
            .iter()
            .filter_map(|part| part.artifact.clone())
            .collect();

        let view = self
            .inner
            .store
            .update_with_manifest(id, |item| {
                item.parts.truncate(keep);
                let from = item.parts.last().map_or(0, |part| part.last_page + 1);
                item.progress.clear_failures(from);
                item.manifest = None;
                item.state = ItemState::Pending;
                item.status_message = None;
                item.last_error = None;
                QueueItemView::from(&*item)
            })
            .await?;

        for artifact in stale {
            if let Err(error) = tokio::fs::remove_file(&artifact).await {
                warn!(path = %artifact.display(), error = %error, "Could not delete stale part");
            }
        }
        info!(id, "Item queued for retry");
        self.inner.emit(QueueEvent::StateChanged {
            id,
            state: ItemState::Pending,
        });
        if self.state() == QueueState::Running {
            self.launch(id);
        }
        Ok(view)
    }

    /// Read-only projection of every item.
    #[must_use]
    pub fn items(&self) -> Vec<QueueItemView> {
        self.inner.store.views()
    }

    /// Read-only projection of one item.
    #[must_use]
    pub fn item(&self, id: i64) -> Option<QueueItemView> {
        self.inner.store.view(id)
    }

    /// Subscribes to progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        self.inner.queue_state()
    }

    /// The resolver used for manifests.
    #[must_use]
    pub fn resolver(&self) -> &ManifestResolver {
        &self.inner.resolver
    }

    fn launch_where(&self, eligible: impl Fn(&ItemState) -> bool) -> usize {
        let started = self
            .inner
            .store
            .views()
            .into_iter()
            .filter(|view| eligible(&view.state))
            .filter(|view| self.launch(view.id))
            .count();
        if self.inner.lock_runs().is_empty() && self.state() == QueueState::Running {
            self.inner.set_queue_state(QueueState::Idle);
        }
        started
    }

    /// Spawns a driver unless one is already live for `id`.
    fn launch(&self, id: i64) -> bool {
        let mut runs = self.inner.lock_runs();
        if runs.contains_key(&id) {
            return false;
        }
        let control = ItemControl::new();
        let handle = tokio::spawn(driver::drive(Arc::clone(&self.inner), id, control.clone()));
        runs.insert(
            id,
            Run {
                control,
                handle: Some(handle),
            },
        );
        self.inner.active.send_replace(runs.len());
        true
    }
}

async fn join_drivers(handles: Vec<(i64, JoinHandle<()>)>) {
    for (id, handle) in handles {
        if let Err(error) = handle.await {
            warn!(id, error = %error, "Item driver panicked");
        }
    }
}

fn validate_options(options: &ItemOptions) -> Result<(), OrchestratorError> {
    if let Some(concurrency) = options.concurrency {
        validate_concurrency(concurrency)?;
    }
    if options.split_enabled && options.split_threshold_bytes == 0 {
        return Err(OrchestratorError::invalid_options(
            "split threshold must be greater than zero",
        ));
    }
    Ok(())
}
