//! One item's run: resolve the manifest, dispatch pages, seal parts in
//! manifest order and settle the item.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::error::OrchestratorError;
use super::orchestrator::{Inner, ItemControl, QueueEvent};
use super::slots::{PageOutcome, PageSlots};
use super::split::{PartPlanner, SealedPart};
use super::worker::PageError;
use crate::manifest::{Manifest, Page};
use crate::output::{PageContent, PartJob, PartPage, artifact_path, file_stem, summary_message};
use crate::queue::{ItemOptions, ItemState, PartRecord, ProgressState, QueueItem};

/// Placeholder reason for pages that failed before a resume.
const EARLIER_FAILURE: &str = "failed in an earlier run";

/// What a run works from once the manifest is known.
struct Plan {
    first: u32,
    last: u32,
    cursor: u32,
    concurrency: usize,
    title: String,
    stem: String,
    options: ItemOptions,
    progress: ProgressState,
    next_part: u32,
    write_failed: bool,
}

/// Driver entry point. Always releases the item's run slot.
pub(super) async fn drive(inner: Arc<Inner>, id: i64, control: ItemControl) {
    if let Err(error) = run(&inner, id, &control).await {
        error!(id, error = %error, "Item run aborted");
        if let Err(settle_error) = inner
            .settle(id, ItemState::Failed, Some(error.to_string()))
            .await
        {
            warn!(id, error = %settle_error, "Could not record item failure");
        }
    }
    inner.finish_run(id);
}

#[instrument(skip(inner, control))]
async fn run(inner: &Arc<Inner>, id: i64, control: &ItemControl) -> Result<(), OrchestratorError> {
    let _slot = tokio::select! {
        biased;
        () = control.halt.cancelled() => return Ok(()),
        permit = Arc::clone(&inner.item_slots).acquire_owned() => {
            permit.map_err(|_| OrchestratorError::SemaphoreClosed)?
        }
    };

    let Some(item) = inner.store.snapshot(id) else {
        debug!(id, "Item removed before it started");
        return Ok(());
    };
    if !item.state.is_runnable() {
        debug!(id, state = %item.state, "Item not runnable");
        return Ok(());
    }

    let Some(manifest) = load_manifest(inner, &item, control).await? else {
        return Ok(());
    };
    let Some(plan) = prepare(inner, id, &manifest).await? else {
        return Ok(());
    };
    download(inner, id, manifest, plan, control).await
}

/// Returns the stored manifest or resolves it. `None` means the item was
/// settled (or halted) here.
async fn load_manifest(
    inner: &Inner,
    item: &QueueItem,
    control: &ItemControl,
) -> Result<Option<Arc<Manifest>>, OrchestratorError> {
    if let Some(manifest) = &item.manifest {
        return Ok(Some(Arc::new(manifest.clone())));
    }

    let id = item.id;
    inner.set_state(id, ItemState::ManifestLoading).await?;
    let resolved = tokio::select! {
        biased;
        () = control.halt.cancelled() => {
            inner.set_state(id, ItemState::Pending).await?;
            return Ok(None);
        }
        resolved = inner.resolver.resolve(&item.source.url) => resolved,
    };

    match resolved {
        Ok(manifest) => {
            let title = manifest.title().to_string();
            let stored = Manifest::clone(&manifest);
            inner
                .store
                .update_with_manifest(id, |item| {
                    item.title = Some(title);
                    item.manifest = Some(stored);
                    item.state = ItemState::Ready;
                    item.status_message = None;
                    item.last_error = None;
                })
                .await?;
            inner.emit(QueueEvent::StateChanged {
                id,
                state: ItemState::Ready,
            });
            info!(id, pages = manifest.len(), "Manifest resolved");
            Ok(Some(manifest))
        }
        Err(error) => {
            warn!(id, error = %error, "Manifest resolution failed");
            inner.settle(id, ItemState::Failed, Some(error.to_string())).await?;
            Ok(None)
        }
    }
}

/// Reconciles progress with the selection and what is still staged, then
/// moves the item to `Downloading`.
async fn prepare(
    inner: &Inner,
    id: i64,
    manifest: &Manifest,
) -> Result<Option<Plan>, OrchestratorError> {
    let total = u32::try_from(manifest.len()).unwrap_or(u32::MAX);
    let Some(item) = inner.store.snapshot(id) else {
        return Ok(None);
    };
    let Some((first, last)) = item.options.selection(total) else {
        let range = item
            .options
            .page_range
            .map(|range| range.to_string())
            .unwrap_or_default();
        let error = OrchestratorError::invalid_options(format!(
            "page range {range} selects none of the {total} pages"
        ));
        inner.settle(id, ItemState::Failed, Some(error.to_string())).await?;
        return Ok(None);
    };

    let selected = last - first + 1;
    if item.progress.total_pages != selected {
        debug!(id, selected, "Starting a fresh selection");
        inner.staging.remove_item(id).await;
        inner
            .store
            .update(id, |item| {
                item.progress = ProgressState::for_selection(selected);
                item.parts.clear();
                item.file_stem = None;
            })
            .await?;
    }

    let Some(item) = inner.store.snapshot(id) else {
        return Ok(None);
    };
    let cursor = item.parts.last().map_or(first, |part| part.last_page + 1);
    let completed = item.progress.completed_pages;
    let missing: Vec<u32> = completed
        .keys()
        .copied()
        .filter(|&index| index >= cursor && inner.staging.find_page(id, index).is_none())
        .collect();
    if !missing.is_empty() {
        warn!(id, pages = missing.len(), "Staged pages missing; they will be fetched again");
    }

    let title = item
        .title
        .clone()
        .unwrap_or_else(|| manifest.title().to_string());
    let pages = item.options.page_range.map(|_| (first, last));
    let stem = inner
        .store
        .claim_file_stem(id, &file_stem(&title, pages))
        .await?;

    let adapter_cap = inner
        .resolver
        .registry()
        .by_id(&item.source.adapter_id)
        .and_then(|adapter| adapter.concurrency_cap());
    let concurrency = [Some(inner.concurrency), item.options.concurrency, adapter_cap]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(1)
        .max(1);

    let plan = inner
        .store
        .update(id, |item| {
            for &index in &missing {
                item.progress.forget(index);
            }
            item.state = ItemState::Downloading;
            item.status_message = None;
            Plan {
                first,
                last,
                cursor,
                concurrency,
                title,
                stem,
                options: item.options.clone(),
                progress: item.progress.clone(),
                next_part: u32::try_from(item.parts.len())
                    .unwrap_or(u32::MAX)
                    .saturating_add(1),
                write_failed: item.parts.iter().any(|part| part.artifact.is_none()),
            }
        })
        .await?;
    inner.emit(QueueEvent::StateChanged {
        id,
        state: ItemState::Downloading,
    });
    Ok(Some(plan))
}

async fn download(
    inner: &Arc<Inner>,
    id: i64,
    manifest: Arc<Manifest>,
    plan: Plan,
    control: &ItemControl,
) -> Result<(), OrchestratorError> {
    let mut slots = PageSlots::new(plan.first, plan.last);
    slots.skip_to(plan.cursor);

    let mut pending = Vec::new();
    for index in plan.cursor..=plan.last {
        if let Some(&bytes) = plan.progress.completed_pages.get(&index)
            && let Some(path) = inner.staging.find_page(id, index)
        {
            slots.fill(index, PageOutcome::Staged { path, bytes });
        } else if plan.progress.failed_pages.binary_search(&index).is_ok() {
            slots.fill(
                index,
                PageOutcome::Failed {
                    reason: EARLIER_FAILURE.to_string(),
                },
            );
        } else {
            pending.push(index);
        }
    }
    info!(
        id,
        pending = pending.len(),
        concurrency = plan.concurrency,
        "Dispatching pages"
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(dispatch(
        Arc::clone(inner),
        id,
        Arc::clone(&manifest),
        pending,
        plan.concurrency,
        control.clone(),
        tx,
    ));

    let threshold = plan
        .options
        .split_enabled
        .then_some(plan.options.split_threshold_bytes);
    let mut sink = PartSink {
        inner: inner.as_ref(),
        id,
        manifest: &manifest,
        title: plan.title,
        stem: plan.stem,
        last: plan.last,
        planner: PartPlanner::new(threshold, plan.next_part),
        buffered: BTreeMap::new(),
        write_failed: plan.write_failed,
    };

    sink.accept(slots.drain_ready()).await?;
    while let Some((index, outcome)) = rx.recv().await {
        slots.fill(index, outcome);
        sink.accept(slots.drain_ready()).await?;
    }
    if let Err(error) = dispatcher.await {
        warn!(id, error = %error, "Page dispatcher panicked");
    }

    if slots.is_complete() {
        sink.finish().await?;
        let write_failed = sink.write_failed;
        let (state, message) = if write_failed {
            let last_error = inner.store.snapshot(id).and_then(|item| item.last_error);
            (ItemState::Failed, last_error)
        } else {
            let progress = inner.store.snapshot(id).map(|item| item.progress);
            let (failed, total) = progress.map_or((0, 0), |p| (p.failed, p.total_pages));
            (
                ItemState::Completed,
                summary_message(failed as usize, total as usize),
            )
        };
        inner.settle(id, state, message).await?;
        if state == ItemState::Completed {
            inner.staging.remove_item(id).await;
        }
        info!(id, state = %state, "Item finished");
    } else if control.cancel.is_cancelled() {
        inner.settle(id, ItemState::Stopped, None).await?;
        info!(id, "Item stopped");
    } else {
        inner.settle(id, ItemState::Paused, None).await?;
        info!(id, "Item paused");
    }
    Ok(())
}

/// Spawns page tasks in manifest order until the list is exhausted or the
/// item is halted. Outcomes arrive on `tx`; the channel closes once this
/// returns and every spawned task has finished.
async fn dispatch(
    inner: Arc<Inner>,
    id: i64,
    manifest: Arc<Manifest>,
    pending: Vec<u32>,
    concurrency: usize,
    control: ItemControl,
    tx: mpsc::UnboundedSender<(u32, PageOutcome)>,
) {
    let pool = Arc::new(Semaphore::new(concurrency));
    for index in pending {
        let Some(page) = manifest.page(index).cloned() else {
            warn!(id, page = index, "Page missing from manifest");
            continue;
        };

        let item_permit = tokio::select! {
            biased;
            () = control.halt.cancelled() => break,
            permit = Arc::clone(&pool).acquire_owned() => permit,
        };
        let page_permit = tokio::select! {
            biased;
            () = control.halt.cancelled() => break,
            permit = Arc::clone(&inner.pages).acquire_owned() => permit,
        };
        let (Ok(item_permit), Ok(page_permit)) = (item_permit, page_permit) else {
            warn!(id, "Page semaphore closed");
            break;
        };

        let inner = Arc::clone(&inner);
        let cancel = control.cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permits = (item_permit, page_permit);
            if let Some(outcome) = fetch_page(&inner, id, &page, &cancel).await {
                // Only fails if the driver already gave up on this run.
                let _ = tx.send((page.index, outcome));
            }
        });
    }
}

/// Fetches, stages and records one page. `None` when cancelled.
async fn fetch_page(
    inner: &Inner,
    id: i64,
    page: &Page,
    cancel: &CancellationToken,
) -> Option<PageOutcome> {
    let index = page.index;
    let outcome = match inner.worker.fetch(page, cancel).await {
        Ok(fetched) => match inner
            .staging
            .write_page(id, index, fetched.extension, &fetched.bytes)
            .await
        {
            Ok(path) => PageOutcome::Staged {
                path,
                bytes: fetched.bytes.len() as u64,
            },
            Err(error) => PageOutcome::Failed {
                reason: format!("could not stage page: {error}"),
            },
        },
        Err(PageError::Cancelled) => {
            debug!(id, page = index, "Page cancelled");
            return None;
        }
        Err(PageError::Failed(reason)) => PageOutcome::Failed { reason },
    };

    let recorded = match &outcome {
        PageOutcome::Staged { bytes, .. } => {
            let bytes = *bytes;
            debug!(id, page = index, bytes, "Page staged");
            inner
                .store
                .update(id, |item| item.progress.record_success(index, bytes))
                .await
        }
        PageOutcome::Failed { reason } => {
            warn!(id, page = index, reason = %reason, "Page failed; a placeholder will be used");
            inner
                .store
                .update(id, |item| item.progress.record_failure(index))
                .await
        }
    };
    if let Err(error) = recorded {
        warn!(id, page = index, error = %error, "Could not record page outcome");
    }

    inner.emit(QueueEvent::PageFinished {
        id,
        page: index,
        ok: matches!(outcome, PageOutcome::Staged { .. }),
        bytes: outcome.bytes(),
    });
    Some(outcome)
}

/// Feeds ordered page outcomes to the planner and writes every sealed part.
struct PartSink<'a> {
    inner: &'a Inner,
    id: i64,
    manifest: &'a Manifest,
    title: String,
    stem: String,
    last: u32,
    planner: PartPlanner,
    buffered: BTreeMap<u32, PageOutcome>,
    write_failed: bool,
}

impl PartSink<'_> {
    async fn accept(&mut self, ready: Vec<(u32, PageOutcome)>) -> Result<(), OrchestratorError> {
        for (index, outcome) in ready {
            let bytes = outcome.bytes();
            self.buffered.insert(index, outcome);
            for sealed in self.planner.push(index, bytes) {
                self.write(sealed).await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), OrchestratorError> {
        if let Some(sealed) = self.planner.finish() {
            self.write(sealed).await?;
        }
        Ok(())
    }

    async fn write(&mut self, sealed: SealedPart) -> Result<(), OrchestratorError> {
        let id = self.id;
        let sole = sealed.number == 1 && sealed.last_page == self.last;
        let destination = artifact_path(&self.inner.output_dir, &self.stem, sealed.number, sole);

        let mut pages = Vec::new();
        let mut staged: Vec<PathBuf> = Vec::new();
        for index in sealed.first_page..=sealed.last_page {
            let label = self
                .manifest
                .page(index)
                .map_or_else(|| format!("Page {index}"), |page| page.label.clone());
            let content = match self.buffered.remove(&index) {
                Some(PageOutcome::Staged { path, .. }) => {
                    staged.push(path.clone());
                    PageContent::Staged(path)
                }
                Some(PageOutcome::Failed { reason }) => PageContent::Failed { reason },
                None => PageContent::Failed {
                    reason: "page result missing".to_string(),
                },
            };
            pages.push(PartPage {
                index,
                label,
                content,
            });
        }

        let job = PartJob {
            title: self.title.clone(),
            destination,
            pages,
        };
        let mut record = PartRecord {
            number: sealed.number,
            first_page: sealed.first_page,
            last_page: sealed.last_page,
            bytes: sealed.bytes,
            artifact: None,
        };

        match self.inner.output.write_part(&job).await {
            Ok(path) => {
                info!(id, part = sealed.number, path = %path.display(), "Part written");
                record.artifact = Some(path);
                let stored = record.clone();
                self.inner.store.update(id, |item| item.parts.push(stored)).await?;
                // Later parts keep their pages staged so a retry can rewrite them.
                if !self.write_failed {
                    self.inner.staging.remove_pages(staged).await;
                }
            }
            Err(write_error) => {
                error!(id, part = sealed.number, error = %write_error, "Part write failed");
                self.write_failed = true;
                let message = write_error.to_string();
                let stored = record.clone();
                self.inner
                    .store
                    .update(id, |item| {
                        item.parts.push(stored);
                        item.last_error = Some(message);
                    })
                    .await?;
            }
        }
        self.inner.emit(QueueEvent::PartWritten { id, part: record });
        Ok(())
    }
}
