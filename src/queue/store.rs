//! In-memory queue with write-through SQLite persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sqlx::FromRow;
use tracing::{debug, info, instrument, warn};

use crate::db::Database;
use crate::manifest::{Manifest, Source};

use super::{ItemOptions, ItemState, ProgressState, QueueError, QueueItem, QueueItemView, Result};

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, FromRow)]
struct QueueRow {
    id: i64,
    source_url: String,
    adapter_id: String,
    title: Option<String>,
    state: String,
    options_json: String,
    progress_json: String,
    manifest_json: Option<String>,
    parts_json: String,
    status_message: Option<String>,
    last_error: Option<String>,
    revision: i64,
    created_at: String,
    file_stem: Option<String>,
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    /// Serialized manifest, refreshed only when the manifest changes.
    manifest_json: Option<Arc<str>>,
}

/// Column values of one write, captured under the lock.
#[derive(Debug)]
struct RowWrite {
    id: i64,
    revision: i64,
    title: Option<String>,
    state: &'static str,
    options_json: String,
    progress_json: String,
    manifest_json: Option<Arc<str>>,
    parts_json: String,
    file_stem: Option<String>,
    status_message: Option<String>,
    last_error: Option<String>,
}

/// Authoritative queue state.
///
/// Reads are served from memory. Every mutation bumps the item's revision
/// and is written through to `queue_items`; a write carrying an older
/// revision than the stored row is discarded, so concurrent writers can
/// finish in any order.
#[derive(Debug)]
pub struct QueueStore {
    db: Database,
    items: Mutex<BTreeMap<i64, Entry>>,
}

impl QueueStore {
    /// Loads every persisted item, moving interrupted ones to a resumable state.
    ///
    /// # Errors
    ///
    /// [`QueueError::Database`] if reading or normalizing rows fails.
    #[instrument(skip(db))]
    pub async fn open(db: Database) -> Result<Self> {
        let rows = sqlx::query_as::<_, QueueRow>(r"SELECT * FROM queue_items ORDER BY id ASC")
            .fetch_all(db.pool())
            .await?;

        let store = Self {
            db,
            items: Mutex::new(BTreeMap::new()),
        };

        let mut normalized = Vec::new();
        {
            let mut items = store.lock();
            for row in rows {
                let manifest_json = row.manifest_json.as_deref().map(Arc::<str>::from);
                let mut item = item_from_row(row);
                let restored = item.state.after_restart();
                if restored != item.state {
                    info!(id = item.id, from = %item.state, to = %restored, "Restoring interrupted item");
                    item.state = restored;
                    item.revision += 1;
                    normalized.push(item.id);
                }
                items.insert(
                    item.id,
                    Entry {
                        item,
                        manifest_json,
                    },
                );
            }
        }

        for id in normalized {
            if let Some(write) = store.capture(id) {
                store.persist(write).await?;
            }
        }
        debug!(items = store.lock().len(), "Queue loaded");
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Entry>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a new `Pending` item.
    ///
    /// # Errors
    ///
    /// [`QueueError::Database`] or [`QueueError::Serialization`].
    #[instrument(skip(self, options), fields(url = %source.url, adapter = %source.adapter_id))]
    pub async fn insert(&self, source: Source, options: ItemOptions) -> Result<QueueItemView> {
        let options_json = to_json(0, "options", &options)?;
        let progress_json = to_json(0, "progress", &ProgressState::default())?;
        let (id, created_at): (i64, String) = sqlx::query_as(
            r"INSERT INTO queue_items (source_url, adapter_id, state, options_json, progress_json)
              VALUES (?, ?, ?, ?, ?)
              RETURNING id, created_at",
        )
        .bind(&source.url)
        .bind(&source.adapter_id)
        .bind(ItemState::Pending.as_str())
        .bind(options_json)
        .bind(progress_json)
        .fetch_one(self.db.pool())
        .await?;

        let item = QueueItem {
            id,
            source,
            title: None,
            state: ItemState::Pending,
            options,
            progress: ProgressState::default(),
            manifest: None,
            parts: Vec::new(),
            file_stem: None,
            status_message: None,
            last_error: None,
            revision: 0,
            created_at,
        };
        let view = QueueItemView::from(&item);
        self.lock().insert(
            id,
            Entry {
                item,
                manifest_json: None,
            },
        );
        Ok(view)
    }

    /// Read-only view of one item.
    #[must_use]
    pub fn view(&self, id: i64) -> Option<QueueItemView> {
        self.lock().get(&id).map(|entry| QueueItemView::from(&entry.item))
    }

    /// Views of every item, oldest first.
    #[must_use]
    pub fn views(&self) -> Vec<QueueItemView> {
        self.lock()
            .values()
            .map(|entry| QueueItemView::from(&entry.item))
            .collect()
    }

    /// Full copy of one item, manifest included.
    #[must_use]
    pub fn snapshot(&self, id: i64) -> Option<QueueItem> {
        self.lock().get(&id).map(|entry| entry.item.clone())
    }

    /// Mutates one item and writes it through. The manifest must not be changed here.
    ///
    /// # Errors
    ///
    /// [`QueueError::ItemNotFound`], [`QueueError::Database`] or [`QueueError::Serialization`].
    pub async fn update<T>(&self, id: i64, mutate: impl FnOnce(&mut QueueItem) -> T) -> Result<T> {
        self.apply(id, false, mutate).await
    }

    /// Like [`Self::update`], but `mutate` may refuse the change. On `Err`
    /// the item is left as it was and nothing is written.
    ///
    /// `mutate` runs under the store lock, so checks it makes on the item
    /// cannot be invalidated before the change lands.
    ///
    /// # Errors
    ///
    /// The error returned by `mutate`, or a queue error converted into `E`.
    pub async fn try_update<T, E>(
        &self,
        id: i64,
        mutate: impl FnOnce(&mut QueueItem) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<QueueError>,
    {
        let (out, write) = {
            let mut items = self.lock();
            let entry = items.get_mut(&id).ok_or(QueueError::ItemNotFound(id))?;
            let mut draft = entry.item.clone();
            let out = mutate(&mut draft)?;
            draft.revision += 1;
            entry.item = draft;
            (out, capture_entry(entry)?)
        };
        self.persist(write).await?;
        Ok(out)
    }

    /// Like [`Self::update`], re-serializing the manifest afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`].
    pub async fn update_with_manifest<T>(
        &self,
        id: i64,
        mutate: impl FnOnce(&mut QueueItem) -> T,
    ) -> Result<T> {
        self.apply(id, true, mutate).await
    }

    async fn apply<T>(
        &self,
        id: i64,
        manifest_changed: bool,
        mutate: impl FnOnce(&mut QueueItem) -> T,
    ) -> Result<T> {
        let (out, write) = {
            let mut items = self.lock();
            let entry = items.get_mut(&id).ok_or(QueueError::ItemNotFound(id))?;
            let out = mutate(&mut entry.item);
            entry.item.revision += 1;
            if manifest_changed {
                entry.manifest_json = match &entry.item.manifest {
                    Some(manifest) => Some(Arc::from(to_json(id, "manifest", manifest)?)),
                    None => None,
                };
            }
            (out, capture_entry(entry)?)
        };
        self.persist(write).await?;
        Ok(out)
    }

    /// Returns the item's artifact stem, claiming one derived from `base` on
    /// first use.
    ///
    /// The claim is checked against every other item under one lock, so two
    /// items never share a stem: a taken `base` becomes `base_2`, `base_3`
    /// and so on. Comparison ignores ASCII case.
    ///
    /// # Errors
    ///
    /// [`QueueError::ItemNotFound`], [`QueueError::Database`] or [`QueueError::Serialization`].
    pub async fn claim_file_stem(&self, id: i64, base: &str) -> Result<String> {
        let (stem, write) = {
            let mut items = self.lock();
            let entry = items.get(&id).ok_or(QueueError::ItemNotFound(id))?;
            if let Some(stem) = &entry.item.file_stem {
                return Ok(stem.clone());
            }
            let taken = |candidate: &str| {
                items.values().any(|other| {
                    other.item.id != id
                        && other
                            .item
                            .file_stem
                            .as_deref()
                            .is_some_and(|stem| stem.eq_ignore_ascii_case(candidate))
                })
            };
            let mut stem = base.to_string();
            let mut suffix = 2u32;
            while taken(&stem) {
                stem = format!("{base}_{suffix}");
                suffix += 1;
            }
            let entry = items.get_mut(&id).ok_or(QueueError::ItemNotFound(id))?;
            entry.item.file_stem = Some(stem.clone());
            entry.item.revision += 1;
            (stem, capture_entry(entry)?)
        };
        if stem != base {
            debug!(id, base, stem = %stem, "Artifact name taken; using a suffix");
        }
        self.persist(write).await?;
        Ok(stem)
    }

    /// Deletes an item and returns its last state.
    ///
    /// # Errors
    ///
    /// [`QueueError::ItemNotFound`] or [`QueueError::Database`].
    #[instrument(skip(self))]
    pub async fn remove(&self, id: i64) -> Result<QueueItem> {
        let removed = self
            .lock()
            .remove(&id)
            .map(|entry| entry.item)
            .ok_or(QueueError::ItemNotFound(id))?;
        sqlx::query(r"DELETE FROM queue_items WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(removed)
    }

    fn capture(&self, id: i64) -> Option<RowWrite> {
        let items = self.lock();
        let entry = items.get(&id)?;
        match capture_entry(entry) {
            Ok(write) => Some(write),
            Err(error) => {
                warn!(id, error = %error, "Skipping unserializable item");
                None
            }
        }
    }

    async fn persist(&self, write: RowWrite) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.persist_once(&write).await {
                Ok(0) => {
                    debug!(id = write.id, revision = write.revision, "Discarded stale queue write");
                    return Ok(());
                }
                Ok(_) => return Ok(()),
                Err(error) if error.is_busy_or_locked() && attempt < BUSY_RETRIES => {
                    warn!(id = write.id, attempt, "Queue database busy; retrying write");
                    tokio::time::sleep(BUSY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn persist_once(&self, write: &RowWrite) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE queue_items
              SET title = ?, state = ?, options_json = ?, progress_json = ?,
                  manifest_json = ?, parts_json = ?, file_stem = ?, status_message = ?,
                  last_error = ?,
                  revision = ?, updated_at = datetime('now')
              WHERE id = ? AND revision < ?",
        )
        .bind(write.title.as_deref())
        .bind(write.state)
        .bind(&write.options_json)
        .bind(&write.progress_json)
        .bind(write.manifest_json.as_deref())
        .bind(&write.parts_json)
        .bind(write.file_stem.as_deref())
        .bind(write.status_message.as_deref())
        .bind(write.last_error.as_deref())
        .bind(write.revision)
        .bind(write.id)
        .bind(write.revision)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

fn capture_entry(entry: &Entry) -> Result<RowWrite> {
    let item = &entry.item;
    Ok(RowWrite {
        id: item.id,
        revision: item.revision,
        title: item.title.clone(),
        state: item.state.as_str(),
        options_json: to_json(item.id, "options", &item.options)?,
        progress_json: to_json(item.id, "progress", &item.progress)?,
        manifest_json: entry.manifest_json.clone(),
        parts_json: to_json(item.id, "parts", &item.parts)?,
        file_stem: item.file_stem.clone(),
        status_message: item.status_message.clone(),
        last_error: item.last_error.clone(),
    })
}

fn to_json<T: serde::Serialize>(id: i64, field: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|error| QueueError::Serialization {
        id,
        field,
        message: error.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned + Default>(id: i64, field: &str, raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|error| {
        warn!(id, field, error = %error, "Unreadable column; using default");
        T::default()
    })
}

fn item_from_row(row: QueueRow) -> QueueItem {
    let id = row.id;
    let state = row.state.parse().unwrap_or_else(|error: String| {
        warn!(id, error = %error, "Unknown state; treating as pending");
        ItemState::Pending
    });
    let manifest = row.manifest_json.as_deref().and_then(|raw| {
        serde_json::from_str::<Manifest>(raw)
            .map_err(|error| warn!(id, error = %error, "Unreadable manifest; will re-resolve"))
            .ok()
    });
    QueueItem {
        id,
        source: Source::new(row.source_url, row.adapter_id),
        title: row.title,
        state,
        options: from_json::<ItemOptions>(id, "options", &row.options_json),
        progress: from_json::<ProgressState>(id, "progress", &row.progress_json),
        manifest,
        parts: from_json(id, "parts", &row.parts_json),
        file_stem: row.file_stem,
        status_message: row.status_message,
        last_error: row.last_error,
        revision: row.revision,
        created_at: row.created_at,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::ImageLocator;

    async fn store() -> QueueStore {
        QueueStore::open(Database::new_in_memory().await.unwrap())
            .await
            .unwrap()
    }

    fn source() -> Source {
        Source::new("https://example.org/iiif/book/manifest.json", "iiif")
    }

    async fn stored_row(store: &QueueStore, id: i64) -> QueueRow {
        sqlx::query_as::<_, QueueRow>("SELECT * FROM queue_items WHERE id = ?")
            .bind(id)
            .fetch_one(store.db.pool())
            .await
            .unwrap()
    }

    // ==================== Insert / Read Tests ====================

    #[tokio::test]
    async fn test_insert_creates_pending_item() {
        let store = store().await;
        let view = store.insert(source(), ItemOptions::default()).await.unwrap();
        assert_eq!(view.state, ItemState::Pending);
        assert_eq!(view.adapter_id, "iiif");
        assert_eq!(store.views().len(), 1);
        assert_eq!(stored_row(&store, view.id).await.state, "pending");
    }

    // ==================== Update Tests ====================

    #[tokio::test]
    async fn test_update_writes_through_and_bumps_revision() {
        let store = store().await;
        let id = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        store
            .update(id, |item| {
                item.state = ItemState::Downloading;
                item.progress.record_success(1, 42);
            })
            .await
            .unwrap();

        let row = stored_row(&store, id).await;
        assert_eq!(row.state, "downloading");
        assert_eq!(row.revision, 1);
        let progress: ProgressState = serde_json::from_str(&row.progress_json).unwrap();
        assert_eq!(progress.completed_pages.get(&1), Some(&42));
    }

    #[tokio::test]
    async fn test_stale_write_is_discarded() {
        let store = store().await;
        let id = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        store.update(id, |item| item.state = ItemState::Ready).await.unwrap();
        let stale = store.capture(id).unwrap();
        store.update(id, |item| item.state = ItemState::Completed).await.unwrap();

        store.persist(stale).await.unwrap();
        assert_eq!(stored_row(&store, id).await.state, "completed");
    }

    #[tokio::test]
    async fn test_manifest_persists_only_through_manifest_update() {
        let store = store().await;
        let id = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        let manifest = Manifest::from_ordered(
            "Book",
            source(),
            vec![("1r".to_string(), ImageLocator::Direct { url: "https://img/1".to_string() })],
        )
        .unwrap();
        store
            .update_with_manifest(id, |item| {
                item.title = Some(manifest.title().to_string());
                item.manifest = Some(manifest.clone());
            })
            .await
            .unwrap();
        store.update(id, |item| item.state = ItemState::Ready).await.unwrap();

        let row = stored_row(&store, id).await;
        let restored: Manifest = serde_json::from_str(row.manifest_json.as_deref().unwrap()).unwrap();
        assert_eq!(restored, manifest);
    }

    #[tokio::test]
    async fn test_missing_item_is_not_found() {
        let store = store().await;
        let error = store.update(99, |_| ()).await.unwrap_err();
        assert!(matches!(error, QueueError::ItemNotFound(99)));
        assert!(matches!(store.remove(99).await, Err(QueueError::ItemNotFound(99))));
    }

    #[tokio::test]
    async fn test_try_update_refusal_leaves_item_untouched() {
        let store = store().await;
        let id = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        store.update(id, |i| i.state = ItemState::Downloading).await.unwrap();
        let before = store.snapshot(id).unwrap();

        let refused: std::result::Result<(), QueueError> = store
            .try_update(id, |item| {
                item.state = ItemState::Ready;
                Err(QueueError::ItemNotFound(item.id))
            })
            .await;
        assert!(refused.is_err());
        assert_eq!(store.snapshot(id).unwrap(), before);
        assert_eq!(stored_row(&store, id).await.revision, before.revision);

        let revision = store
            .try_update(id, |item| {
                item.state = ItemState::Paused;
                Ok::<_, QueueError>(item.revision)
            })
            .await
            .unwrap();
        assert_eq!(revision, before.revision);
        assert_eq!(stored_row(&store, id).await.state, "paused");
    }

    // ==================== File Stem Tests ====================

    #[tokio::test]
    async fn test_claim_file_stem_is_unique_and_sticky() {
        let store = store().await;
        let a = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        let b = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        let c = store.insert(source(), ItemOptions::default()).await.unwrap().id;

        assert_eq!(store.claim_file_stem(a, "Codex").await.unwrap(), "Codex");
        assert_eq!(store.claim_file_stem(b, "codex").await.unwrap(), "codex_2");
        assert_eq!(store.claim_file_stem(c, "Codex").await.unwrap(), "Codex_3");
        // A claimed stem is kept even if the base changes.
        assert_eq!(store.claim_file_stem(a, "Other").await.unwrap(), "Codex");
        assert_eq!(stored_row(&store, b).await.file_stem.as_deref(), Some("codex_2"));
    }

    #[tokio::test]
    async fn test_file_stem_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.db");
        let id = {
            let store = QueueStore::open(Database::new(&path).await.unwrap()).await.unwrap();
            let id = store.insert(source(), ItemOptions::default()).await.unwrap().id;
            store.claim_file_stem(id, "Codex").await.unwrap();
            id
        };

        let store = QueueStore::open(Database::new(&path).await.unwrap()).await.unwrap();
        assert_eq!(store.snapshot(id).unwrap().file_stem.as_deref(), Some("Codex"));
        let other = store.insert(source(), ItemOptions::default()).await.unwrap().id;
        assert_eq!(store.claim_file_stem(other, "Codex").await.unwrap(), "Codex_2");
    }

    // ==================== Restart Tests ====================

    #[tokio::test]
    async fn test_reopen_restores_interrupted_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.db");
        let (downloading, loading, done) = {
            let store = QueueStore::open(Database::new(&path).await.unwrap()).await.unwrap();
            let a = store.insert(source(), ItemOptions::default()).await.unwrap().id;
            let b = store.insert(source(), ItemOptions::default()).await.unwrap().id;
            let c = store.insert(source(), ItemOptions::default()).await.unwrap().id;
            store.update(a, |i| i.state = ItemState::Downloading).await.unwrap();
            store.update(b, |i| i.state = ItemState::ManifestLoading).await.unwrap();
            store.update(c, |i| i.state = ItemState::Completed).await.unwrap();
            (a, b, c)
        };

        let store = QueueStore::open(Database::new(&path).await.unwrap()).await.unwrap();
        assert_eq!(store.view(downloading).unwrap().state, ItemState::Paused);
        assert_eq!(store.view(loading).unwrap().state, ItemState::Pending);
        assert_eq!(store.view(done).unwrap().state, ItemState::Completed);
        assert_eq!(stored_row(&store, downloading).await.state, "paused");
    }
}
