//! Persisted download queue.
//!
//! [`QueueStore`] owns every [`QueueItem`]: the orchestrator mutates items
//! through it, observers get [`QueueItemView`] copies, and each change is
//! written through to the `queue_items` table so a restart picks up where
//! the last run stopped.
//!
//! ```ignore
//! let store = QueueStore::open(Database::new(path).await?).await?;
//! let view = store.insert(Source::new(url, "iiif"), ItemOptions::default()).await?;
//! store.update(view.id, |item| item.state = ItemState::Ready).await?;
//! ```

mod error;
mod item;
mod store;

pub use error::{QueueDbErrorKind, QueueError};
pub use item::{
    DEFAULT_SPLIT_THRESHOLD_BYTES, ItemOptions, ItemState, PageRange, PartRecord, ProgressState,
    QueueItem, QueueItemView,
};
pub use store::QueueStore;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
