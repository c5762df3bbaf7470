//! Crate-wide error type.
//!
//! Each module owns a focused error enum; [`ManuscriptError`] folds them
//! together for callers that drive several modules and only need to report.

use thiserror::Error;

use crate::db::DbError;
use crate::download::OrchestratorError;
use crate::fetch::FetchError;
use crate::output::OutputError;
use crate::queue::QueueError;
use crate::resolver::ResolveError;
use crate::tiles::TileError;

/// Any library error.
#[derive(Debug, Error)]
pub enum ManuscriptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Result alias over [`ManuscriptError`].
pub type Result<T, E = ManuscriptError> = std::result::Result<T, E>;
