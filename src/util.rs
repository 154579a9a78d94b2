//! Bridges from the async pool to synchronous git and SQLite work.

use std::time::Duration;

use tokio::task::{spawn_blocking, JoinError};

use crate::{clog_warn, Error, Result};

fn join_failed(e: JoinError) -> Error {
    if e.is_cancelled() {
        Error::Cancelled
    } else {
        Error::TaskJoin(e.to_string())
    }
}

/// Run store or repository work on the blocking pool.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f).await.map_err(join_failed)?
}

/// Like [`blocking`], but gives up after `limit`. The closure keeps running
/// on its thread; only the caller stops waiting. `what` names the operation
/// in the log.
pub async fn blocking_with_timeout<F, T>(what: &str, limit: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let Ok(joined) = tokio::time::timeout(limit, spawn_blocking(f)).await else {
        clog_warn!("{} still running after {:?}", what, limit);
        return Err(Error::Timeout(limit));
    };
    joined.map_err(join_failed)?
}
