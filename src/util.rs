//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run blocking file or CPU work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Await `fut` for at most `deadline`. `None` waits indefinitely.
///
/// On expiry the error carries the deadline that was exceeded.
pub async fn with_deadline<F>(
    deadline: Option<Duration>,
    fut: F,
) -> std::result::Result<F::Output, Duration>
where
    F: Future,
{
    match deadline {
        Some(duration) => timeout(duration, fut).await.map_err(|_| duration),
        None => Ok(fut.await),
    }
}
