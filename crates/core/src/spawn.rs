use std::future::Future;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument, Span};

#[derive(Debug, Error)]
#[error("task cancelled")]
pub struct Cancelled;

/// Spawns a future under the given span, logging completion, error, or
/// cancellation. Every long-running worker in this crawler goes through
/// this so their lifecycle shows up uniformly in traces.
pub fn spawn<F>(span: Span, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(
        async move {
            debug!("starting");
            let res = fut.await;
            debug!("finished");
            res
        }
        .instrument(span),
    )
}

/// Like `spawn`, but bails out early with `Cancelled` if the token fires
/// before the future completes.
pub fn spawn_with_cancel<F>(
    span: Span,
    token: CancellationToken,
    fut: F,
) -> JoinHandle<Result<F::Output, Cancelled>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(
        async move {
            tokio::select! {
                res = fut => Ok(res),
                _ = token.cancelled() => {
                    debug!("cancelled");
                    Err(Cancelled)
                }
            }
        }
        .instrument(span),
    )
}

/// Runs `fut` to completion, logging any error it returns at `error` level
/// without propagating it — used for fire-and-forget background loops
/// whose failure shouldn't bring down the process.
pub async fn run_and_log_errors<F, E>(span: Span, fut: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async move {
        if let Err(e) = fut.await {
            error!("task failed: {e:#}");
        }
    }
    .instrument(span)
    .await
}
