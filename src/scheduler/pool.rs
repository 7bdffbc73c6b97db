//! Fixed-size worker pool draining a closed job queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs `work` over every job with at most `workers` jobs in flight.
///
/// The first job error is kept and cancels `cancel`, so the remaining workers
/// stop taking jobs. Errors that follow it are dropped. After cancellation the
/// pool waits at most `grace` for busy workers before detaching them.
pub async fn run_pool<J, E, F, Fut>(
    jobs: Vec<J>,
    workers: usize,
    grace: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<(), E>
where
    J: Send + 'static,
    E: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    if jobs.is_empty() {
        return Ok(());
    }
    let workers = workers.clamp(1, jobs.len());

    let (tx, rx) = mpsc::unbounded_channel();
    for job in jobs {
        // the receiver is alive until the end of this function
        let _ = tx.send(job);
    }
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let work = Arc::new(work);
    let first_err: Arc<std::sync::Mutex<Option<E>>> = Arc::new(std::sync::Mutex::new(None));
    let mut set = JoinSet::new();
    for _ in 0..workers {
        let rx = rx.clone();
        let work = work.clone();
        let cancel = cancel.clone();
        let first_err = first_err.clone();
        set.spawn(async move {
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        job = rx.recv() => job,
                    }
                };
                let Some(job) = job else {
                    return;
                };
                if let Err(err) = work(job).await {
                    let mut slot = first_err.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    slot.get_or_insert(err);
                    drop(slot);
                    cancel.cancel();
                    return;
                }
            }
        });
    }

    let mut deadline: Option<Instant> = None;
    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, set.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(remaining = set.len(), "workers still busy after cancellation; detaching");
                    set.detach_all();
                    break;
                }
            },
            None => tokio::select! {
                next = set.join_next() => next,
                _ = cancel.cancelled() => {
                    deadline = Some(Instant::now() + grace);
                    continue;
                }
            },
        };
        match next {
            None => break,
            Some(Ok(())) => {}
            Some(Err(err)) => warn!(?err, "worker task aborted"),
        }
    }

    let first = first_err.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
