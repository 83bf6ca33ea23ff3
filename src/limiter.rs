//! Fixed-window rate limiting for async work.
//!
//! All scheduled tasks run on a single worker lane, so execution order is
//! exactly submission order and a long-running task delays everything behind
//! it. The window rolls over by elapsed time, not by capacity recovering
//! incrementally: a full burst at the end of one window followed by a full
//! burst at the start of the next is expected behavior.

use std::{future::Future, pin::Pin, time::Duration};

use snafu::ensure;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, Instant},
};
use tracing::debug;

use crate::{InvalidConfigSnafu, ShutdownSnafu};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Throttles async tasks to at most `requests` executions per `window`,
/// preserving strict submission order.
///
/// Cloning shares the lane: clones feed the same worker and draw from the
/// same window budget. Dropping every handle shuts the worker down; callers
/// still pending at that point observe [`Error::Shutdown`](crate::Error).
#[derive(Clone, Debug)]
pub struct RateLimiter {
    job_tx: mpsc::UnboundedSender<Job>,
}

impl RateLimiter {
    /// Fails fast on a zero `requests` or zero `window`; neither is ever
    /// silently clamped.
    ///
    /// Must be called within a tokio runtime: the worker lane is spawned here.
    pub fn new(requests: u32, window: Duration) -> Result<Self, crate::Error> {
        ensure!(
            requests > 0,
            InvalidConfigSnafu {
                message: "requests must be a positive integer"
            }
        );
        ensure!(
            !window.is_zero(),
            InvalidConfigSnafu {
                message: "window must be a positive duration"
            }
        );
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(
            FixedWindow {
                requests,
                window,
                started_at: None,
                executed: 0,
            },
            job_rx,
        ));
        Ok(Self { job_tx })
    }

    /// Queues `task` on the lane and resolves with the task's own output once
    /// it has run. The task's position in the lane is fixed at this call, not
    /// at first poll of the returned future.
    ///
    /// A task's failure is carried in its own output value and propagates only
    /// to its caller; the lane keeps running subsequent tasks in order.
    pub fn schedule<F>(&self, task: F) -> impl Future<Output = Result<F::Output, crate::Error>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (res_tx, res_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // The caller may have dropped its future; the lane moves on.
            res_tx.send(task.await).ok();
        });
        let queued = self.job_tx.send(job).is_ok();
        async move {
            if !queued {
                return ShutdownSnafu.fail();
            }
            res_rx.await.map_err(|_| ShutdownSnafu.build())
        }
    }
}

struct FixedWindow {
    requests: u32,
    window: Duration,
    started_at: Option<Instant>,
    executed: u32,
}

impl FixedWindow {
    /// Blocks until the current window has capacity, consuming one slot.
    async fn ensure_availability(&mut self) {
        loop {
            let now = Instant::now();
            match self.started_at.map(|started_at| now - started_at) {
                Some(elapsed) if elapsed < self.window => {
                    if self.executed < self.requests {
                        self.executed += 1;
                        return;
                    }
                    let remaining = self.window - elapsed;
                    debug!(?remaining, "window exhausted, waiting");
                    sleep(remaining).await;
                }
                // First use, or the window has elapsed: start a new one.
                _ => {
                    self.started_at = Some(now);
                    self.executed = 1;
                    return;
                }
            }
        }
    }
}

async fn worker_loop(mut window: FixedWindow, mut job_rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = job_rx.recv().await {
        window.ensure_availability().await;
        job.await;
    }
}
