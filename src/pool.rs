//! Bounded-concurrency fan-out with cooperative cancellation.
use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
pub enum ItemOutcome<R> {
    Completed(Result<R>),
    /// Never dispatched because the run was cancelled first.
    Cancelled,
}

impl<R> ItemOutcome<R> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ItemOutcome::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Runs `f` over every item with at most `concurrency` in flight and
    /// returns one outcome per item, in input order.
    ///
    /// A failing or panicking item only affects its own outcome. Once the
    /// token is cancelled no further items are started; those already running
    /// are awaited.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Vec<ItemOutcome<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let total = items.len();
        let mut slots: Vec<Option<ItemOutcome<R>>> = (0..total).map(|_| None).collect();
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let f = Arc::new(f);
        let mut joinset = JoinSet::new();

        for (idx, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = sem.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!("Dispatch stopped after {} of {} items", idx, total);
                break;
            };
            let f = f.clone();
            joinset.spawn(async move {
                let _permit = permit;
                // Inner task so a panic surfaces as this item's error.
                let res = match tokio::spawn(f(item)).await {
                    Ok(res) => res,
                    Err(e) => Err(anyhow!("worker panicked: {}", e)),
                };
                (idx, res)
            });
        }

        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok((idx, res)) => slots[idx] = Some(ItemOutcome::Completed(res)),
                Err(e) => error!("Worker task failed to join: {}", e),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(ItemOutcome::Cancelled))
            .collect()
    }
}
