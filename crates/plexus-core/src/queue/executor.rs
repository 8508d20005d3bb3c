//! Concurrency-limited task runner.
//!
//! Every concurrency class owns a lane: an unbounded FIFO of jobs and a
//! semaphore sized to the class limit. A single dispatcher task per lane
//! pulls jobs in submission order and acquires one permit per job before
//! spawning it, so a class never runs more than `limit` jobs at once and
//! jobs start in the order they were enqueued. A retrying job keeps its
//! permit for the whole retry cycle, including the delays.

use super::retry::{retry_fixed, RetryPolicy};
use crate::config::QueueConfig;
use crate::error::{PlexusError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Deferred result of an enqueued operation.
///
/// Resolves to the operation's value, to its last error when retries are
/// exhausted, or to an error if the queue was torn down before the job ran.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(PlexusError::Other("queue closed before task completed".into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded, per-class FIFO executor.
///
/// Cheap to clone; clones share lanes and limits.
#[derive(Clone, Default)]
pub struct BoundedQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    limits: HashMap<String, usize>,
}

impl BoundedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the concurrency limit of a class.
    ///
    /// Intended to be called before the class is first used. Raising the
    /// limit of a live class adds permits immediately; lowering it is
    /// rejected because running jobs cannot be preempted.
    pub fn set_limit(&self, class: &str, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(PlexusError::Validation {
                field: "limit".into(),
                message: format!("concurrency limit for class '{}' must be at least 1", class),
            });
        }

        let mut state = self.lock();
        if let Some(lane) = state.lanes.get_mut(class) {
            if limit < lane.limit {
                return Err(PlexusError::Config {
                    message: format!(
                        "cannot lower limit of live class '{}' from {} to {}",
                        class, lane.limit, limit
                    ),
                });
            }
            lane.semaphore.add_permits(limit - lane.limit);
            lane.limit = limit;
        }
        state.limits.insert(class.to_string(), limit);
        debug!("Queue class '{}' limit set to {}", class, limit);
        Ok(())
    }

    /// Configured limit for a class.
    pub fn limit(&self, class: &str) -> usize {
        self.lock()
            .limits
            .get(class)
            .copied()
            .unwrap_or(QueueConfig::DEFAULT_CLASS_LIMIT)
    }

    /// Number of jobs of `class` currently holding a slot.
    pub fn in_flight(&self, class: &str) -> usize {
        self.lock()
            .lanes
            .get(class)
            .map(|lane| lane.limit.saturating_sub(lane.semaphore.available_permits()))
            .unwrap_or(0)
    }

    /// Append an operation to the FIFO of `class`.
    ///
    /// `operation` is a factory: each attempt calls it again to produce a
    /// fresh future. Must be called from within a Tokio runtime.
    pub fn enqueue<T, F, Fut>(&self, class: &str, policy: RetryPolicy, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let class_name = class.to_string();

        let job: Job = Box::pin(async move {
            let (result, stats) = retry_fixed(&policy, operation).await;
            trace!(
                "Queue task in '{}' finished after {} attempt(s), success={}",
                class_name,
                stats.attempts,
                stats.success
            );
            // Receiver may have been dropped; the work still ran.
            let _ = tx.send(result);
        });

        let sender = self.lane_sender(class);
        if let Err(mpsc::error::SendError(job)) = sender.send(job) {
            // Dispatcher is gone (runtime shutting down). Run the job inline
            // so the handle still resolves.
            debug!("Queue lane '{}' closed; running task unbounded", class);
            tokio::spawn(job);
        }

        TaskHandle { rx }
    }

    fn lane_sender(&self, class: &str) -> mpsc::UnboundedSender<Job> {
        let mut state = self.lock();
        if let Some(lane) = state.lanes.get(class) {
            if !lane.tx.is_closed() {
                return lane.tx.clone();
            }
        }

        let limit = state
            .limits
            .get(class)
            .copied()
            .unwrap_or(QueueConfig::DEFAULT_CLASS_LIMIT);
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(limit));

        tokio::spawn(run_lane(class.to_string(), rx, semaphore.clone()));
        debug!("Started queue lane '{}' with limit {}", class, limit);

        state.lanes.insert(
            class.to_string(),
            Lane {
                tx: tx.clone(),
                semaphore,
                limit,
            },
        );
        tx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_lane(class: String, mut rx: mpsc::UnboundedReceiver<Job>, semaphore: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
    trace!("Queue lane '{}' stopped", class);
}
