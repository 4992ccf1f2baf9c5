//! Generic rate-limited worker loop.
//!
//! Every controller drains its own `WorkQueue` of comparable events: items
//! are de-duplicated while queued, failed syncs are re-added with a
//! per-event Fibonacci backoff, and successes forget the failure count.
//! The worker recovers reconcile panics so one poisoned object cannot take
//! down the loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;

const BACKOFF_MIN_SECONDS: u64 = 1;
const BACKOFF_MAX_SECONDS: u64 = 60;

/// A queueable event with a stable string key for logging.
pub trait EventKey: Clone + Eq + Hash + Send + Sync + 'static {
    fn key_string(&self) -> String;
}

struct QueueState<E> {
    queue: VecDeque<E>,
    queued: HashSet<E>,
    failures: HashMap<E, u32>,
    shut_down: bool,
}

struct QueueInner<E> {
    state: Mutex<QueueState<E>>,
    notify: Notify,
}

/// Rate-limited work queue with in-queue de-duplication by event equality.
pub struct WorkQueue<E> {
    inner: Arc<QueueInner<E>>,
}

impl<E> Clone for WorkQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for WorkQueue<E>
where
    E: EventKey,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> WorkQueue<E>
where
    E: EventKey,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    queued: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an event. Identical events already waiting are dropped.
    pub fn add(&self, event: E) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            return;
        }
        if state.queued.insert(event.clone()) {
            state.queue.push_back(event);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-enqueue a failed event after its per-event backoff delay.
    pub fn add_rate_limited(&self, event: E) {
        let delay = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(event.clone()).or_insert(0);
            *failures += 1;
            FibonacciBackoff::calculate_for_failure_count(
                *failures,
                BACKOFF_MIN_SECONDS,
                BACKOFF_MAX_SECONDS,
            )
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(event);
        });
    }

    /// Clear the failure count after a successful sync.
    pub fn forget(&self, event: &E) {
        self.inner.state.lock().unwrap().failures.remove(event);
    }

    /// Pop the next event, waiting if the queue is empty. Returns `None`
    /// once the queue has been shut down.
    pub async fn get(&self) -> Option<E> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(event) = state.queue.pop_front() {
                    state.queued.remove(&event);
                    return Some(event);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shut_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

/// Shared worker loop: pop, sync, retry-with-backoff on error.
pub struct Worker<E> {
    pub name: &'static str,
    pub queue: WorkQueue<E>,
}

impl<E> Worker<E>
where
    E: EventKey,
{
    /// Run `workers` concurrent consumers until the queue shuts down.
    ///
    /// With `recover_panic` a panicking sync is logged and the loop
    /// continues; without it the panic propagates.
    pub async fn run<F, Fut>(&self, workers: usize, recover_panic: bool, sync: F)
    where
        F: Fn(E) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        info!("({}.run) starting controller", self.name);

        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = self.queue.clone();
            let sync = sync.clone();
            let name = self.name;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = queue.get().await {
                    let result = AssertUnwindSafe(sync(event.clone())).catch_unwind().await;
                    match result {
                        Ok(Ok(())) => queue.forget(&event),
                        Ok(Err(e)) => {
                            error!("({}.handle_err) syncing <{}>: {}", name, event.key_string(), e);
                            queue.add_rate_limited(event);
                        }
                        Err(panic) => {
                            error!("({}.process_next_item) panic: {:?}", name, panic);
                            if !recover_panic {
                                std::panic::resume_unwind(panic);
                            }
                            info!("({}.process_next_item) panic recovered", name);
                        }
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        info!("({}.run) stopping controller", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct TestEvent(String);

    impl EventKey for TestEvent {
        fn key_string(&self) -> String {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_queue_dedup_while_queued() {
        let queue: WorkQueue<TestEvent> = WorkQueue::new();
        queue.add(TestEvent("a".into()));
        queue.add(TestEvent("a".into()));
        queue.add(TestEvent("b".into()));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.unwrap(), TestEvent("a".into()));
        // Popped events may be re-added
        queue.add(TestEvent("a".into()));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_shutdown_drains_none() {
        let queue: WorkQueue<TestEvent> = WorkQueue::new();
        queue.add(TestEvent("a".into()));
        queue.shut_down();
        // Remaining item is still handed out, then None
        assert!(queue.get().await.is_some());
        assert!(queue.get().await.is_none());
        // Adds after shutdown are dropped
        queue.add(TestEvent("b".into()));
        assert!(queue.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_until_success() {
        let queue: WorkQueue<TestEvent> = WorkQueue::new();
        let worker = Worker {
            name: "test",
            queue: queue.clone(),
        };
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.add(TestEvent("a".into()));
        let shutdown_queue = queue.clone();
        let counter = attempts.clone();
        let run = tokio::spawn(async move {
            worker
                .run(1, true, move |_event| {
                    let counter = counter.clone();
                    let shutdown_queue = shutdown_queue.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(ControllerError::Reconcile("transient".into()))
                        } else {
                            shutdown_queue.shut_down();
                            Ok(())
                        }
                    }
                })
                .await;
        });

        run.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_recovers_panic() {
        let queue: WorkQueue<TestEvent> = WorkQueue::new();
        let worker = Worker {
            name: "test",
            queue: queue.clone(),
        };
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.add(TestEvent("boom".into()));
        queue.add(TestEvent("ok".into()));
        let shutdown_queue = queue.clone();
        let counter = attempts.clone();
        worker
            .run(1, true, move |event| {
                let counter = counter.clone();
                let shutdown_queue = shutdown_queue.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if event.0 == "boom" {
                        panic!("poisoned object");
                    }
                    shutdown_queue.shut_down();
                    Ok(())
                }
            })
            .await;

        // The panic did not prevent the second event from being handled
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
