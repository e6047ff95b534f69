//! Limiter implementation

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{Options, DEFAULT_PRIORITY, DEFAULT_WEIGHT};
use crate::error::ThrottleError;
use crate::store::{Admission, Datastore, Limits, LocalStore};

use super::queue::{Job, JobQueue, LimiterStats};

/// Dispatcher polling cadence
const DISPATCH_TICK: Duration = Duration::from_millis(10);

/// Limiter ID used when no shared datastore is configured
const LOCAL_ID: &str = "default";

/// State protected by the limiter mutex
///
/// Held only for heap operations and flag reads, never across awaits or
/// datastore calls.
struct Inner {
    queue: JobQueue,
    running: bool,
    stats: LimiterStats,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    id: String,
    limits: Limits,
    store: Arc<dyn Datastore>,
    inner: Mutex<Inner>,
    shutdown_tx: watch::Sender<bool>,

    // In-flight wait-group: every grant carries a clone of this sender,
    // held until the weight release lands. stop() drops the original and
    // waits for the channel to close, so disconnect follows the last
    // release.
    worker_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

/// RAII admission token held by a worker for the duration of its job's
/// work
///
/// Releasing (or dropping) it returns the job's weight to the datastore.
pub(crate) struct Grant {
    inner: Option<GrantInner>,
}

struct GrantInner {
    store: Arc<dyn Datastore>,
    id: String,
    weight: u32,
    _guard: Option<mpsc::Sender<()>>,
}

impl GrantInner {
    async fn release(self) {
        // Best-effort: the job cannot fail retroactively on a release
        // error, and remote state self-heals via its key expiry.
        if let Err(err) = self.store.register_done(&self.id, self.weight).await {
            if err.is_store_closed() {
                // A shared store stopped elsewhere cannot take the
                // release any more.
                debug!(id = %self.id, weight = self.weight, "weight release skipped, store closed");
            } else {
                warn!(id = %self.id, weight = self.weight, %err, "weight release failed");
            }
        }
    }
}

impl Grant {
    fn new(store: Arc<dyn Datastore>, id: String, weight: u32, guard: Option<mpsc::Sender<()>>) -> Self {
        Self {
            inner: Some(GrantInner {
                store,
                id,
                weight,
                _guard: guard,
            }),
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release().await;
        }
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        // A worker that unwinds before its explicit release still frees
        // the weight.
        if let Some(inner) = self.inner.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { inner.release().await });
            }
        }
    }
}

/// Rate-limited job scheduler
///
/// Enforces a concurrency ceiling and a minimum inter-start spacing over
/// submitted jobs, dispatching by priority. Submitters block on their
/// job's delivery channel; each admitted job runs in its own spawned
/// task. Cheap to clone; all clones share one queue, dispatcher, and
/// datastore. Construction spawns the dispatcher, so a `Limiter` must be
/// created inside a tokio runtime.
#[derive(Clone)]
pub struct Limiter {
    shared: Arc<Shared>,
}

impl Limiter {
    /// Create a limiter and start its dispatcher
    ///
    /// A supplied datastore requires a non-empty `id`
    /// ([`ThrottleError::MissingId`]); without one, a fresh in-memory
    /// store is created and the ID defaults to `"default"`.
    pub fn new(opts: Options) -> Result<Self, ThrottleError> {
        let (store, id) = match opts.datastore.clone() {
            Some(store) => {
                if opts.id.is_empty() {
                    return Err(ThrottleError::MissingId);
                }
                (store, opts.id.clone())
            }
            None => {
                let id = if opts.id.is_empty() {
                    LOCAL_ID.to_string()
                } else {
                    opts.id.clone()
                };
                (Arc::new(LocalStore::new()) as Arc<dyn Datastore>, id)
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (worker_tx, worker_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            id,
            limits: opts.limits(),
            store,
            inner: Mutex::new(Inner {
                queue: JobQueue::new(),
                running: true,
                stats: LimiterStats::default(),
                dispatcher: None,
            }),
            shutdown_tx,
            worker_tx: Mutex::new(Some(worker_tx)),
            worker_rx: tokio::sync::Mutex::new(Some(worker_rx)),
        });

        let handle = tokio::spawn(dispatch_loop(Arc::downgrade(&shared), shutdown_rx));
        shared.inner.lock().dispatcher = Some(handle);

        debug!(
            id = %shared.id,
            max_concurrent = shared.limits.max_concurrent,
            min_time = ?shared.limits.min_time,
            "Limiter::new: started"
        );
        Ok(Self { shared })
    }

    /// Submit a job with default priority and weight and await its result
    pub async fn submit<T, F, Fut>(&self, work: F) -> Result<T, ThrottleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with(work, DEFAULT_PRIORITY, DEFAULT_WEIGHT).await
    }

    /// Submit a job with explicit priority and weight and await its result
    ///
    /// Blocks on the job's delivery channel until a worker has run `work`
    /// and released its weight. Dropping the returned future while still
    /// queued withdraws the job; once launched, the work runs to
    /// completion and an unobserved delivery is discarded.
    pub async fn submit_with<T, F, Fut>(
        &self,
        work: F,
        priority: i32,
        weight: u32,
    ) -> Result<T, ThrottleError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if weight == 0 {
            return Err(ThrottleError::InvalidWeight);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            if !inner.running {
                return Err(ThrottleError::StoreClosed);
            }
            inner.queue.push(Job::new(priority, weight, work, tx));
            inner.stats.total_submitted += 1;
            let depth = inner.queue.len();
            if depth > inner.stats.peak_queue_depth {
                inner.stats.peak_queue_depth = depth;
            }
        }
        debug!(id = %self.shared.id, priority, weight, "Limiter::submit_with: queued");

        match rx.await {
            Ok(result) => result,
            // Limiter torn down without draining; treat as stopped.
            Err(_) => Err(ThrottleError::StoreClosed),
        }
    }

    /// Build a function that submits `work` through this limiter on every
    /// call
    pub fn wrap<T, F, Fut>(
        &self,
        work: F,
    ) -> impl Fn() -> Pin<Box<dyn Future<Output = Result<T, ThrottleError>> + Send>>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let limiter = self.clone();
        move || {
            let limiter = limiter.clone();
            let work = work.clone();
            Box::pin(async move { limiter.submit(work).await })
        }
    }

    /// Stop the limiter: reject queued jobs, await in-flight ones, then
    /// disconnect the datastore
    ///
    /// Queued jobs are failed with [`ThrottleError::StoreClosed`] and
    /// never executed. Idempotent. Must not be called from inside a
    /// submitted job: stop waits for in-flight jobs to finish.
    pub async fn stop(&self) -> Result<(), ThrottleError> {
        let handle = {
            let mut inner = self.shared.inner.lock();
            if !inner.running {
                debug!(id = %self.shared.id, "Limiter::stop: already stopped");
                return Ok(());
            }
            inner.running = false;
            inner.dispatcher.take()
        };

        // Dispatcher first, so nothing pops the queue while it drains.
        let _ = self.shared.shutdown_tx.send(true);
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained = self.shared.inner.lock().queue.drain();
        let rejected = drained.len();
        for job in drained {
            job.fail(ThrottleError::StoreClosed);
        }
        if rejected > 0 {
            debug!(id = %self.shared.id, rejected, "Limiter::stop: drained queue");
        }

        // Every outstanding grant holds a wait-group sender; disconnect
        // only after the last release.
        drop(self.shared.worker_tx.lock().take());
        let rx = self.shared.worker_rx.lock().await.take();
        if let Some(mut rx) = rx {
            while rx.recv().await.is_some() {}
        }

        debug!(id = %self.shared.id, "Limiter::stop: disconnecting");
        self.shared.store.disconnect().await
    }

    /// Get a snapshot of the limiter's counters
    pub fn stats(&self) -> LimiterStats {
        self.shared.inner.lock().stats.clone()
    }

    /// Get the number of jobs currently queued
    pub fn queue_depth(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Get the limiter's ID
    pub fn id(&self) -> &str {
        &self.shared.id
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Limiter")
            .field("id", &self.shared.id)
            .field("limits", &self.shared.limits)
            .field("running", &inner.running)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

/// The dispatcher: drains the priority queue through the admission gate
async fn dispatch_loop(shared: Weak<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(DISPATCH_TICK);
    debug!("Limiter::dispatch_loop: started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                // All limiter handles gone: nobody can submit or observe
                // results any more.
                let Some(shared) = shared.upgrade() else { break };
                if let Some(wait) = process_next(&shared).await {
                    // Cooperative pacing after a spacing denial; stop can
                    // still interrupt the sleep.
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    debug!("Limiter::dispatch_loop: exited");
}

/// Pop and gate one job. Returns a pacing wait for the caller to sleep.
async fn process_next(shared: &Arc<Shared>) -> Option<Duration> {
    let job = {
        let mut inner = shared.inner.lock();
        if !inner.running || inner.queue.is_empty() {
            return None;
        }
        inner.queue.pop()?
    };

    // The submitter dropped its future while queued: skip the datastore
    // round-trip entirely.
    if job.is_abandoned() {
        debug!(id = %shared.id, "Limiter::process_next: dropping abandoned job");
        return None;
    }

    let weight = job.weight();
    match shared.store.request(&shared.id, weight, &shared.limits).await {
        Err(err) => {
            // Medium failure: deliver the error, never re-enqueue.
            debug!(id = %shared.id, %err, "Limiter::process_next: datastore error");
            job.fail(err);
            None
        }
        Ok(Admission::Denied { retry_after }) => {
            let mut inner = shared.inner.lock();
            inner.stats.total_denied += 1;
            inner.queue.requeue(job);
            retry_after
        }
        Ok(Admission::Granted) => {
            let guard = shared.worker_tx.lock().clone();
            let grant = Grant::new(Arc::clone(&shared.store), shared.id.clone(), weight, guard);
            debug!(id = %shared.id, weight, "Limiter::process_next: launching job");
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                // Weight release and accounting happen between the work
                // and its delivery.
                let delivery = job.run().await;
                grant.release().await;
                shared.inner.lock().stats.total_completed += 1;
                delivery.deliver();
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[tokio::test]
    async fn test_submit_returns_job_result() {
        let limiter = Limiter::new(Options::default()).unwrap();

        let value = limiter.submit(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_job_error_propagates() {
        let limiter = Limiter::new(Options::default()).unwrap();

        let result: Result<(), _> = limiter.submit(|| async { Err(eyre::eyre!("task broke")) }).await;
        let report = result
            .unwrap_err()
            .into_job_error()
            .expect("should wrap the work's own error");
        assert_eq!(report.to_string(), "task broke");

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_weight_rejected() {
        let limiter = Limiter::new(Options::default()).unwrap();

        let result: Result<(), _> = limiter
            .submit_with(|| async { Ok(()) }, DEFAULT_PRIORITY, 0)
            .await;
        assert!(matches!(result, Err(ThrottleError::InvalidWeight)));

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_store_requires_id() {
        let opts = Options {
            datastore: Some(Arc::new(LocalStore::new())),
            ..Default::default()
        };
        assert!(matches!(Limiter::new(opts), Err(ThrottleError::MissingId)));
    }

    #[tokio::test]
    async fn test_local_id_defaults() {
        let limiter = Limiter::new(Options::default()).unwrap();
        assert_eq!(limiter.id(), "default");
        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let limiter = Limiter::new(Options::default()).unwrap();
        limiter.stop().await.unwrap();

        let result: Result<(), _> = limiter.submit(|| async { Ok(()) }).await;
        assert!(result.unwrap_err().is_store_closed());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let limiter = Limiter::new(Options::default()).unwrap();
        limiter.stop().await.unwrap();
        limiter.stop().await.unwrap();
    }

    /// Datastore whose medium always fails
    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl Datastore for FailingStore {
        async fn request(
            &self,
            _limiter_id: &str,
            _weight: u32,
            _limits: &Limits,
        ) -> Result<Admission, ThrottleError> {
            Err(ThrottleError::Store(eyre::eyre!("medium down")))
        }

        async fn register_done(&self, _limiter_id: &str, _weight: u32) -> Result<(), ThrottleError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ThrottleError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_datastore_error_is_delivered() {
        let opts = Options {
            id: "failing".to_string(),
            datastore: Some(Arc::new(FailingStore)),
            ..Default::default()
        };
        let limiter = Limiter::new(opts).unwrap();

        let result: Result<(), _> = limiter.submit(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(ThrottleError::Store(_))));

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_track_submissions() {
        let limiter = Limiter::new(Options::default()).unwrap();

        limiter.submit(|| async { Ok(()) }).await.unwrap();
        limiter.submit(|| async { Ok(()) }).await.unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.total_submitted, 2);
        assert_eq!(stats.total_completed, 2);
        assert!(stats.peak_queue_depth >= 1);

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_denials_are_counted() {
        let limiter = Limiter::new(Options {
            max_concurrent: 1,
            ..Default::default()
        })
        .unwrap();

        let (started_tx, started_rx) = oneshot::channel();
        let blocker = limiter.clone();
        let hold = tokio::spawn(async move {
            blocker
                .submit(move || async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();

        // Runs only after the blocker releases its weight; by then the
        // dispatcher has denied it at least once.
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        limiter
            .submit(move || async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        hold.await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(limiter.stats().total_denied >= 1);

        limiter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrap_forwards_to_submit() {
        let limiter = Limiter::new(Options::default()).unwrap();

        let wrapped = limiter.wrap(|| async { Ok("wrapped") });
        assert_eq!(wrapped().await.unwrap(), "wrapped");
        assert_eq!(wrapped().await.unwrap(), "wrapped");
        assert_eq!(limiter.stats().total_submitted, 2);

        limiter.stop().await.unwrap();
    }
}
