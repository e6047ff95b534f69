//! Queue types for the limiter

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

use crate::error::ThrottleError;

/// The type-erased body of a queued job
///
/// Splitting execution from delivery lets the worker account the
/// completion between the two: run the work, release the weight, then
/// deliver.
pub(crate) trait Task: Send {
    /// Run the work and hand back the pending delivery.
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Box<dyn Delivery>> + Send>>;

    /// Deliver an error without running the work.
    fn fail(self: Box<Self>, err: ThrottleError);

    /// Check whether the submitter stopped waiting for the outcome.
    fn is_abandoned(&self) -> bool;
}

/// The result of a finished job, not yet handed to its submitter
pub(crate) trait Delivery: Send {
    fn deliver(self: Box<Self>);
}

struct FnTask<T> {
    work: Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = eyre::Result<T>> + Send>> + Send>,
    tx: oneshot::Sender<Result<T, ThrottleError>>,
}

struct FnDelivery<T> {
    tx: oneshot::Sender<Result<T, ThrottleError>>,
    result: Result<T, ThrottleError>,
}

impl<T: Send + 'static> Task for FnTask<T> {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Box<dyn Delivery>> + Send>> {
        let FnTask { work, tx } = *self;
        Box::pin(async move {
            let result = work().await.map_err(ThrottleError::Job);
            Box::new(FnDelivery { tx, result }) as Box<dyn Delivery>
        })
    }

    fn fail(self: Box<Self>, err: ThrottleError) {
        let _ = self.tx.send(Err(err));
    }

    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T: Send + 'static> Delivery for FnDelivery<T> {
    fn deliver(self: Box<Self>) {
        let _ = self.tx.send(self.result);
    }
}

/// A queued job awaiting admission
///
/// Carries the user-supplied work and the delivery channel. The
/// submitter holds the receiving half; exactly one message (the work's
/// outcome or an error) is ever delivered.
pub(crate) struct Job {
    priority: i32,
    weight: u32,
    seq: u64,
    task: Box<dyn Task>,
}

impl Job {
    /// Create a job; the queue assigns its sequence number on push
    pub(crate) fn new<T, F, Fut>(
        priority: i32,
        weight: u32,
        work: F,
        tx: oneshot::Sender<Result<T, ThrottleError>>,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            priority,
            weight,
            seq: 0,
            task: Box::new(FnTask {
                work: Box::new(move || {
                    Box::pin(work()) as Pin<Box<dyn Future<Output = eyre::Result<T>> + Send>>
                }),
                tx,
            }),
        }
    }

    pub(crate) fn weight(&self) -> u32 {
        self.weight
    }

    /// Check whether the submitter stopped waiting for the outcome
    pub(crate) fn is_abandoned(&self) -> bool {
        self.task.is_abandoned()
    }

    /// Run the work, handing back the pending delivery
    pub(crate) async fn run(self) -> Box<dyn Delivery> {
        self.task.run().await
    }

    /// Deliver an error instead of running the work
    pub(crate) fn fail(self, err: ThrottleError) {
        self.task.fail(err);
    }
}

impl Eq for Job {}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap of jobs keyed on priority
///
/// Equal priorities pop in submission order via a monotonically
/// increasing sequence number. Not concurrency-safe; the limiter
/// serializes access under its mutex.
#[derive(Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<Job>,
    next_seq: u64,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a newly submitted job, stamping its sequence number
    pub(crate) fn push(&mut self, mut job: Job) {
        job.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(job);
    }

    /// Put a denied job back without re-stamping, so it keeps its place
    /// among equal priorities
    pub(crate) fn requeue(&mut self, job: Job) {
        self.heap.push(job);
    }

    /// Remove and return the highest-priority job
    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.heap.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Empty the queue, yielding the jobs in no particular order
    pub(crate) fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.heap).into_vec()
    }
}

/// Counters maintained by the limiter
#[derive(Debug, Default, Clone)]
pub struct LimiterStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_denied: u64,
    pub peak_queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: i32) -> Job {
        let (tx, _rx) = oneshot::channel::<Result<(), ThrottleError>>();
        Job::new(priority, 1, || async { Ok(()) }, tx)
    }

    #[test]
    fn test_pop_highest_priority_first() {
        let mut queue = JobQueue::new();
        queue.push(job(1));
        queue.push(job(10));
        queue.push(job(5));

        assert_eq!(queue.pop().unwrap().priority, 10);
        assert_eq!(queue.pop().unwrap().priority, 5);
        assert_eq!(queue.pop().unwrap().priority, 1);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_equal_priority_pops_in_submission_order() {
        let mut queue = JobQueue::new();
        queue.push(job(5));
        queue.push(job(5));
        queue.push(job(5));

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        let third = queue.pop().unwrap();
        assert!(first.seq < second.seq);
        assert!(second.seq < third.seq);
    }

    #[test]
    fn test_requeue_keeps_place_among_equals() {
        let mut queue = JobQueue::new();
        queue.push(job(5));
        queue.push(job(5));

        // Pop the older job, put it back, and confirm it still pops
        // ahead of the younger one.
        let denied = queue.pop().unwrap();
        let denied_seq = denied.seq;
        queue.requeue(denied);

        assert_eq!(queue.pop().unwrap().seq, denied_seq);
    }

    #[tokio::test]
    async fn test_run_delivers_the_work_result() {
        let (tx, rx) = oneshot::channel();
        let job = Job::new(5, 1, || async { Ok(7) }, tx);

        job.run().await.deliver();

        assert_eq!(rx.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fail_delivers_error_without_running() {
        let (tx, rx) = oneshot::channel::<Result<(), ThrottleError>>();
        let job = Job::new(5, 1, || async { panic!("must not run") }, tx);

        job.fail(ThrottleError::StoreClosed);

        assert!(rx.await.unwrap().unwrap_err().is_store_closed());
    }

    #[test]
    fn test_abandoned_detection() {
        let (tx, rx) = oneshot::channel::<Result<(), ThrottleError>>();
        let queued = Job::new(5, 1, || async { Ok(()) }, tx);
        assert!(!queued.is_abandoned());

        drop(rx);
        assert!(queued.is_abandoned());
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = JobQueue::new();
        queue.push(job(1));
        queue.push(job(2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
