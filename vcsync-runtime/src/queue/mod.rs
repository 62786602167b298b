//! The deduplicating, rate-limited work queue shared by every controller.
//!
//! [`run_queue`] is a single dispatch loop that owns the whole lifecycle of
//! a work item. An item is always in exactly one place:
//!
//! - **queued**: sitting in a [`DelayQueue`] until its due time; scheduling
//!   an equal item again collapses into one entry that keeps the earliest
//!   due time and the newest payload (which is how a fresh informer event
//!   resets the backoff accounting of a queued retry);
//! - **ready**: due and waiting for a worker slot;
//! - **running**: being processed, at most `workers` at a time and never
//!   two equal items at once;
//! - **parked**: it arrived while an equal item was running, so it gets one
//!   re-visit as soon as that execution completes.
//!
//! Failures are re-enqueued with per-item exponential backoff until either
//! the retry budget or a wall-clock ceiling measured from the item's first
//! failure runs out; the first-failure timestamp travels inside the item
//! itself, so no side table is needed. Cancelling the stop token lets
//! in-flight work finish and discards everything still queued.

use crate::error::SyncError;
use futures::{
    channel::mpsc, future::poll_fn, stream::FuturesUnordered, FutureExt, StreamExt,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{Debug, Display},
    hash::Hash,
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::{
    sync::CancellationToken,
    time::{delay_queue, DelayQueue},
};
use tracing::{debug, info_span, warn, Instrument};

/// A request to run `message` once `run_at` is reached.
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    /// The work item.
    pub message: T,
    /// When it becomes due.
    pub run_at: Instant,
}

impl<T> ScheduleRequest<T> {
    /// A request that is due immediately.
    pub fn now(message: T) -> Self {
        Self {
            message,
            run_at: Instant::now(),
        }
    }
}

/// Per-item retry accounting carried inside work items.
///
/// Fresh events enter with zeroed accounting, which is what clears backoff
/// for a key once new state arrives.
pub trait QueueItem: Clone + Eq + Hash + Debug + Display + Send + 'static {
    /// How many times this item has already failed.
    fn attempts(&self) -> u32;
    /// When this item first failed, if it ever has.
    fn first_failure(&self) -> Option<Instant>;
    /// A copy with one more recorded failure.
    #[must_use]
    fn retried(&self, first_failure: Instant) -> Self;
}

/// Exponential per-item backoff with a retry budget and a wall-clock
/// ceiling.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts after which an item is dropped.
    pub max_retries: u32,
    /// Wall-clock ceiling measured from the item's first failure.
    pub giveup_after: Duration,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 15,
            giveup_after: Duration::from_secs(600),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before attempt number `attempts` is retried.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether an item that just failed again should be dropped.
    #[must_use]
    pub fn gives_up(&self, attempts: u32, first_failure: Instant, now: Instant) -> bool {
        attempts > self.max_retries || now.saturating_duration_since(first_failure) >= self.giveup_after
    }
}

/// Put `item` into the delay queue, coalescing with any queued equal item
/// and parking it instead when an equal item is currently running.
fn schedule<T: QueueItem>(
    item: T,
    run_at: Instant,
    delays: &mut DelayQueue<T>,
    queued: &mut HashMap<T, delay_queue::Key>,
    running: &HashSet<T>,
    parked: &mut HashSet<T>,
) {
    if running.contains(&item) {
        // Re-visited once the in-flight execution completes; the newest
        // payload wins the parking slot.
        parked.replace(item);
        return;
    }
    let run_at = match queued.remove(&item) {
        // Already queued: keep the earliest due time, drop the old payload.
        Some(key) => delays.remove(&key).deadline().min(run_at),
        None => run_at,
    };
    let key = delays.insert_at(item.clone(), run_at);
    queued.insert(item, key);
}

/// Drive a work queue until `stop` fires.
///
/// `process` is invoked once per due item, serialized per key, with at most
/// `workers` executions in flight. Failures are re-enqueued with backoff
/// per `policy`. The loop also ends once `requests` closes and all accepted
/// work (including retries) has drained.
pub async fn run_queue<T, F>(
    requests: mpsc::UnboundedReceiver<ScheduleRequest<T>>,
    workers: usize,
    policy: RetryPolicy,
    stop: CancellationToken,
    mut process: F,
) where
    T: QueueItem,
    F: FnMut(&T) -> futures::future::BoxFuture<'static, Result<(), SyncError>>,
{
    let workers = workers.max(1);
    let mut requests = requests;
    let mut delays: DelayQueue<T> = DelayQueue::new();
    let mut queued: HashMap<T, delay_queue::Key> = HashMap::new();
    let mut ready: VecDeque<T> = VecDeque::new();
    let mut running: HashSet<T> = HashSet::new();
    let mut parked: HashSet<T> = HashSet::new();
    let mut work: FuturesUnordered<futures::future::BoxFuture<'static, (T, Result<(), SyncError>)>> =
        FuturesUnordered::new();
    let mut stopping = false;
    let mut inputs_closed = false;

    loop {
        // Fill free worker slots from the ready backlog, never running two
        // equal items at once.
        while !stopping && work.len() < workers {
            let Some(item) = ready.pop_front() else { break };
            if running.contains(&item) {
                parked.replace(item);
                continue;
            }
            let span = info_span!("reconciling", item = %item, attempt = item.attempts() + 1);
            let fut = process(&item).instrument(span);
            running.insert(item.clone());
            work.push(async move { (item, fut.await) }.boxed());
        }

        if stopping && work.is_empty() {
            // In-flight work has finished; queued items are discarded.
            break;
        }
        if inputs_closed && work.is_empty() && ready.is_empty() && queued.is_empty() {
            break;
        }

        tokio::select! {
            () = stop.cancelled(), if !stopping => {
                stopping = true;
            }
            request = requests.next(), if !stopping && !inputs_closed => match request {
                Some(ScheduleRequest { message, run_at }) => {
                    schedule(message, run_at, &mut delays, &mut queued, &running, &mut parked);
                }
                None => inputs_closed = true,
            },
            expired = poll_fn(|cx| delays.poll_expired(cx)), if !stopping && !queued.is_empty() => {
                if let Some(expired) = expired {
                    let item = expired.into_inner();
                    queued.remove(&item);
                    ready.push_back(item);
                }
            }
            completed = work.next(), if !work.is_empty() => {
                let Some((item, outcome)) = completed else { continue };
                running.remove(&item);
                if let Some(revisit) = parked.take(&item) {
                    ready.push_back(revisit);
                }
                if let Err(error) = outcome {
                    let now = Instant::now();
                    let first_failure = item.first_failure().unwrap_or(now);
                    let attempts = item.attempts() + 1;
                    if policy.gives_up(attempts, first_failure, now) {
                        warn!(
                            item = %item,
                            %error,
                            attempts,
                            transient = error.is_transient(),
                            "giving up on work item"
                        );
                    } else if !stopping {
                        let delay = policy.delay(attempts);
                        debug!(item = %item, %error, attempts, ?delay, "work item failed, backing off");
                        schedule(
                            item.retried(first_failure),
                            now + delay,
                            &mut delays,
                            &mut queued,
                            &running,
                            &mut parked,
                        );
                    }
                }
            }
        }
    }
    debug!("work queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{future, SinkExt};
    use std::sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    };
    use tokio::time::sleep;

    #[derive(Clone, Debug)]
    struct TestItem {
        key: &'static str,
        attempts: u32,
        first_failure: Option<Instant>,
    }

    fn item(key: &'static str) -> TestItem {
        TestItem {
            key,
            attempts: 0,
            first_failure: None,
        }
    }

    impl PartialEq for TestItem {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }
    impl Eq for TestItem {}
    impl std::hash::Hash for TestItem {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.key.hash(state);
        }
    }
    impl Display for TestItem {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.key)
        }
    }
    impl QueueItem for TestItem {
        fn attempts(&self) -> u32 {
            self.attempts
        }
        fn first_failure(&self) -> Option<Instant> {
            self.first_failure
        }
        fn retried(&self, first_failure: Instant) -> Self {
            Self {
                key: self.key,
                attempts: self.attempts + 1,
                first_failure: Some(first_failure),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_requests_coalesce_at_the_earliest_time() {
        let runs = Arc::new(AtomicU32::new(0));
        let (mut tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();
        let counted = runs.clone();
        let handle = tokio::spawn(run_queue(rx, 2, RetryPolicy::default(), stop.clone(), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            future::ok(()).boxed()
        }));
        let now = Instant::now();
        tx.send(ScheduleRequest {
            message: item("a"),
            run_at: now + Duration::from_secs(3),
        })
        .await
        .unwrap();
        tx.send(ScheduleRequest {
            message: item("a"),
            run_at: now + Duration::from_secs(1),
        })
        .await
        .unwrap();
        // The earlier request wins the slot.
        sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // And the later one was coalesced away.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        stop.cancel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn equal_items_serialize_and_get_one_revisit() {
        let runs = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (mut tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();
        let handle = {
            let runs = runs.clone();
            let overlap = overlap.clone();
            let peak = peak.clone();
            tokio::spawn(run_queue(rx, 4, RetryPolicy::default(), stop.clone(), move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                let overlap = overlap.clone();
                let peak = peak.clone();
                async move {
                    let now = overlap.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    overlap.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }))
        };
        tx.send(ScheduleRequest::now(item("a"))).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        // Arrives while the first execution is still running: parked, then
        // re-visited exactly once.
        tx.send(ScheduleRequest::now(item("a"))).await.unwrap();
        tx.send(ScheduleRequest::now(item("a"))).await.unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        stop.cancel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_count_bounds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (mut tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();
        let handle = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(run_queue(rx, 2, RetryPolicy::default(), stop.clone(), move |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }))
        };
        for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            tx.send(ScheduleRequest::now(item(key))).await.unwrap();
        }
        drop(tx);
        // The queue drains on its own once the inputs close.
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_item_is_dropped_after_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: 3,
            giveup_after: Duration::from_secs(600),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
        };
        let counted = calls.clone();
        let handle = tokio::spawn(run_queue(rx, 2, policy, stop.clone(), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            future::err(SyncError::Adapter("boom".to_string())).boxed()
        }));
        tx.send(ScheduleRequest::now(item("boom"))).await.unwrap();
        sleep(Duration::from_secs(60)).await;
        // initial attempt + max_retries retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        stop.cancel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_ceiling_beats_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            giveup_after: Duration::from_secs(10),
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(4),
        };
        let counted = calls.clone();
        let handle = tokio::spawn(run_queue(rx, 1, policy, stop.clone(), move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            future::err(SyncError::Adapter("boom".to_string())).boxed()
        }));
        tx.send(ScheduleRequest::now(item("boom"))).await.unwrap();
        sleep(Duration::from_secs(120)).await;
        // Fails at 0s, 4s, 8s and 12s; the 12s failure is past the 10s
        // ceiling, so no fifth attempt is scheduled.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        stop.cancel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_token_ends_the_queue() {
        let (mut tx, rx) = mpsc::unbounded::<ScheduleRequest<TestItem>>();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_queue(rx, 1, RetryPolicy::default(), stop.clone(), |_| {
            future::ok(()).boxed()
        }));
        tx.send(ScheduleRequest::now(item("x"))).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
