//! Single-flight job table for modplay
//!
//! Ensures at most one job per key is in progress within the process. The first
//! caller for a key becomes the leader and its work runs on a detached task; later
//! callers join as waiters. When the job finishes, the record is removed and the
//! outcome is sent to every waiter, so all of them observe the same result.
//!
//! The table is a sharded concurrent map, so jobs for different keys never
//! contend on a common lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// The job task ended without producing an outcome (panic or runtime shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightAborted;

/// Lifecycle of an in-flight job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, waiting for resources
    Pending,
    /// Doing the work
    Running,
    /// Finished successfully
    Ready,
    /// Finished with an error
    Failed,
}

impl JobState {
    /// Convert state to string for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Ready => "ready",
            JobState::Failed => "failed",
        }
    }
}

type Waiter<T, E> = oneshot::Sender<Result<T, E>>;

struct Flight<T, E> {
    state: JobState,
    started_at: Instant,
    waiters: Vec<Waiter<T, E>>,
}

/// Handle given to the leader's work to report progress
pub struct FlightTicket<K, T, E>
where
    K: Eq + Hash,
{
    key: K,
    table: Arc<SingleFlight<K, T, E>>,
}

impl<K, T, E> FlightTicket<K, T, E>
where
    K: Eq + Hash + Clone,
{
    /// Move the job from `Pending` to `Running`
    pub fn mark_running(&self) {
        if let Some(mut flight) = self.table.flights.get_mut(&self.key) {
            flight.state = JobState::Running;
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

/// Per-key in-flight job table
pub struct SingleFlight<K, T, E>
where
    K: Eq + Hash,
{
    flights: DashMap<K, Flight<T, E>>,
}

impl<K, T, E> Default for SingleFlight<K, T, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + From<FlightAborted> + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `work` for `key` unless a job for it is already in flight, then wait
    /// for the job's outcome.
    ///
    /// `work` is only called by the leader. It runs on its own task, so the job
    /// completes and is published even if every caller stops waiting.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, work: F) -> Result<T, E>
    where
        F: FnOnce(FlightTicket<K, T, E>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leader = match self.flights.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().waiters.push(tx);
                debug!(
                    key = %key,
                    state = occupied.get().state.as_str(),
                    waiters = occupied.get().waiters.len(),
                    "Joined in-flight job"
                );
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Flight {
                    state: JobState::Pending,
                    started_at: Instant::now(),
                    waiters: vec![tx],
                });
                true
            }
        };

        if leader {
            let ticket = FlightTicket {
                key: key.clone(),
                table: Arc::clone(self),
            };
            let job = tokio::spawn(work(ticket));
            let table = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = match job.await {
                    Ok(outcome) => outcome,
                    Err(join_error) => {
                        error!(key = %key, error = %join_error, "In-flight job aborted");
                        Err(E::from(FlightAborted))
                    }
                };
                table.complete(&key, outcome);
            });
        }

        rx.await.unwrap_or_else(|_| Err(E::from(FlightAborted)))
    }

    fn complete(&self, key: &K, outcome: Result<T, E>) {
        let Some((_, flight)) = self.flights.remove(key) else {
            return;
        };

        let terminal = if outcome.is_ok() {
            JobState::Ready
        } else {
            JobState::Failed
        };
        debug!(
            key = %key,
            state = terminal.as_str(),
            waiters = flight.waiters.len(),
            elapsed_ms = flight.started_at.elapsed().as_millis() as u64,
            "In-flight job finished"
        );

        for waiter in flight.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Current state of the job for `key`, if one is in flight
    pub fn state(&self, key: &K) -> Option<JobState> {
        self.flights.get(key).map(|flight| flight.state)
    }

    /// Number of jobs in flight
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Number of jobs in each live state, as `(pending, running)`
    pub fn counts(&self) -> (usize, usize) {
        self.flights
            .iter()
            .fold((0, 0), |(pending, running), flight| match flight.state {
                JobState::Pending => (pending + 1, running),
                JobState::Running => (pending, running + 1),
                JobState::Ready | JobState::Failed => (pending, running),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Boom,
        Aborted,
    }

    impl From<FlightAborted> for TestError {
        fn from(_: FlightAborted) -> Self {
            TestError::Aborted
        }
    }

    type Table = SingleFlight<String, u32, TestError>;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_execution() {
        let table: Arc<Table> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let table = table.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                table
                    .run("song".to_string(), move |_ticket| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(7)
                    })
                    .await
            }));
        }

        // Let every caller join before releasing the leader
        while table.flights.get("song").map(|f| f.waiters.len()).unwrap_or(0) < 50 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_delivered_to_all_and_not_remembered() {
        let table: Arc<Table> = SingleFlight::new();

        let first = table
            .run("bad".to_string(), |_| async { Err(TestError::Boom) })
            .await;
        assert_eq!(first, Err(TestError::Boom));

        // A fresh job runs after a failure
        let second = table.run("bad".to_string(), |_| async { Ok(1) }).await;
        assert_eq!(second, Ok(1));
    }

    #[tokio::test]
    async fn test_panicking_job_reports_aborted() {
        let table: Arc<Table> = SingleFlight::new();
        let result = table
            .run("panic".to_string(), |_| async {
                if true {
                    panic!("job exploded");
                }
                Ok(0)
            })
            .await;
        assert_eq!(result, Err(TestError::Aborted));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let table: Arc<Table> = SingleFlight::new();
        let gate = Arc::new(Notify::new());
        let running = Arc::new(Notify::new());

        let task = {
            let table = table.clone();
            let gate = gate.clone();
            let running = running.clone();
            tokio::spawn(async move {
                table
                    .run("k".to_string(), move |ticket| async move {
                        ticket.mark_running();
                        running.notify_one();
                        gate.notified().await;
                        Ok(3)
                    })
                    .await
            })
        };

        running.notified().await;
        assert_eq!(table.state(&"k".to_string()), Some(JobState::Running));
        assert_eq!(table.counts(), (0, 1));

        gate.notify_one();
        assert_eq!(task.await.unwrap(), Ok(3));
        assert_eq!(table.state(&"k".to_string()), None);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let table: Arc<Table> = SingleFlight::new();
        let (a, b) = tokio::join!(
            table.run("a".to_string(), |_| async { Ok(1) }),
            table.run("b".to_string(), |_| async { Ok(2) }),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
    }
}
