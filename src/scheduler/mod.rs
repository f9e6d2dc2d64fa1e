//! Priority-based job scheduler
//!
//! Dispatches plugin-execution jobs back out to agents, each exactly when
//! its next-execution deadline is reached, forever. The heap and its mutex
//! live in [`queue`]; this module owns the loop:
//!
//! ```text
//! feeders ─ add_jobs ─► [ mutex'd min-heap ] ◄─ pop / reinsert ─ loop ─► dispatch target
//! ```
//!
//! ## Timing
//!
//! The loop never sleeps past one tick (default 100ms): it peeks the heap
//! minimum, sleeps `min(remaining, tick)`, and re-examines. A more urgent
//! job added mid-wait is therefore observed within one tick, and a job
//! whose deadline already passed fires immediately. Deadlines advance by
//! the job's own interval from the previous deadline, so drift never
//! accumulates.
//!
//! ## Concurrency
//!
//! Two kinds of threads touch the queue: any number of feeders calling
//! `add_jobs`, and the one scheduling loop. The mutex is never held across
//! a sleep or a dispatch send, so feeders are never starved by a pending
//! job's wait.

pub mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::transport::{MessageSocket, SocketRef};
use crate::util::Clock;
use crate::{Envelope, RouteKey};

use queue::{Job, JobId, JobQueue, ScheduledJob};

/// Construction options for [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on any single wait; also the idle poll interval.
    pub tick: Duration,

    /// Deadline for one dispatch send. A send that cannot complete within
    /// this window is dropped (the job itself stays scheduled).
    pub dispatch_timeout: Duration,

    /// Route key stamped on dispatch envelopes.
    pub dispatch_route: RouteKey,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            dispatch_timeout: Duration::from_secs(1),
            dispatch_route: RouteKey::from("plugin_exec"),
        }
    }
}

/// The scheduling loop. Owns the shared queue; see the module docs.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    dispatch_target: SocketRef,
    clock: Clock,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    sequence: u64,
}

impl Scheduler {
    /// Create a scheduler dispatching due jobs onto `dispatch_target`
    /// (typically a router feed input).
    pub fn new(dispatch_target: SocketRef, config: SchedulerConfig) -> Self {
        Self {
            queue: Arc::new(JobQueue::new()),
            dispatch_target,
            clock: Clock::new(),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            sequence: 0,
        }
    }

    /// Handle for feeding and stopping this scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            queue: self.queue.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the scheduling loop until stopped.
    #[instrument(skip(self), fields(route = %self.config.dispatch_route))]
    pub async fn run(mut self) {
        debug!("starting scheduler loop (tick {:?})", self.config.tick);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("shutdown flag observed");
                break;
            }

            let now = self.clock.now_us();

            if let Some(scheduled) = self.queue.pop_due(now) {
                // Reinsert for the next cycle before dispatching, so a slow
                // dispatch cannot delay the next scheduling round.
                let mut next = scheduled.clone();
                next.job.advance();
                self.queue.reinsert(next);

                self.dispatch(scheduled).await;

                // Drain any backlog without sleeping.
                continue;
            }

            let wait = match self.queue.next_due_us() {
                Some(due_us) if due_us > now => {
                    Duration::from_micros(due_us - now).min(self.config.tick)
                }
                // Became due since the pop attempt.
                Some(_) => continue,
                None => self.config.tick,
            };

            tokio::time::sleep(wait).await;
        }

        debug!("scheduler stopped ({} jobs still queued)", self.queue.len());
    }

    /// Announce one due job on the dispatch target.
    ///
    /// Failures are logged and swallowed: the job was already reinserted,
    /// so one bad cycle never removes a recurring job, and a bad job never
    /// kills the loop.
    async fn dispatch(&mut self, scheduled: ScheduledJob) {
        self.sequence += 1;

        let ScheduledJob { id, job } = scheduled;

        let envelope = Envelope {
            to: self.config.dispatch_route.clone(),
            from: job.target,
            ack: false,
            sequence: self.sequence,
            // The scheduled deadline, not the dispatch wall clock.
            timestamp: job.next_execution_us,
            payload: job.payload,
        };

        let send = self.dispatch_target.send(envelope);
        match tokio::time::timeout(self.config.dispatch_timeout, send).await {
            Ok(Ok(())) => {
                trace!("dispatched job {id:?}");
            }
            Ok(Err(e)) => {
                warn!("dispatch of job {id:?} failed: {e}");
            }
            Err(_) => {
                warn!(
                    "dispatch of job {id:?} timed out after {:?}",
                    self.config.dispatch_timeout
                );
            }
        }
    }
}

/// Cloneable handle for feeding and stopping a scheduler.
///
/// `add_jobs` is synchronous and lock-scoped, so feeders living on plain
/// threads can call it as easily as async tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<JobQueue>,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Spawn a scheduler as a background task and return its handle.
    pub fn spawn(dispatch_target: SocketRef, config: SchedulerConfig) -> Self {
        let scheduler = Scheduler::new(dispatch_target, config);
        let handle = scheduler.handle();

        tokio::spawn(scheduler.run());

        handle
    }

    /// Bulk-insert jobs; returns their queue identities in input order.
    pub fn add_jobs(&self, jobs: Vec<Job>) -> Vec<JobId> {
        self.queue.push_all(jobs)
    }

    /// End the recurrence of the given jobs.
    pub fn remove_jobs(&self, ids: &[JobId]) {
        self.queue.remove(ids);
    }

    /// Number of queued heap entries.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop the loop cooperatively; observed within one tick.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
