//! Periodic background jobs
//!
//! A job runs on the dispatcher under its own id, so two runs of the same job never
//! overlap. A run asking for a retry is repeated after its backoff delay; periodic ticks
//! are skipped while a retry is pending.

use crate::dispatcher::Dispatcher;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of one job run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Retry,
}

/// Delay before a failed run is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `base * attempt`
    Linear(Duration),
    /// `base * 2^(attempt - 1)`
    Exponential(Duration),
}

impl BackoffPolicy {
    /// Delay before retry number `attempt`, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffPolicy::Linear(base) => base.saturating_mul(attempt),
            BackoffPolicy::Exponential(base) => match 1u32.checked_shl(attempt - 1) {
                Some(factor) => base.saturating_mul(factor),
                None => Duration::MAX,
            },
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Linear(Duration::from_secs(10 * 60))
    }
}

/// A unit of background work run periodically
pub trait Job: Send + Sync + 'static {
    /// Stable identifier, also the dispatcher key runs are serialized under
    fn id(&self) -> &str;

    fn run(&self) -> JobOutcome;

    /// Whether the job should run at the next tick
    fn can_schedule(&self) -> bool {
        true
    }

    fn periodic_interval(&self) -> Duration;

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default()
    }
}

type JobFn = Box<dyn Fn() -> JobOutcome + Send + Sync>;

/// Job backed by a closure
pub struct FnJob {
    id: String,
    interval: Duration,
    backoff: BackoffPolicy,
    run: JobFn,
}

impl FnJob {
    pub fn new<F>(id: impl Into<String>, interval: Duration, run: F) -> Self
    where
        F: Fn() -> JobOutcome + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            interval,
            backoff: BackoffPolicy::default(),
            run: Box::new(run),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Job for FnJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self) -> JobOutcome {
        (self.run)()
    }

    fn periodic_interval(&self) -> Duration {
        self.interval
    }

    fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }
}

impl fmt::Debug for FnJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Runs jobs on their interval through a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct JobScheduler {
    dispatcher: Dispatcher,
}

struct Scheduled {
    job: Arc<dyn Job>,
    dispatcher: Dispatcher,
    handle: Handle,
    retry_pending: AtomicBool,
}

impl JobScheduler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Starts the periodic loop of `job`. Must be called from within a tokio runtime.
    ///
    /// The first run happens immediately. Aborting the returned handle stops further
    /// ticks but not a run already handed to the dispatcher.
    pub fn spawn(&self, job: Arc<dyn Job>) -> JoinHandle<()> {
        let scheduled = Arc::new(Scheduled {
            job,
            dispatcher: self.dispatcher.clone(),
            handle: Handle::current(),
            retry_pending: AtomicBool::new(false),
        });

        info!(
            job = scheduled.job.id(),
            interval_secs = scheduled.job.periodic_interval().as_secs(),
            "Scheduling job"
        );

        tokio::spawn(async move {
            // A zero period panics in tokio
            let period = scheduled.job.periodic_interval().max(Duration::from_millis(1));
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !scheduled.job.can_schedule() {
                    debug!(job = scheduled.job.id(), "Job not schedulable, skipping tick");
                    continue;
                }
                if scheduled.retry_pending.load(Ordering::Acquire) {
                    debug!(job = scheduled.job.id(), "Retry pending, skipping tick");
                    continue;
                }
                submit_run(Arc::clone(&scheduled), 0);
            }
        })
    }
}

/// Hands one run to the dispatcher. `retries` counts the failed runs before this one.
fn submit_run(scheduled: Arc<Scheduled>, retries: u32) {
    let dispatcher = scheduled.dispatcher.clone();
    let id = scheduled.job.id().to_string();

    dispatcher.submit(&id, move || {
        let outcome = scheduled.job.run();
        debug!(job = scheduled.job.id(), ?outcome, "Job finished");

        match outcome {
            JobOutcome::Success => {
                scheduled.retry_pending.store(false, Ordering::Release);
            }
            JobOutcome::Retry => {
                let attempt = retries + 1;
                let delay = scheduled.job.backoff().delay(attempt);
                warn!(
                    job = scheduled.job.id(),
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "Job requested retry"
                );
                scheduled.retry_pending.store(true, Ordering::Release);

                let handle = scheduled.handle.clone();
                handle.spawn(async move {
                    time::sleep(delay).await;
                    submit_run(scheduled, attempt);
                });
            }
        }
        Ok(())
    });
}
