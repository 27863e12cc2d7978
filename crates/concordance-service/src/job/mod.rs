//! Jobs: asynchronous computations with a lifecycle, a priority level and reference counted
//! ownership.
//!
//! A [`Job`] is created by the [`SearchService`] on a cache miss and runs as a task on the
//! service runtime. It goes through `Created → Started → Running ⇄ Paused/LowPriority →
//! Finished`, where finishing is terminal and resets the priority level to running.
//!
//! Every job has exactly one outcome. Whatever happens inside the computation, including panics,
//! cancellation and the cache-enforced hard timeout, ends up as that outcome and is observed by
//! everybody inspecting the job afterwards.
//!
//! Ownership is tracked by reference counting through [`JobHandle`]s. The cache holds one
//! reference for as long as the job is cached, every caller holds one for as long as it is
//! interested in the result, and a job waiting for another job holds one on that dependency.
//! Once the count drops to zero, nobody needs the job anymore and it is cancelled.

use std::fmt;
use std::mem::size_of;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionControl, Progress, SearchBackend};
use crate::computations::Computation;
use crate::config::Config;
use crate::error::JobError;
use crate::fingerprint::{Fingerprint, JobKind, SearchParameters};
use crate::results::{Hit, JobOutput};
use crate::service::SearchService;
use crate::utils::defer::defer;

mod handle;
mod worthiness;

pub use handle::{JobHandle, JobInfo, JobStatus};
pub use worthiness::{SchedulingPolicy, Worthiness};

/// Identifies a job within one service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cooperative priority of a running job.
///
/// Levels are hints that take effect at the computation's checkpoints, see
/// [`ExecutionControl::checkpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Running,
    LowPriority,
    Paused,
}

/// The parts of the configuration every job needs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct JobSettings {
    pub policy: SchedulingPolicy,
    pub release_results_early: bool,
    pub check_again_min: Duration,
    pub check_again_divider: u32,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.scheduling.policy(),
            release_results_early: config.cache.release_results_early,
            check_again_min: config.scheduling.check_again_min,
            check_again_divider: config.scheduling.check_again_divider.max(1),
        }
    }
}

#[derive(Debug)]
struct JobState {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    last_accessed: Instant,
    level: PriorityLevel,
    /// When the job last started or resumed running.
    run_phase_since: Instant,
    /// When the job was paused, while it is paused.
    paused_since: Option<Instant>,
    /// Time spent in completed pauses.
    paused_total: Duration,
    outcome: Option<Result<JobOutput, JobError>>,
    /// Size of the stored outcome, measured once when the job finishes.
    outcome_size: usize,
    cancel_reason: Option<JobError>,
}

impl JobState {
    fn execution_time(&self, now: Instant) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.finished_at.unwrap_or(now);
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += end.saturating_duration_since(since);
        }
        end.saturating_duration_since(started_at)
            .saturating_sub(paused)
    }

    fn paused_total(&self, now: Instant) -> Duration {
        let current = self
            .paused_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.paused_total + current
    }
}

/// One asynchronous computation.
pub struct Job {
    id: JobId,
    fingerprint: Fingerprint,
    computation: Computation,
    settings: JobSettings,
    state: Mutex<JobState>,
    started: AtomicBool,
    refs: AtomicUsize,
    /// Dependencies this job is currently waiting on, each holding a reference.
    waiting_for: Mutex<Vec<JobHandle>>,
    token: CancellationToken,
    finished: watch::Sender<bool>,
    level: watch::Sender<PriorityLevel>,
    progress: Arc<Progress>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        fingerprint: Fingerprint,
        computation: Computation,
        settings: JobSettings,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            fingerprint,
            computation,
            settings,
            state: Mutex::new(JobState {
                started_at: None,
                finished_at: None,
                last_accessed: now,
                level: PriorityLevel::Running,
                run_phase_since: now,
                paused_since: None,
                paused_total: Duration::ZERO,
                outcome: None,
                outcome_size: 0,
                cancel_reason: None,
            }),
            started: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            waiting_for: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            finished: watch::Sender::new(false),
            level: watch::Sender::new(PriorityLevel::Running),
            progress: Default::default(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn kind(&self) -> JobKind {
        self.fingerprint.kind()
    }

    /// The number of outstanding [`JobHandle`]s, including the one held by the cache.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| refs.checked_sub(1));

        match previous {
            Err(_) => {
                tracing::error!(job = %self.id, "released a job that has no references");
            }
            // nothing needs the job anymore
            Ok(1) => {
                self.cancel();
                if self.settings.release_results_early {
                    let mut state = self.state.lock().unwrap();
                    state.outcome = None;
                    state.outcome_size = 0;
                }
            }
            // only the cache holds it now, which starts its idle time
            Ok(2) => self.touch(),
            Ok(_) => {}
        }
    }

    /// Refreshes the time of last access.
    pub(crate) fn touch(&self) {
        self.state.lock().unwrap().last_accessed = Instant::now();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Whether the job ended without its computation completing.
    pub fn is_aborted(&self) -> bool {
        matches!(
            self.state.lock().unwrap().outcome,
            Some(Err(ref e)) if e.is_abort()
        )
    }

    /// Whether the job is blocked on one of its dependencies.
    pub fn is_waiting(&self) -> bool {
        !self.waiting_for.lock().unwrap().is_empty()
    }

    pub fn waiting_for(&self) -> Vec<JobId> {
        self.waiting_for
            .lock()
            .unwrap()
            .iter()
            .map(JobHandle::id)
            .collect()
    }

    pub fn level(&self) -> PriorityLevel {
        *self.level.borrow()
    }

    /// Time spent executing, not counting pauses.
    pub fn execution_time(&self) -> Duration {
        self.state.lock().unwrap().execution_time(Instant::now())
    }

    /// Time since the job was last accessed.
    ///
    /// This is zero whenever anybody besides the cache holds the job.
    pub fn idle_time(&self) -> Duration {
        if self.ref_count() > 1 {
            return Duration::ZERO;
        }
        let last_accessed = self.state.lock().unwrap().last_accessed;
        Instant::now().saturating_duration_since(last_accessed)
    }

    pub fn paused_total(&self) -> Duration {
        self.state.lock().unwrap().paused_total(Instant::now())
    }

    /// An approximation of the memory held by this job.
    pub fn estimated_size(&self) -> usize {
        let state = self.state.lock().unwrap();
        let result = if state.finished_at.is_some() {
            state.outcome_size
        } else {
            self.progress.snapshot().retrieved * size_of::<Hit>()
        };
        size_of::<Self>() + result
    }

    /// Takes a scheduling snapshot of the job.
    pub fn worthiness(&self) -> Worthiness {
        self.worthiness_at(Instant::now())
    }

    pub(crate) fn worthiness_at(&self, now: Instant) -> Worthiness {
        let referenced = self.ref_count() > 1;
        let state = self.state.lock().unwrap();
        let finished = state.finished_at.is_some();
        let running = !finished && state.started_at.is_some() && state.paused_since.is_none();

        Worthiness {
            finished,
            idle_time: if referenced {
                Duration::ZERO
            } else {
                now.saturating_duration_since(state.last_accessed)
            },
            run_phase: running.then(|| now.saturating_duration_since(state.run_phase_since)),
            pause_phase: state
                .paused_since
                .filter(|_| !finished)
                .map(|since| now.saturating_duration_since(since)),
            execution_time: state.execution_time(now),
            is_count: self.kind().is_count(),
            policy: self.settings.policy,
        }
    }

    /// Changes the priority level of a running job.
    ///
    /// Returns `false` if the job is not running or already at that level.
    pub(crate) fn set_level(&self, level: PriorityLevel) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.finished_at.is_some() || state.started_at.is_none() || state.level == level {
            return false;
        }

        let now = Instant::now();
        if let Some(since) = state.paused_since.take() {
            state.paused_total += now.saturating_duration_since(since);
            state.run_phase_since = now;
        }
        if level == PriorityLevel::Paused {
            state.paused_since = Some(now);
        }
        state.level = level;
        self.level.send_replace(level);

        tracing::trace!(job = %self.id, ?level, "changed priority level");
        true
    }

    fn cancel_reason(&self) -> JobError {
        self.state
            .lock()
            .unwrap()
            .cancel_reason
            .clone()
            .unwrap_or(JobError::Cancelled)
    }

    /// Cancels the job if it is still unfinished.
    ///
    /// This is idempotent. References the job holds on its dependencies are released.
    pub fn cancel(&self) {
        self.cancel_with(JobError::Cancelled)
    }

    pub(crate) fn cancel_with(&self, reason: JobError) {
        {
            let mut state = self.state.lock().unwrap();
            if state.finished_at.is_some() || state.cancel_reason.is_some() {
                return;
            }
            state.cancel_reason = Some(reason.clone());
        }

        tracing::debug!(job = %self.id, %reason, "cancelling job");
        metric!(counter("jobs.cancelled") += 1, "kind" => self.kind().as_str());

        self.token.cancel();
        // nobody is going to run the job anymore, so it has to be finished here
        if !self.is_started() {
            self.finish(Err(reason));
        }
        self.release_dependencies();
    }

    /// Launches the background execution of the job.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub(crate) fn launch(self: &Arc<Self>, service: &SearchService) {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("job {} was started twice", self.id);
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.finished_at.is_some() {
                return;
            }
            let now = Instant::now();
            state.started_at = Some(now);
            state.run_phase_since = now;
        }

        tracing::debug!(job = %self.id, fingerprint = %self.fingerprint, "starting job");
        metric!(counter("jobs.started") += 1, "kind" => self.kind().as_str());

        let future = Arc::clone(self).run(service.clone());
        service
            .runtime()
            .spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Launches the job, and waits up to `max_wait` for it to finish.
    ///
    /// Returns whether the job finished in time. An elapsed wait is not an error, the job keeps
    /// running in the background. `None` waits until the job finishes.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub async fn start(
        self: &Arc<Self>,
        service: &SearchService,
        max_wait: Option<Duration>,
    ) -> bool {
        self.launch(service);
        self.wait_finished(max_wait).await
    }

    async fn run(self: Arc<Self>, service: SearchService) {
        let context = JobContext {
            service: &service,
            job: &self,
            control: self.control(),
        };
        let compute = AssertUnwindSafe(self.computation.compute(&context)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cancel_reason()),
            result = compute => match result {
                Ok(result) => result,
                Err(panic) => Err(JobError::from_panic(panic)),
            },
        };

        // a computation observing its cancellation fails with a generic error
        let outcome = match outcome {
            Err(_) if self.token.is_cancelled() => Err(self.cancel_reason()),
            outcome => outcome,
        };
        self.finish(outcome);
    }

    fn finish(&self, outcome: Result<JobOutput, JobError>) {
        let outcome_size = match &outcome {
            Ok(output) => output.estimated_size(),
            Err(_) => 0,
        };
        let execution_time = {
            let mut state = self.state.lock().unwrap();
            if state.finished_at.is_some() {
                return;
            }

            let now = Instant::now();
            if let Some(since) = state.paused_since.take() {
                state.paused_total += now.saturating_duration_since(since);
            }
            state.level = PriorityLevel::Running;
            state.finished_at = Some(now);
            state.outcome = Some(outcome.clone());
            state.outcome_size = outcome_size;
            self.level.send_replace(PriorityLevel::Running);
            state.execution_time(now)
        };

        let kind = self.kind().as_str();
        match &outcome {
            Ok(_) => {
                tracing::debug!(job = %self.id, ?execution_time, "job finished");
                metric!(counter("jobs.finished") += 1, "kind" => kind);
            }
            Err(error) => {
                tracing::debug!(job = %self.id, ?execution_time, %error, "job failed");
                metric!(counter("jobs.failed") += 1, "kind" => kind);
            }
        }
        metric!(timer("jobs.duration") = execution_time, "kind" => kind);

        self.finished.send_replace(true);
        self.release_dependencies();
    }

    fn release_dependencies(&self) {
        let dependencies = std::mem::take(&mut *self.waiting_for.lock().unwrap());
        // dropping outside of the lock, as releasing may cascade into the dependencies
        drop(dependencies);
    }

    fn release_dependency(&self, id: JobId) {
        let dependency = {
            let mut waiting_for = self.waiting_for.lock().unwrap();
            waiting_for
                .iter()
                .position(|handle| handle.id() == id)
                .map(|position| waiting_for.swap_remove(position))
        };
        drop(dependency);
    }

    /// Waits up to `max_wait` for the job to finish, returning whether it did.
    pub(crate) async fn wait_finished(&self, max_wait: Option<Duration>) -> bool {
        let mut finished = self.finished.subscribe();
        let wait = async move { finished.wait_for(|finished| *finished).await.is_ok() };
        match max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, wait)
                .await
                .unwrap_or(false),
            None => wait.await,
        }
    }

    /// Waits up to `max_wait` for the job to finish, and returns its result.
    ///
    /// Returns `Ok(None)` if the job is still running after `max_wait`, which is not an error.
    /// Once finished, the captured error of a failed job is returned.
    pub async fn wait_until_finished(
        &self,
        max_wait: Option<Duration>,
    ) -> Result<Option<JobOutput>, JobError> {
        if !self.wait_finished(max_wait).await {
            return Ok(None);
        }
        self.result().map(Some)
    }

    /// The outcome of the job, if it has finished.
    pub fn outcome(&self) -> Option<Result<JobOutput, JobError>> {
        self.state.lock().unwrap().outcome.clone()
    }

    fn result(&self) -> Result<JobOutput, JobError> {
        let state = self.state.lock().unwrap();
        match &state.outcome {
            Some(outcome) => outcome.clone(),
            None if state.finished_at.is_some() => {
                Err(JobError::InternalError("job results were released".into()))
            }
            None => Err(JobError::InternalError("job has not finished".into())),
        }
    }

    /// Registers `dependency` as a dependency of this job and waits for it to finish.
    ///
    /// The reference held by `dependency` is released once it finishes, when this job is
    /// cancelled, or when the waiting future is dropped, whichever happens first.
    ///
    /// A dependency that was interrupted rather than failing on its own fails this job with a
    /// retryable [`JobError::ServiceUnavailable`], as a fresh attempt will replace it.
    pub(crate) async fn wait_for(&self, dependency: JobHandle) -> Result<JobOutput, JobError> {
        let job = Arc::clone(dependency.job());
        let id = job.id();
        self.waiting_for.lock().unwrap().push(dependency);
        let _edge = defer(|| self.release_dependency(id));

        tracing::trace!(job = %self.id, dependency = %id, "waiting for dependency");
        job.wait_finished(None).await;
        job.result().map_err(|error| {
            if error.is_abort() {
                JobError::ServiceUnavailable(format!("dependency {id} was interrupted: {error}"))
            } else {
                error
            }
        })
    }

    pub(crate) fn control(&self) -> ExecutionControl {
        ExecutionControl::new(
            self.token.clone(),
            self.level.subscribe(),
            Arc::clone(&self.progress),
        )
    }

    pub(crate) fn check_again_after(&self) -> Duration {
        let advice = self.execution_time() / self.settings.check_again_divider;
        advice.max(self.settings.check_again_min)
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("refs", &self.ref_count())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// What a running computation gets to see.
pub(crate) struct JobContext<'a> {
    service: &'a SearchService,
    job: &'a Job,
    control: ExecutionControl,
}

impl JobContext<'_> {
    pub fn backend(&self) -> &dyn SearchBackend {
        self.service.backend()
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    /// Obtains the job for `params` and `kind`, and waits for its result.
    pub async fn dependency(
        &self,
        kind: JobKind,
        params: &SearchParameters,
    ) -> Result<JobOutput, JobError> {
        let dependency = self.service.obtain(params, kind)?;
        self.job.wait_for(dependency).await
    }
}
