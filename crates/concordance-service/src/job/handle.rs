use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::{Job, JobId, PriorityLevel};
use crate::backend::ProgressInfo;
use crate::error::JobError;
use crate::fingerprint::{Fingerprint, JobKind};
use crate::results::JobOutput;

/// A counted reference to a [`Job`].
///
/// Creating or cloning a handle acquires a reference on the job, dropping it releases that
/// reference again. A job whose last handle is dropped is cancelled if still unfinished.
pub struct JobHandle {
    job: Arc<Job>,
}

impl JobHandle {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        job.acquire();
        Self { job }
    }

    pub fn id(&self) -> JobId {
        self.job.id()
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.job.fingerprint()
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn finished(&self) -> bool {
        self.job.is_finished()
    }

    /// The captured error, if the job has failed.
    pub fn failed(&self) -> Option<JobError> {
        match self.job.outcome() {
            Some(Err(error)) => Some(error),
            _ => None,
        }
    }

    /// The result, if the job has finished successfully.
    pub fn output(&self) -> Option<JobOutput> {
        self.job.outcome().and_then(Result::ok)
    }

    pub fn execution_time(&self) -> Duration {
        self.job.execution_time()
    }

    pub fn idle_time(&self) -> Duration {
        self.job.idle_time()
    }

    /// Waits up to `max_wait` for the job, see [`Job::wait_until_finished`].
    pub async fn wait(&self, max_wait: Option<Duration>) -> Result<Option<JobOutput>, JobError> {
        self.job.wait_until_finished(max_wait).await
    }

    /// Advice for clients on how long to wait before polling an unfinished job again.
    pub fn check_again_after(&self) -> Duration {
        self.job.check_again_after()
    }

    pub fn info(&self) -> JobInfo {
        let job = &self.job;
        let status = match job.outcome() {
            Some(Ok(_)) => JobStatus::Finished,
            Some(Err(error)) if error.is_abort() => JobStatus::Cancelled,
            Some(Err(_)) => JobStatus::Failed,
            None if job.is_finished() => JobStatus::Finished,
            None => match job.level() {
                PriorityLevel::Running => JobStatus::Running,
                PriorityLevel::LowPriority => JobStatus::LowPriority,
                PriorityLevel::Paused => JobStatus::Paused,
            },
        };

        JobInfo {
            id: job.id(),
            kind: job.kind(),
            fingerprint: job.fingerprint().to_string(),
            status,
            execution_time: job.execution_time(),
            idle_time: job.idle_time(),
            paused_total: job.paused_total(),
            // not counting the cache
            users: job.ref_count().saturating_sub(1),
            waiting_for: job.waiting_for(),
            progress: job.progress().snapshot(),
        }
    }

    /// Explicitly gives up this reference.
    pub fn release(self) {
        drop(self)
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.job))
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.job.release();
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobHandle").field(&self.job).finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    LowPriority,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

/// A serializable summary of a job, for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: JobKind,
    pub fingerprint: String,
    pub status: JobStatus,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_time: Duration,
    #[serde(with = "humantime_serde")]
    pub paused_total: Duration,
    /// Number of users of the job, besides the cache.
    pub users: usize,
    pub waiting_for: Vec<JobId>,
    pub progress: ProgressInfo,
}
