//! The seam towards the search engine.
//!
//! The scheduler treats the engine as a black box: a [`SearchBackend`] is handed a
//! [`HitsQuery`] and returns [`Hits`]. While it works, it is expected to call
//! [`ExecutionControl::checkpoint`] regularly, which is where cooperative priority levels and
//! cancellation take effect, and to report its progress.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::fingerprint::{SearchParameters, keys};
use crate::job::PriorityLevel;
use crate::results::Hits;

mod memory;

pub use memory::{CorpusFile, Document, MemoryBackend};

/// A search for all matches of a pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitsQuery {
    pub index: String,
    pub pattern: String,
    pub filter: Option<String>,
    pub doc_pid: Option<String>,
    /// Maximum number of hits to retrieve.
    pub max_retrieve: Option<usize>,
    /// Maximum number of hits to count.
    pub max_count: Option<usize>,
}

impl HitsQuery {
    pub fn from_params(params: &SearchParameters) -> Result<Self, JobError> {
        let index = params.require(keys::INDEX)?.to_owned();
        let pattern = params.require(keys::PATTERN)?.to_owned();
        let max_retrieve = params.get_usize(keys::MAX_RETRIEVE)?;
        let max_count = params.get_usize(keys::MAX_COUNT)?;

        Ok(Self {
            index,
            pattern,
            filter: params.get(keys::FILTER).map(str::to_owned),
            doc_pid: params.get(keys::DOC_PID).map(str::to_owned),
            max_retrieve,
            max_count,
        })
    }
}

/// Executes searches on behalf of jobs.
pub trait SearchBackend: Send + Sync + 'static {
    /// Finds all matches for the `query`.
    ///
    /// Implementations must call [`ExecutionControl::checkpoint`] between units of work and
    /// return its error when it fails.
    fn find<'a>(
        &'a self,
        query: &'a HitsQuery,
        control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>>;
}

/// Progress counters of a running job.
#[derive(Debug, Default)]
pub struct Progress {
    retrieved: AtomicUsize,
    counted: AtomicUsize,
}

impl Progress {
    pub fn snapshot(&self) -> ProgressInfo {
        ProgressInfo {
            retrieved: self.retrieved.load(Ordering::Relaxed),
            counted: self.counted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    /// Number of items retrieved so far.
    pub retrieved: usize,
    /// Number of items counted so far.
    pub counted: usize,
}

/// The handle through which a computation observes its job's scheduling state.
#[derive(Clone, Debug)]
pub struct ExecutionControl {
    token: CancellationToken,
    level: watch::Receiver<PriorityLevel>,
    progress: Arc<Progress>,
}

impl ExecutionControl {
    pub(crate) fn new(
        token: CancellationToken,
        level: watch::Receiver<PriorityLevel>,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            token,
            level,
            progress,
        }
    }

    /// A control that is not attached to any job, and can only be cancelled through the
    /// returned token.
    pub fn detached() -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        let (_, level) = watch::channel(PriorityLevel::Running);
        let control = Self::new(token.clone(), level, Default::default());
        (control, token)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Applies the job's current priority level.
    ///
    /// Returns immediately when running, yields to other tasks at low priority, and waits
    /// for the job to be resumed when paused. Fails with [`JobError::Cancelled`] once the job
    /// is cancelled.
    pub async fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let mut level = self.level.clone();
        let current = *level.borrow_and_update();
        match current {
            PriorityLevel::Running => {}
            PriorityLevel::LowPriority => tokio::task::yield_now().await,
            PriorityLevel::Paused => {
                while *level.borrow_and_update() == PriorityLevel::Paused {
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(JobError::Cancelled),
                        changed = level.changed() => {
                            // the job is gone, nobody is going to resume us
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if self.token.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    pub fn report_progress(&self, retrieved: usize, counted: usize) {
        self.progress.retrieved.store(retrieved, Ordering::Relaxed);
        self.progress.counted.store(counted, Ordering::Relaxed);
    }

    pub fn progress(&self) -> ProgressInfo {
        self.progress.snapshot()
    }
}
