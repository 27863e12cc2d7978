//! The dispatcher turning search requests into (shared) jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use sentry::{Hub, SentryFutureExt};
use tokio::time::MissedTickBehavior;

use crate::backend::SearchBackend;
use crate::cache::SearchCache;
use crate::computations::Computation;
use crate::config::Config;
use crate::error::JobError;
use crate::fingerprint::{Fingerprint, JobKind, SearchParameters};
use crate::job::{Job, JobHandle, JobId, JobSettings};

/// The entry point of the search scheduler.
///
/// Requests are projected onto the parameters relevant for their job kind, so that requests
/// differing only in irrelevant parameters share one job through the [`SearchCache`].
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<SearchServiceInner>,
}

struct SearchServiceInner {
    config: Config,
    settings: JobSettings,
    runtime: tokio::runtime::Handle,
    backend: Arc<dyn SearchBackend>,
    cache: SearchCache,
    next_id: AtomicU64,
}

impl SearchService {
    /// Creates a new [`SearchService`] running its jobs on `runtime`.
    ///
    /// This also spawns the background sweeper enforcing the cache bounds, which stops once the
    /// last clone of the service is dropped.
    pub fn new(
        config: Config,
        backend: Arc<dyn SearchBackend>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let inner = SearchServiceInner {
            settings: JobSettings::from_config(&config),
            cache: SearchCache::new(config.cache, config.scheduling),
            runtime: runtime.clone(),
            backend,
            next_id: AtomicU64::new(1),
            config,
        };
        let inner = Arc::new(inner);

        let sweeper = sweep_periodically(Arc::downgrade(&inner));
        runtime.spawn(sweeper.bind_hub(Hub::new_from_top(Hub::current())));

        Self { inner }
    }

    /// Gives access to the [`Config`].
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &SearchCache {
        &self.inner.cache
    }

    pub(crate) fn backend(&self) -> &dyn SearchBackend {
        &*self.inner.backend
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.inner.runtime
    }

    /// Gets the job for `params` and `kind` from the cache, or creates and launches it.
    ///
    /// Request errors are returned right away, without creating a job. When the number of
    /// unfinished jobs is limited and reached, new jobs are rejected with a retryable error.
    pub fn obtain(&self, params: &SearchParameters, kind: JobKind) -> Result<JobHandle, JobError> {
        let kind = kind.resolve(params);
        let fingerprint = Fingerprint::new(kind, params);

        let (handle, created) = self
            .inner
            .cache
            .lookup_or_insert_with(&fingerprint, |fingerprint, unfinished| {
                self.create_job(fingerprint, unfinished)
            })?;

        if created {
            handle.job().launch(self);
            self.inner.cache.sweep();
        } else {
            tracing::trace!(job = %handle.id(), %fingerprint, "found job in cache");
            metric!(counter("jobs.cache_hit") += 1, "kind" => kind.as_str());
        }

        Ok(handle)
    }

    fn create_job(&self, fingerprint: &Fingerprint, unfinished: usize) -> Result<Arc<Job>, JobError> {
        let kind = fingerprint.kind();
        if let Some(max_jobs) = self.inner.config.scheduling.max_concurrent_jobs {
            if unfinished >= max_jobs {
                metric!(counter("jobs.rejected") += 1, "kind" => kind.as_str());
                return Err(JobError::ServiceUnavailable(
                    "maximum number of concurrent jobs reached".into(),
                ));
            }
        }

        let computation = Computation::construct(kind, fingerprint.params())?;
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        tracing::trace!(job = %id, %fingerprint, "created job");
        metric!(counter("jobs.created") += 1, "kind" => kind.as_str());

        Ok(Job::new(
            id,
            fingerprint.clone(),
            computation,
            self.inner.settings,
        ))
    }

    /// Submits a search request.
    ///
    /// When `blocking`, waits for the job to finish. Otherwise waits for the configured quick
    /// answer window only, after which the returned job may still be running.
    pub async fn submit(
        &self,
        params: &SearchParameters,
        kind: JobKind,
        blocking: bool,
    ) -> Result<JobHandle, JobError> {
        let handle = self.obtain(params, kind)?;
        let max_wait = (!blocking).then_some(self.inner.config.scheduling.quick_answer_wait);
        handle.job().wait_finished(max_wait).await;
        Ok(handle)
    }
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

async fn sweep_periodically(inner: Weak<SearchServiceInner>) {
    let Some(poll_interval) = inner
        .upgrade()
        .map(|inner| inner.config.scheduling.poll_interval)
    else {
        return;
    };

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            tracing::debug!("search service is gone, stopping the sweeper");
            break;
        };
        inner.cache.sweep();
    }
}
