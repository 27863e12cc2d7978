//! The job cache.
//!
//! The cache maps [`Fingerprint`]s to jobs, making sure that at most one job per fingerprint is
//! ever active or cached. Every cached job is held through a [`JobHandle`], so the cache is one
//! of the users of each of its jobs.
//!
//! After every insert, and periodically from the service sweeper, the cache runs an eviction
//! pass: jobs exceeding the hard execution time limit are cancelled, and the least worthy jobs
//! are evicted for as long as the soft bounds are exceeded. Unfinished jobs that somebody holds
//! on to are never evicted by the soft bounds. When a limit on the number of running jobs is
//! configured, the pass also assigns priority levels to the unfinished jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{CacheConfig, SchedulingConfig};
use crate::error::JobError;
use crate::fingerprint::Fingerprint;
use crate::job::{Job, JobHandle, JobInfo, JobStatus, PriorityLevel, Worthiness};

/// Why an entry was removed from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EvictionReason {
    HardTimeout,
    Aborted,
    TooOld,
    TooMany,
    TooBig,
    Overloaded,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            EvictionReason::HardTimeout => "hard_timeout",
            EvictionReason::Aborted => "aborted",
            EvictionReason::TooOld => "too_old",
            EvictionReason::TooMany => "too_many",
            EvictionReason::TooBig => "too_big",
            EvictionReason::Overloaded => "overloaded",
        }
    }
}

/// A snapshot of a cache entry taken at the start of an eviction pass.
struct Candidate {
    fingerprint: Fingerprint,
    job: Arc<Job>,
    worthiness: Worthiness,
    referenced: bool,
    size: usize,
}

/// The removals and cancellations decided by a sweep, applied once the cache lock is released.
#[derive(Default)]
struct Sweep {
    removed: Vec<(JobHandle, EvictionReason)>,
    cancelled: Vec<(Arc<Job>, JobError)>,
}

/// Summary of the cache contents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_entries: Option<usize>,
    pub max_size_bytes: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_job_time: Duration,
    pub running: usize,
    pub low_priority: usize,
    pub paused: usize,
    pub finished: usize,
    pub failed: usize,
}

pub struct SearchCache {
    config: CacheConfig,
    scheduling: SchedulingConfig,
    entries: Mutex<HashMap<Fingerprint, JobHandle>>,
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl SearchCache {
    pub fn new(config: CacheConfig, scheduling: SchedulingConfig) -> Self {
        Self {
            config,
            scheduling,
            entries: Default::default(),
        }
    }

    /// Looks up the job for `fingerprint`, refreshing its time of last access.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<JobHandle> {
        let entries = self.entries.lock().unwrap();
        let handle = entries.get(fingerprint)?;
        handle.job().touch();
        Some(handle.clone())
    }

    /// Stores a job, and runs an eviction pass.
    ///
    /// Inserting a job that is already stored is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if a different job is already stored under the same fingerprint.
    pub fn insert(&self, handle: &JobHandle) {
        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(handle.fingerprint()) {
                Some(existing) if existing.id() == handle.id() => return,
                Some(existing) => panic!(
                    "job {} conflicts with cached job {} for {}",
                    handle.id(),
                    existing.id(),
                    handle.fingerprint()
                ),
                None => {
                    entries.insert(handle.fingerprint().clone(), handle.clone());
                }
            }
        }
        self.sweep();
    }

    /// Looks up the job for `fingerprint`, or stores the job created by `create`.
    ///
    /// `create` gets the number of unfinished jobs in the cache, and may refuse to create a job.
    /// Jobs that were aborted are never handed out, they are replaced by a new job instead.
    /// Returns whether the job was created. The caller is responsible for launching it, and for
    /// running an eviction pass afterwards.
    pub(crate) fn lookup_or_insert_with<F>(
        &self,
        fingerprint: &Fingerprint,
        create: F,
    ) -> Result<(JobHandle, bool), JobError>
    where
        F: FnOnce(&Fingerprint, usize) -> Result<Arc<Job>, JobError>,
    {
        let mut entries = self.entries.lock().unwrap();
        let replaced = match entries.get(fingerprint) {
            Some(existing) if !existing.job().is_aborted() => {
                existing.job().touch();
                return Ok((existing.clone(), false));
            }
            Some(_) => entries.remove(fingerprint),
            None => None,
        };

        let unfinished = entries.values().filter(|handle| !handle.finished()).count();
        let job = create(fingerprint, unfinished)?;
        let handle = JobHandle::new(job);
        entries.insert(fingerprint.clone(), handle.clone());
        drop(entries);

        if let Some(replaced) = replaced {
            tracing::debug!(job = %replaced.id(), "replaced aborted job");
        }
        Ok((handle, true))
    }

    /// Removes the job for `fingerprint`, returning whether there was one.
    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.entries.lock().unwrap().remove(fingerprint);
        removed.is_some()
    }

    /// Cancels and removes all jobs.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.entries.lock().unwrap());
        tracing::debug!(entries = removed.len(), "cleared cache");
        for handle in removed.values() {
            handle.job().cancel();
        }
    }

    /// Removes all jobs searching the index `name`, returning how many were removed.
    pub fn clear_index(&self, name: &str) -> usize {
        let removed: Vec<JobHandle> = {
            let mut entries = self.entries.lock().unwrap();
            let keys: Vec<Fingerprint> = entries
                .keys()
                .filter(|fingerprint| fingerprint.index() == Some(name))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        tracing::debug!(index = name, entries = removed.len(), "cleared index from cache");
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> CacheStatus {
        let entries = self.entries.lock().unwrap();
        let mut status = CacheStatus {
            entries: entries.len(),
            max_entries: self.config.max_entries,
            max_size_bytes: self.config.max_size_bytes,
            max_age: self.config.max_age,
            max_job_time: self.config.max_job_time,
            ..Default::default()
        };

        for handle in entries.values() {
            status.size_bytes += handle.job().estimated_size();
            match handle.info().status {
                JobStatus::Running => status.running += 1,
                JobStatus::LowPriority => status.low_priority += 1,
                JobStatus::Paused => status.paused += 1,
                JobStatus::Finished => status.finished += 1,
                JobStatus::Failed | JobStatus::Cancelled => status.failed += 1,
            }
        }
        status
    }

    /// Summaries of all cached jobs, ordered by job id.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let entries = self.entries.lock().unwrap();
        let mut jobs: Vec<JobInfo> = entries.values().map(JobHandle::info).collect();
        jobs.sort_by_key(|info| info.id);
        jobs
    }

    /// Runs an eviction pass, followed by a load management pass.
    ///
    /// Both passes work on the same snapshot of the entries, taken under a single lock.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut sweep = Sweep::default();
        {
            let mut entries = self.entries.lock().unwrap();
            let candidates = self.candidates(&entries, now);
            let remaining = self.evict(&mut entries, candidates, &mut sweep);
            self.manage_load(&mut entries, remaining, &mut sweep);
        }

        for (job, reason) in sweep.cancelled {
            if let JobError::HardTimeout(_) = reason {
                tracing::warn!(
                    job = %job.id(),
                    fingerprint = %job.fingerprint(),
                    "job exceeded the maximum execution time"
                );
                metric!(counter("jobs.hard_timeout") += 1, "kind" => job.kind().as_str());
            }
            job.cancel_with(reason);
        }

        for (handle, reason) in &sweep.removed {
            tracing::debug!(
                job = %handle.id(),
                reason = reason.as_str(),
                "evicted job from cache"
            );
            metric!(counter("cache.evicted") += 1, "reason" => reason.as_str());
        }
        // dropping outside of the lock, as this may cancel jobs
        drop(sweep.removed);
    }

    fn candidates(&self, entries: &HashMap<Fingerprint, JobHandle>, now: Instant) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = entries
            .iter()
            .map(|(fingerprint, handle)| {
                let job = Arc::clone(handle.job());
                Candidate {
                    fingerprint: fingerprint.clone(),
                    worthiness: job.worthiness_at(now),
                    referenced: job.ref_count() > 1,
                    size: job.estimated_size(),
                    job,
                }
            })
            .collect();

        // least worthy first, and unreferenced before referenced among equals
        candidates.sort_by(|a, b| {
            a.worthiness
                .cmp(&b.worthiness)
                .then(a.referenced.cmp(&b.referenced))
        });
        candidates
    }

    /// Removes runaway, aborted and excess entries, returning the candidates that remain.
    fn evict(
        &self,
        entries: &mut HashMap<Fingerprint, JobHandle>,
        candidates: Vec<Candidate>,
        sweep: &mut Sweep,
    ) -> Vec<Candidate> {
        let max_job_time = self.config.max_job_time;
        let mut count = candidates.len();
        let mut size: usize = candidates.iter().map(|c| c.size).sum();
        let mut sweeping = true;
        let mut remaining = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let w = &candidate.worthiness;
            let reason = if !w.finished && w.execution_time > max_job_time {
                sweep.cancelled.push((
                    Arc::clone(&candidate.job),
                    JobError::HardTimeout(max_job_time),
                ));
                Some(EvictionReason::HardTimeout)
            } else if candidate.job.is_aborted() {
                Some(EvictionReason::Aborted)
            } else if sweeping && !w.finished && candidate.referenced {
                // someone still waits for it, a lookup must keep finding this job
                None
            } else if sweeping {
                let too_old = self.config.max_age.is_some_and(|max| w.idle_time > max);
                let too_many = self.config.max_entries.is_some_and(|max| count > max);
                let too_big = self.config.max_size_bytes.is_some_and(|max| size > max);

                if too_old {
                    Some(EvictionReason::TooOld)
                } else if too_many {
                    Some(EvictionReason::TooMany)
                } else if too_big {
                    Some(EvictionReason::TooBig)
                } else {
                    // everything from here on is worthier and assumed to fit
                    sweeping = false;
                    None
                }
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    if let Some(handle) = entries.remove(&candidate.fingerprint) {
                        count -= 1;
                        size = size.saturating_sub(candidate.size);
                        sweep.removed.push((handle, reason));
                    }
                }
                None => remaining.push(candidate),
            }
        }

        metric!(gauge("cache.entries") = count as u64);
        metric!(gauge("cache.size_bytes") = size as u64);
        remaining
    }

    /// Assigns priority levels to the unfinished jobs, worthiest first.
    ///
    /// Only does anything when the number of running jobs is limited. Jobs that fit in neither
    /// of the levels are aborted and removed.
    fn manage_load(
        &self,
        entries: &mut HashMap<Fingerprint, JobHandle>,
        candidates: Vec<Candidate>,
        sweep: &mut Sweep,
    ) {
        let Some(max_running) = self.scheduling.max_running_jobs else {
            return;
        };
        let max_low_priority = max_running + self.scheduling.max_low_priority_jobs;
        let max_paused = max_low_priority + self.scheduling.max_paused_jobs;

        let active = candidates
            .into_iter()
            .rev()
            .filter(|c| c.job.is_started() && !c.job.is_finished() && !c.job.is_waiting());

        for (position, candidate) in active.enumerate() {
            let level = if position < max_running {
                PriorityLevel::Running
            } else if position < max_low_priority {
                PriorityLevel::LowPriority
            } else if position < max_paused {
                PriorityLevel::Paused
            } else {
                if let Some(handle) = entries.remove(&candidate.fingerprint) {
                    sweep.removed.push((handle, EvictionReason::Overloaded));
                }
                sweep.cancelled.push((
                    candidate.job,
                    JobError::ServiceUnavailable("server under heavy load".into()),
                ));
                continue;
            };
            candidate.job.set_level(level);
        }

        let mut running = 0u64;
        let mut paused = 0u64;
        for handle in entries.values() {
            match handle.job().level() {
                PriorityLevel::Paused => paused += 1,
                _ if !handle.finished() => running += 1,
                _ => {}
            }
        }
        metric!(gauge("jobs.active") = running);
        metric!(gauge("jobs.paused") = paused);
    }
}

#[cfg(test)]
mod tests;
