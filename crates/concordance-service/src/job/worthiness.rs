//! The ordering deciding which jobs keep running and which get evicted.
//!
//! Jobs are ranked by how much it is worth keeping them: an unfinished job is always worthier
//! than a finished one, and among finished jobs the most recently accessed ones are kept.
//! Among unfinished jobs, jobs whose priority level changed recently are protected from being
//! switched again immediately, young jobs get a fair chance before older, heavier jobs, and
//! counting is considered less valuable than searching.
//!
//! The ranking is evaluated on a [`Worthiness`] snapshot, so that a whole set of jobs can be
//! sorted against one consistent point in time.
//!
//! Unfinished jobs fall into tiers that are compared before anything else. A job paused within
//! the anti-thrash window ranks above every settled job, including settled jobs that have been
//! paused for longer. Comparing pause durations across that boundary would make the order
//! intransitive, which sorting cannot cope with, so the tier wins.

use std::cmp::Ordering;
use std::time::Duration;

/// Thresholds of the worthiness ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulingPolicy {
    /// Execution time below which a job counts as young.
    pub youth_threshold: Duration,
    /// A job resumed or paused within this window is not switched again.
    pub anti_thrash_window: Duration,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            youth_threshold: Duration::from_secs(20),
            anti_thrash_window: Duration::from_secs(5),
        }
    }
}

/// A point-in-time view of the scheduling relevant state of a job.
///
/// Ordering is by worthiness: [`Ordering::Greater`] means more worthy.
#[derive(Clone, Copy, Debug)]
pub struct Worthiness {
    pub finished: bool,
    /// Time since the job was last accessed, zero while anybody besides the cache holds it.
    pub idle_time: Duration,
    /// Time since the job last started or resumed running, if it is running now.
    pub run_phase: Option<Duration>,
    /// Time since the job was paused, if it is paused now.
    pub pause_phase: Option<Duration>,
    /// Time spent executing, not counting pauses.
    pub execution_time: Duration,
    /// Whether the job only counts.
    pub is_count: bool,
    pub policy: SchedulingPolicy,
}

/// Classes of jobs, in increasing worthiness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Finished,
    Settled,
    JustPaused,
    JustResumed,
}

impl Worthiness {
    fn tier(&self) -> Tier {
        let window = self.policy.anti_thrash_window;
        if self.finished {
            Tier::Finished
        } else if self.run_phase.is_some_and(|d| d < window) {
            Tier::JustResumed
        } else if self.pause_phase.is_some_and(|d| d < window) {
            Tier::JustPaused
        } else {
            Tier::Settled
        }
    }

    fn is_young(&self) -> bool {
        self.execution_time < self.policy.youth_threshold
    }
}

impl Ord for Worthiness {
    fn cmp(&self, other: &Self) -> Ordering {
        let tier = self.tier();
        let other_tier = other.tier();
        if tier != other_tier {
            return tier.cmp(&other_tier);
        }

        match tier {
            // least recently used goes first
            Tier::Finished => other.idle_time.cmp(&self.idle_time),
            // the most recently resumed stays
            Tier::JustResumed => other.run_phase.cmp(&self.run_phase),
            // the longest paused is due for resumption
            Tier::JustPaused => self.pause_phase.cmp(&other.pause_phase),
            Tier::Settled => match (self.is_young(), other.is_young()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                // don't abandon what we already invested in
                (true, true) => self.execution_time.cmp(&other.execution_time),
                (false, false) => other
                    .is_count
                    .cmp(&self.is_count)
                    .then_with(|| other.execution_time.cmp(&self.execution_time)),
            },
        }
    }
}

impl PartialOrd for Worthiness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Worthiness {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Worthiness {}
