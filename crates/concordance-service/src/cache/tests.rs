use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::config::Config;
use crate::fingerprint::{JobKind, SearchParameters};
use crate::testutils::{GatedBackend, PendingBackend, SteppingBackend, params, service};

fn config(cache: CacheConfig) -> Config {
    Config {
        cache,
        ..Default::default()
    }
}

fn hits(pattern: &str) -> Fingerprint {
    Fingerprint::new(JobKind::Hits, &params(pattern))
}

#[tokio::test(start_paused = true)]
async fn test_least_worthy_is_evicted() {
    concordance_test::setup();
    let backend = GatedBackend::new();
    backend.open();
    let service = service(
        config(CacheConfig {
            max_entries: Some(1),
            ..Default::default()
        }),
        backend,
    );

    let a = service.submit(&params("a"), JobKind::Hits, true).await.unwrap();
    assert!(a.finished());
    drop(a);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(service.cache().len(), 1);

    let b = service.obtain(&params("b"), JobKind::Hits).unwrap();
    assert_eq!(service.cache().len(), 1);
    assert!(service.cache().lookup(&hits("a")).is_none());
    assert_eq!(service.cache().lookup(&hits("b")).unwrap().id(), b.id());
}

#[tokio::test(start_paused = true)]
async fn test_referenced_entries_are_evicted_last() {
    concordance_test::setup();
    let backend = GatedBackend::new();
    backend.open();
    let service = service(
        config(CacheConfig {
            max_entries: Some(2),
            ..Default::default()
        }),
        backend,
    );

    let a = service.submit(&params("a"), JobKind::Hits, true).await.unwrap();
    let b = service.submit(&params("b"), JobKind::Hits, true).await.unwrap();
    // both finished and accessed just now, but only `a` is still in use
    drop(b);

    let _c = service.obtain(&params("c"), JobKind::Hits).unwrap();
    assert_eq!(service.cache().len(), 2);
    assert!(service.cache().lookup(&hits("b")).is_none());
    assert_eq!(service.cache().lookup(&hits("a")).unwrap().id(), a.id());
    assert!(service.cache().lookup(&hits("c")).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_expire() {
    concordance_test::setup();
    let backend = GatedBackend::new();
    backend.open();
    let service = service(
        config(CacheConfig {
            max_age: Some(Duration::from_secs(5)),
            ..Default::default()
        }),
        backend,
    );

    let a = service.submit(&params("a"), JobKind::Hits, true).await.unwrap();
    let b = service.submit(&params("b"), JobKind::Hits, true).await.unwrap();
    drop(a);

    // picked up by the sweeper
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(service.cache().lookup(&hits("a")).is_none());
    // jobs in use are never idle
    assert_eq!(service.cache().lookup(&hits("b")).unwrap().id(), b.id());
}

#[tokio::test(start_paused = true)]
async fn test_hard_timeout_on_insert() {
    concordance_test::setup();
    let config = Config {
        cache: CacheConfig {
            max_job_time: Duration::from_secs(2),
            ..Default::default()
        },
        scheduling: SchedulingConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let service = service(config, Arc::new(PendingBackend));

    let runaway = service.obtain(&params("a"), JobKind::Hits).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!runaway.finished());
    assert_eq!(service.cache().len(), 1);

    let other = service.obtain(&params("b"), JobKind::Hits).unwrap();
    assert_eq!(
        runaway.wait(None).await,
        Err(JobError::HardTimeout(Duration::from_secs(2)))
    );
    assert!(service.cache().lookup(&hits("a")).is_none());
    assert!(!other.finished());
}

#[tokio::test(start_paused = true)]
async fn test_unfinished_jobs_in_use_are_kept() {
    concordance_test::setup();
    let service = service(
        config(CacheConfig {
            max_entries: Some(1),
            max_job_time: Duration::from_secs(2),
            ..Default::default()
        }),
        Arc::new(PendingBackend),
    );

    let a = service.obtain(&params("a"), JobKind::Hits).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let b = service.obtain(&params("b"), JobKind::Hits).unwrap();

    // over the bound, but both jobs are still in use
    assert_eq!(service.cache().len(), 2);
    let again = service.obtain(&params("a"), JobKind::Hits).unwrap();
    assert_eq!(again.id(), a.id());

    // the hard limit applies regardless
    let hard_timeout = Err(JobError::HardTimeout(Duration::from_secs(2)));
    assert_eq!(a.wait(Some(Duration::from_secs(5))).await, hard_timeout);
    assert_eq!(b.wait(Some(Duration::from_secs(5))).await, hard_timeout);
    assert!(service.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_cache_shrinks() {
    concordance_test::setup();
    let backend = GatedBackend::new();
    backend.open();
    let service = service(Config::default(), backend);

    let a = service.submit(&params("a"), JobKind::Hits, true).await.unwrap();
    let b = service.submit(&params("b"), JobKind::Hits, true).await.unwrap();
    service.cache().clear();

    let size_a = a.job().estimated_size();
    let size_b = b.job().estimated_size();
    let cache = SearchCache::new(
        CacheConfig {
            max_size_bytes: Some(size_a + size_b - 1),
            ..Default::default()
        },
        SchedulingConfig::default(),
    );

    cache.insert(&a);
    drop(a);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cache.status().size_bytes, size_a);

    cache.insert(&b);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.status().size_bytes, size_b);
    assert!(cache.lookup(&hits("a")).is_none());
    assert_eq!(cache.lookup(&hits("b")).unwrap().id(), b.id());
}

#[tokio::test(start_paused = true)]
async fn test_hard_timeout_behind_fitting_entries() {
    concordance_test::setup();
    let finishing = GatedBackend::new();
    finishing.open();
    let finishing = service(Config::default(), finishing);
    let pending = service(Config::default(), Arc::new(PendingBackend));

    let cache = SearchCache::new(
        CacheConfig {
            max_entries: Some(2),
            max_job_time: Duration::from_secs(2),
            ..Default::default()
        },
        SchedulingConfig::default(),
    );

    let done = finishing.submit(&params("done"), JobKind::Hits, true).await.unwrap();
    finishing.cache().clear();
    cache.insert(&done);
    drop(done);

    let runaway = pending.obtain(&params("runaway"), JobKind::Hits).unwrap();
    assert!(pending.cache().remove(runaway.fingerprint()));
    tokio::time::sleep(Duration::from_secs(3)).await;

    // the finished entry fits and ends the soft sweep, the runaway behind it is still caught
    cache.insert(&runaway);
    assert_eq!(
        runaway.wait(None).await,
        Err(JobError::HardTimeout(Duration::from_secs(2)))
    );
    assert_eq!(cache.len(), 1);
    assert!(cache.lookup(&hits("done")).is_some());
}

#[tokio::test]
#[should_panic(expected = "conflicts with cached job")]
async fn test_insert_conflict() {
    concordance_test::setup();
    let service = service(Config::default(), Arc::new(PendingBackend));
    let first = service.obtain(&params("a"), JobKind::Hits).unwrap();

    // a second cache sharing nothing but the job
    let cache = SearchCache::new(CacheConfig::default(), SchedulingConfig::default());
    cache.insert(&first);
    cache.insert(&first);
    assert_eq!(cache.len(), 1);

    service.cache().remove(first.fingerprint());
    let second = service.obtain(&params("a"), JobKind::Hits).unwrap();
    assert_ne!(first.id(), second.id());
    cache.insert(&second);
}

#[tokio::test]
async fn test_clear() {
    concordance_test::setup();
    let service = service(Config::default(), Arc::new(PendingBackend));

    let a = service.obtain(&params("a"), JobKind::Hits).unwrap();
    let b = service.obtain(&params("b"), JobKind::HitsTotal).unwrap();
    service.cache().clear();

    assert!(service.cache().is_empty());
    assert_eq!(a.wait(None).await, Err(JobError::Cancelled));
    assert_eq!(b.wait(None).await, Err(JobError::Cancelled));
}

#[tokio::test]
async fn test_clear_index() {
    concordance_test::setup();
    let service = service(Config::default(), Arc::new(PendingBackend));

    let prose = SearchParameters::new()
        .with("index", "prose")
        .with("patt", "a");
    let _a = service.obtain(&params("a"), JobKind::Hits).unwrap();
    let _b = service.obtain(&params("b"), JobKind::Hits).unwrap();
    let c = service.obtain(&prose, JobKind::Hits).unwrap();

    assert_eq!(service.cache().clear_index("poetry"), 2);
    assert_eq!(service.cache().len(), 1);
    assert_eq!(
        service
            .cache()
            .lookup(&Fingerprint::new(JobKind::Hits, &prose))
            .unwrap()
            .id(),
        c.id()
    );
    assert_eq!(service.cache().clear_index("poetry"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_load_management() {
    concordance_test::setup();
    let config = Config {
        scheduling: SchedulingConfig {
            max_running_jobs: Some(1),
            max_low_priority_jobs: 1,
            max_paused_jobs: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let service = service(config, Arc::new(SteppingBackend::default()));

    let handles: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|pattern| service.obtain(&params(pattern), JobKind::Hits).unwrap())
        .collect();

    let (rejected, kept): (Vec<_>, Vec<_>) = handles
        .iter()
        .partition(|handle| service.cache().lookup(handle.fingerprint()).is_none());
    assert_eq!(rejected.len(), 1);
    assert_eq!(service.cache().len(), 3);

    let err = rejected[0].wait(None).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(rejected[0].info().status, JobStatus::Cancelled);

    let count = |status| {
        kept.iter()
            .filter(|handle| handle.info().status == status)
            .count()
    };
    assert_eq!(count(JobStatus::Running), 1);
    assert_eq!(count(JobStatus::LowPriority), 1);
    assert_eq!(count(JobStatus::Paused), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status() {
    concordance_test::setup();
    let service = service(Config::default(), GatedBackend::new());

    let _a = service.obtain(&params("a"), JobKind::Hits).unwrap();
    let b = service.obtain(&params("b"), JobKind::Hits).unwrap();
    assert!(b.job().set_level(PriorityLevel::Paused));

    insta::assert_yaml_snapshot!(service.cache().status(), {
        ".size_bytes" => "[size]"
    }, @r###"
    ---
    entries: 2
    size_bytes: "[size]"
    max_entries: 20
    max_size_bytes: ~
    max_age: 1h
    max_job_time: 5m
    running: 1
    low_priority: 0
    paused: 1
    finished: 0
    failed: 0
    "###);

    let jobs = service.cache().jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[1].id, b.id());
    assert_eq!(jobs[1].status, JobStatus::Paused);
}
