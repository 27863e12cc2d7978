use std::time::Duration;

use concordance_service::{Fingerprint, JobError, JobKind, JobStatus};

use crate::{poetry, request, setup_service};

#[tokio::test]
async fn test_pages_share_one_search() {
    let service = setup_service(|_| {});

    for first in ["0", "2", "4"] {
        let params = poetry("the").with("first", first).with("number", "2");
        request(&service, &params, JobKind::HitsWindow).await;
    }
    request(&service, &poetry("the").with("first", "4"), JobKind::HitsTotal).await;

    let kinds: Vec<_> = service.cache().jobs().iter().map(|job| job.kind).collect();
    assert_eq!(
        kinds,
        [
            JobKind::HitsWindow,
            JobKind::Hits,
            JobKind::HitsWindow,
            JobKind::HitsWindow,
            JobKind::HitsTotal,
        ]
    );
    assert!(
        service
            .cache()
            .jobs()
            .iter()
            .all(|job| job.status == JobStatus::Finished)
    );
}

#[tokio::test]
async fn test_results_are_served_from_the_cache() {
    let service = setup_service(|_| {});

    let first = service
        .submit(&poetry("the"), JobKind::HitsTotal, true)
        .await
        .unwrap();
    // the window and number are not relevant to a total
    let params = poetry("the").with("first", "3").with("number", "1");
    let second = service
        .submit(&params, JobKind::HitsTotal, false)
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert!(second.finished());
    assert_eq!(first.output(), second.output());
}

#[tokio::test]
async fn test_missing_index() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("index", "prose");
    let handle = service.submit(&params, JobKind::Hits, true).await.unwrap();
    let err = handle.wait(None).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::BadRequest {
            code: "INDEX_NOT_FOUND",
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(handle.info().status, JobStatus::Failed);

    // failures are results too, and are served like any other
    let again = service.obtain(&params, JobKind::Hits).unwrap();
    assert_eq!(again.id(), handle.id());
    assert_eq!(again.failed(), Some(err));
}

#[tokio::test]
async fn test_clear_index() {
    let service = setup_service(|_| {});

    request(&service, &poetry("the"), JobKind::DocsTotal).await;
    request(&service, &poetry("the").with("index", "empty"), JobKind::Hits).await;
    assert_eq!(service.cache().len(), 4);

    assert_eq!(service.cache().clear_index("poetry"), 3);
    let fingerprint = Fingerprint::new(JobKind::Hits, &poetry("the"));
    assert!(service.cache().lookup(&fingerprint).is_none());
    assert_eq!(service.cache().len(), 1);
}

#[tokio::test]
async fn test_quick_answers() {
    let service = setup_service(|config| {
        config.scheduling.quick_answer_wait = Duration::from_secs(5);
    });

    let handle = service
        .submit(&poetry("the"), JobKind::DocsGrouped, false)
        .await;
    // grouping without a property is rejected before any waiting
    assert!(matches!(
        handle,
        Err(JobError::BadRequest {
            code: "MISSING_PARAMETER",
            ..
        })
    ));

    let params = poetry("the").with("group", "docid");
    let handle = service
        .submit(&params, JobKind::DocsGrouped, false)
        .await
        .unwrap();
    assert!(handle.finished());
    assert!(handle.output().is_some());
}
