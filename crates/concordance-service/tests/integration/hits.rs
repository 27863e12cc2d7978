use concordance_service::JobKind;
use concordance_service::results::{Hit, JobOutput};

use crate::{poetry, request, setup_service};

fn positions(hits: &[Hit]) -> Vec<(&str, usize)> {
    hits.iter().map(|hit| (&*hit.pid, hit.start)).collect()
}

#[tokio::test]
async fn test_hits() {
    let service = setup_service(|_| {});

    let hits = request(&service, &poetry("the"), JobKind::Hits)
        .await
        .into_hits()
        .unwrap();
    assert_eq!(
        positions(&hits.hits),
        [
            ("rime-01", 9),
            ("tyger-01", 5),
            ("tyger-01", 8),
            ("ozymandias-01", 12),
            ("ozymandias-01", 21),
            ("daffodils-01", 29),
            ("daffodils-01", 32),
        ]
    );
    assert_eq!(hits.counted, 7);
}

#[tokio::test]
async fn test_filtered_hits() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("filter", "author:blake");
    let hits = request(&service, &params, JobKind::Hits)
        .await
        .into_hits()
        .unwrap();
    assert_eq!(positions(&hits.hits), [("tyger-01", 5), ("tyger-01", 8)]);
}

#[tokio::test]
async fn test_sorted_hits() {
    let service = setup_service(|_| {});

    // a sort turns a plain search into a sorted one
    let params = poetry("the").with("sort", "-docid");
    let handle = service.submit(&params, JobKind::Hits, true).await.unwrap();
    assert_eq!(handle.kind(), JobKind::HitsSorted);

    let hits = handle.wait(None).await.unwrap().unwrap().into_hits().unwrap();
    // equal documents keep their order
    assert_eq!(
        positions(&hits.hits),
        [
            ("tyger-01", 5),
            ("tyger-01", 8),
            ("rime-01", 9),
            ("ozymandias-01", 12),
            ("ozymandias-01", 21),
            ("daffodils-01", 29),
            ("daffodils-01", 32),
        ]
    );
}

#[tokio::test]
async fn test_hits_window() {
    let service = setup_service(|_| {});

    let params = poetry("the")
        .with("sort", "-docid")
        .with("first", "2")
        .with("number", "2");
    let JobOutput::HitsWindow(window) = request(&service, &params, JobKind::HitsWindow).await
    else {
        panic!("expected a window of hits");
    };
    assert_eq!(window.first, 2);
    assert_eq!(window.requested, 2);
    assert_eq!(window.total, 7);
    assert!(window.has_next());
    assert_eq!(
        positions(&window.items),
        [("rime-01", 9), ("ozymandias-01", 12)]
    );

    let last = poetry("the").with("first", "6").with("number", "5");
    let JobOutput::HitsWindow(window) = request(&service, &last, JobKind::HitsWindow).await else {
        panic!("expected a window of hits");
    };
    assert_eq!(positions(&window.items), [("daffodils-01", 32)]);
    assert!(!window.has_next());
}

#[tokio::test]
async fn test_window_beyond_the_end_starts_over() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("first", "10").with("number", "3");
    let JobOutput::HitsWindow(window) = request(&service, &params, JobKind::HitsWindow).await
    else {
        panic!("expected a window of hits");
    };
    assert_eq!(window.first, 0);
    assert_eq!(
        positions(&window.items),
        [("rime-01", 9), ("tyger-01", 5), ("tyger-01", 8)]
    );
}

#[tokio::test]
async fn test_grouped_hits() {
    let service = setup_service(|_| {});

    let params = poetry("the *").with("group", "hit").with("sort", "identity");
    let JobOutput::HitGroups(groups) = request(&service, &params, JobKind::HitsGrouped).await
    else {
        panic!("expected groups of hits");
    };
    let identities: Vec<_> = groups.groups.iter().map(|g| g.identity.as_str()).collect();
    assert_eq!(
        identities,
        [
            "the decay",
            "the forests",
            "the lake",
            "the lone",
            "the night",
            "the trees",
            "the very",
        ]
    );

    let params = poetry("the").with("group", "docid").with("sort", "-size");
    let JobOutput::HitGroups(groups) = request(&service, &params, JobKind::HitsGrouped).await
    else {
        panic!("expected groups of hits");
    };
    let sizes: Vec<_> = groups
        .groups
        .iter()
        .map(|g| (g.identity.as_str(), g.items.len()))
        .collect();
    assert_eq!(
        sizes,
        [
            ("tyger-01", 2),
            ("ozymandias-01", 2),
            ("daffodils-01", 2),
            ("rime-01", 1),
        ]
    );
}
