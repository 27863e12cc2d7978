use concordance_service::results::{DocResult, JobOutput, Total};
use concordance_service::{JobError, JobKind};

use crate::{poetry, request, setup_service};

fn doc_hits(docs: &[DocResult]) -> Vec<(&str, usize)> {
    docs.iter().map(|doc| (&*doc.pid, doc.hits.len())).collect()
}

#[tokio::test]
async fn test_docs() {
    let service = setup_service(|_| {});

    let docs = request(&service, &poetry("and"), JobKind::Docs)
        .await
        .into_docs()
        .unwrap();
    assert_eq!(
        doc_hits(&docs.docs),
        [("rime-01", 1), ("ozymandias-01", 3), ("daffodils-01", 1)]
    );
    assert_eq!(docs.hits_counted, 5);
    assert_eq!(docs.docs[1].hits[2].start, 23);
}

#[tokio::test]
async fn test_sorted_docs() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("sort", "-numhits");
    let docs = request(&service, &params, JobKind::DocsSorted)
        .await
        .into_docs()
        .unwrap();
    assert_eq!(
        doc_hits(&docs.docs),
        [
            ("tyger-01", 2),
            ("ozymandias-01", 2),
            ("daffodils-01", 2),
            ("rime-01", 1),
        ]
    );

    // sorting documents by a hit property is a request error
    let err = service
        .obtain(&poetry("the").with("sort", "hit"), JobKind::DocsSorted)
        .unwrap_err();
    assert!(matches!(
        err,
        JobError::BadRequest {
            code: "UNKNOWN_SORT_PROPERTY",
            ..
        }
    ));
}

#[tokio::test]
async fn test_docs_window() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("first", "1").with("number", "2");
    let JobOutput::DocsWindow(window) = request(&service, &params, JobKind::DocsWindow).await
    else {
        panic!("expected a window of documents");
    };
    assert_eq!(window.total, 4);
    assert!(window.has_next());
    assert_eq!(
        doc_hits(&window.items),
        [("tyger-01", 2), ("ozymandias-01", 2)]
    );
}

#[tokio::test]
async fn test_grouped_docs() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("group", "numhits").with("sort", "-size");
    let JobOutput::DocGroups(groups) = request(&service, &params, JobKind::DocsGrouped).await
    else {
        panic!("expected groups of documents");
    };
    let groups: Vec<_> = groups
        .groups
        .iter()
        .map(|group| {
            let pids: Vec<_> = group.items.iter().map(|doc| &*doc.pid).collect();
            (group.identity.as_str(), pids)
        })
        .collect();
    assert_eq!(
        groups,
        [
            ("2", vec!["tyger-01", "ozymandias-01", "daffodils-01"]),
            ("1", vec!["rime-01"]),
        ]
    );
}

#[tokio::test]
async fn test_totals() {
    let service = setup_service(|_| {});

    let total = request(&service, &poetry("the"), JobKind::HitsTotal).await;
    insta::assert_yaml_snapshot!(total, @r###"
    ---
    type: total
    hits: 7
    docs: 4
    max_count_exceeded: false
    "###);

    let total = request(&service, &poetry("and"), JobKind::DocsTotal)
        .await
        .into_total()
        .unwrap();
    assert_eq!(
        total,
        Total {
            hits: 5,
            docs: 3,
            max_count_exceeded: false
        }
    );
}

#[tokio::test]
async fn test_limited_totals() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("maxcount", "3");
    let total = request(&service, &params, JobKind::HitsTotal)
        .await
        .into_total()
        .unwrap();
    assert_eq!(
        total,
        Total {
            hits: 3,
            docs: 2,
            max_count_exceeded: true
        }
    );
}

#[tokio::test]
async fn test_empty_index() {
    let service = setup_service(|_| {});

    let params = poetry("the").with("index", "empty");
    let total = request(&service, &params, JobKind::DocsTotal)
        .await
        .into_total()
        .unwrap();
    assert_eq!(total, Total::default());
}
