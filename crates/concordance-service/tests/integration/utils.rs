use std::sync::Arc;

use concordance_service::config::Config;
use concordance_service::results::JobOutput;
use concordance_service::{JobKind, MemoryBackend, SearchParameters, SearchService};
use concordance_test as test;

/// Setup tests and create a search service over the poetry corpus fixture.
///
/// The service is configured with the defaults, which can be adjusted using the
/// `update_config` closure.
pub fn setup_service(update_config: impl FnOnce(&mut Config)) -> SearchService {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let backend = MemoryBackend::from_path(&test::fixture("corpus.yml")).unwrap();
    SearchService::new(config, Arc::new(backend), tokio::runtime::Handle::current())
}

/// Parameters searching the poetry index for `pattern`.
pub fn poetry(pattern: &str) -> SearchParameters {
    SearchParameters::new()
        .with("index", "poetry")
        .with("patt", pattern)
}

/// Runs a blocking request and returns its output.
pub async fn request(
    service: &SearchService,
    params: &SearchParameters,
    kind: JobKind,
) -> JobOutput {
    let handle = service.submit(params, kind, true).await.unwrap();
    assert!(handle.finished());
    handle.wait(None).await.unwrap().unwrap()
}
