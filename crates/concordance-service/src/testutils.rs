//! Backends and helpers for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::backend::{ExecutionControl, HitsQuery, SearchBackend};
use crate::config::Config;
use crate::error::JobError;
use crate::fingerprint::SearchParameters;
use crate::results::{Hit, Hits};
use crate::service::SearchService;

pub fn params(pattern: &str) -> SearchParameters {
    SearchParameters::new()
        .with("index", "poetry")
        .with("patt", pattern)
}

pub fn service(config: Config, backend: Arc<dyn SearchBackend>) -> SearchService {
    SearchService::new(config, backend, tokio::runtime::Handle::current())
}

/// Three hits for any pattern, two of them in the first document.
pub fn canned_hits(pattern: &str) -> Hits {
    let hit = |doc: usize, pid: &str, start: usize| Hit {
        doc,
        pid: pid.into(),
        start,
        end: start + 1,
        text: pattern.to_owned(),
    };
    Hits {
        hits: vec![hit(0, "a", 1), hit(0, "a", 7), hit(1, "b", 3)].into(),
        counted: 3,
        max_retrieve_exceeded: false,
        max_count_exceeded: false,
    }
}

/// A backend that holds all searches until it is opened, and counts them.
#[derive(Debug)]
pub struct GatedBackend {
    pub calls: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl GatedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: watch::Sender::new(false),
        })
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

impl SearchBackend for GatedBackend {
    fn find<'a>(
        &'a self,
        query: &'a HitsQuery,
        control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut gate = self.gate.subscribe();
            let open = gate.wait_for(|open| *open).await.is_ok();
            if !open {
                return Err(JobError::InternalError("gate was dropped".into()));
            }
            control.checkpoint().await?;
            let hits = canned_hits(&query.pattern);
            control.report_progress(hits.hits.len(), hits.counted);
            Ok(hits)
        }
        .boxed()
    }
}

/// A backend whose searches never finish.
#[derive(Debug)]
pub struct PendingBackend;

impl SearchBackend for PendingBackend {
    fn find<'a>(
        &'a self,
        _query: &'a HitsQuery,
        _control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>> {
        futures::future::pending().boxed()
    }
}

/// A backend that works in small steps forever, checking in with its control after each.
#[derive(Debug, Default)]
pub struct SteppingBackend {
    pub steps: AtomicUsize,
}

impl SearchBackend for SteppingBackend {
    fn find<'a>(
        &'a self,
        _query: &'a HitsQuery,
        control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>> {
        async move {
            loop {
                control.checkpoint().await?;
                let steps = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
                control.report_progress(0, steps);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        .boxed()
    }
}

/// A backend with a bug.
#[derive(Debug)]
pub struct PanickingBackend;

impl SearchBackend for PanickingBackend {
    fn find<'a>(
        &'a self,
        query: &'a HitsQuery,
        _control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>> {
        futures::future::lazy(move |_| -> Result<Hits, JobError> {
            panic!("cannot search for {}", query.pattern)
        })
        .boxed()
    }
}
