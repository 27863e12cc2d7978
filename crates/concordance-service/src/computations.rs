//! What each kind of job computes.
//!
//! Only [`JobKind::Hits`] talks to the search backend. Every other kind is defined in terms of
//! another job: it projects its parameters onto the kind it builds on, waits for that job
//! through the cache (so it is shared with everybody else asking for the same thing), and
//! transforms the result.

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::backend::HitsQuery;
use crate::error::JobError;
use crate::fingerprint::{JobKind, SearchParameters, keys};
use crate::job::JobContext;
use crate::results::{
    self, GroupSort, Hits, JobOutput, Property, SortSpec, Total, collect_docs, group_by,
};

/// Number of results in a window when not specified.
const DEFAULT_WINDOW_SIZE: usize = 50;

/// Builds the computation for one job kind, validating the request parameters.
pub(crate) type Constructor = fn(&SearchParameters) -> Result<Computation, JobError>;

#[derive(Debug)]
pub(crate) enum Computation {
    /// Runs a search on the backend.
    Search(HitsQuery),
    /// Collects the hits of a search into documents.
    Docs { source: SearchParameters },
    /// Sorts hits or documents.
    Sort {
        source: SearchParameters,
        spec: SortSpec,
        docs: bool,
    },
    /// Groups hits or documents.
    Group {
        source: SearchParameters,
        property: Property,
        sort: Option<GroupSort>,
        docs: bool,
    },
    /// Takes a page out of (possibly sorted) hits or documents.
    Window {
        source: SearchParameters,
        first: usize,
        number: usize,
        docs: bool,
    },
    /// Counts hits and documents.
    Total { source: SearchParameters, docs: bool },
}

impl Computation {
    pub fn constructor(kind: JobKind) -> Constructor {
        match kind {
            JobKind::Hits => search,
            JobKind::Docs => docs,
            JobKind::HitsSorted => |params| sorted(params, false),
            JobKind::DocsSorted => |params| sorted(params, true),
            JobKind::HitsWindow => |params| windowed(params, false),
            JobKind::DocsWindow => |params| windowed(params, true),
            JobKind::HitsGrouped => |params| grouped(params, false),
            JobKind::DocsGrouped => |params| grouped(params, true),
            JobKind::HitsTotal => |params| total(params, false),
            JobKind::DocsTotal => |params| total(params, true),
        }
    }

    pub fn construct(kind: JobKind, params: &SearchParameters) -> Result<Self, JobError> {
        Self::constructor(kind)(params)
    }

    pub fn compute<'a>(
        &'a self,
        ctx: &'a JobContext<'_>,
    ) -> BoxFuture<'a, Result<JobOutput, JobError>> {
        async move {
            match self {
                Computation::Search(query) => {
                    let hits = ctx.backend().find(query, ctx.control()).await?;
                    Ok(JobOutput::Hits(hits))
                }
                Computation::Docs { source } => {
                    let hits = ctx.dependency(JobKind::Hits, source).await?.into_hits()?;
                    ctx.control().checkpoint().await?;
                    let docs = collect_docs(&hits);
                    ctx.control()
                        .report_progress(docs.docs.len(), docs.hits_counted);
                    Ok(JobOutput::Docs(docs))
                }
                Computation::Sort {
                    source,
                    spec,
                    docs: false,
                } => {
                    let hits = ctx.dependency(JobKind::Hits, source).await?.into_hits()?;
                    ctx.control().checkpoint().await?;
                    let mut sorted = hits.hits.to_vec();
                    spec.sort(&mut sorted);
                    ctx.control().report_progress(sorted.len(), hits.counted);
                    Ok(JobOutput::Hits(Hits {
                        hits: sorted.into(),
                        ..hits
                    }))
                }
                Computation::Sort {
                    source,
                    spec,
                    docs: true,
                } => {
                    let docs = ctx.dependency(JobKind::Docs, source).await?.into_docs()?;
                    ctx.control().checkpoint().await?;
                    let mut sorted = docs.docs.to_vec();
                    spec.sort(&mut sorted);
                    ctx.control().report_progress(sorted.len(), docs.hits_counted);
                    Ok(JobOutput::Docs(results::Docs {
                        docs: sorted.into(),
                        ..docs
                    }))
                }
                Computation::Group {
                    source,
                    property,
                    sort,
                    docs: false,
                } => {
                    let hits = ctx.dependency(JobKind::Hits, source).await?.into_hits()?;
                    ctx.control().checkpoint().await?;
                    let groups = group_by(&hits.hits, *property, *sort);
                    ctx.control()
                        .report_progress(groups.groups.len(), hits.counted);
                    Ok(JobOutput::HitGroups(groups))
                }
                Computation::Group {
                    source,
                    property,
                    sort,
                    docs: true,
                } => {
                    let docs = ctx.dependency(JobKind::Docs, source).await?.into_docs()?;
                    ctx.control().checkpoint().await?;
                    let groups = group_by(&docs.docs, *property, *sort);
                    ctx.control()
                        .report_progress(groups.groups.len(), docs.hits_counted);
                    Ok(JobOutput::DocGroups(groups))
                }
                Computation::Window {
                    source,
                    first,
                    number,
                    docs,
                } => {
                    let base = if *docs { JobKind::Docs } else { JobKind::Hits };
                    let output = ctx.dependency(base.resolve(source), source).await?;
                    let window = match output {
                        JobOutput::Hits(hits) => {
                            JobOutput::HitsWindow(results::window(&hits.hits, *first, *number))
                        }
                        JobOutput::Docs(docs) => {
                            JobOutput::DocsWindow(results::window(&docs.docs, *first, *number))
                        }
                        other => {
                            return Err(JobError::InternalError(format!(
                                "cannot take a window of {other:?}"
                            )));
                        }
                    };
                    Ok(window)
                }
                Computation::Total {
                    source,
                    docs: false,
                } => {
                    let hits = ctx.dependency(JobKind::Hits, source).await?.into_hits()?;
                    let mut docs = 0;
                    let mut last_doc = None;
                    for hit in hits.hits.iter() {
                        if last_doc != Some(hit.doc) {
                            docs += 1;
                            last_doc = Some(hit.doc);
                        }
                    }
                    ctx.control().report_progress(hits.hits.len(), hits.counted);
                    Ok(JobOutput::Total(Total {
                        hits: hits.counted,
                        docs,
                        max_count_exceeded: hits.max_count_exceeded,
                    }))
                }
                Computation::Total { source, docs: true } => {
                    let docs = ctx.dependency(JobKind::Docs, source).await?.into_docs()?;
                    ctx.control()
                        .report_progress(docs.docs.len(), docs.hits_counted);
                    Ok(JobOutput::Total(Total {
                        hits: docs.hits_counted,
                        docs: docs.docs.len(),
                        max_count_exceeded: docs.max_count_exceeded,
                    }))
                }
            }
        }
        .boxed()
    }
}

fn search(params: &SearchParameters) -> Result<Computation, JobError> {
    HitsQuery::from_params(params).map(Computation::Search)
}

fn docs(params: &SearchParameters) -> Result<Computation, JobError> {
    HitsQuery::from_params(params)?;
    Ok(Computation::Docs {
        source: params.clone(),
    })
}

fn sorted(params: &SearchParameters, docs: bool) -> Result<Computation, JobError> {
    HitsQuery::from_params(params)?;
    let spec = SortSpec::parse(params.require(keys::SORT)?, docs)?;
    Ok(Computation::Sort {
        source: params.without(&[keys::SORT]),
        spec,
        docs,
    })
}

fn windowed(params: &SearchParameters, docs: bool) -> Result<Computation, JobError> {
    HitsQuery::from_params(params)?;
    if let Some(sort) = params.get(keys::SORT) {
        SortSpec::parse(sort, docs)?;
    }
    let first = params.get_usize(keys::FIRST)?.unwrap_or(0);
    let number = params
        .get_usize(keys::NUMBER)?
        .unwrap_or(DEFAULT_WINDOW_SIZE);

    Ok(Computation::Window {
        source: params.without(&[keys::FIRST, keys::NUMBER]),
        first,
        number,
        docs,
    })
}

fn grouped(params: &SearchParameters, docs: bool) -> Result<Computation, JobError> {
    HitsQuery::from_params(params)?;
    let property = results::parse_group_property(params.require(keys::GROUP)?, docs)?;
    let sort = params.get(keys::SORT).map(GroupSort::parse).transpose()?;

    Ok(Computation::Group {
        source: params.without(&[keys::GROUP, keys::SORT]),
        property,
        sort,
        docs,
    })
}

fn total(params: &SearchParameters, docs: bool) -> Result<Computation, JobError> {
    HitsQuery::from_params(params)?;
    Ok(Computation::Total {
        source: params.clone(),
        docs,
    })
}
