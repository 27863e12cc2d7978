//! Result types produced by jobs.
//!
//! Results are immutable once a job finishes, and are shared between every caller of that job.
//! The bulk data lives behind [`Arc`]s so that handing a result out is cheap.

use std::cmp::Ordering;
use std::mem::size_of;
use std::sync::Arc;

use serde::Serialize;

use crate::error::JobError;

/// A single match of a pattern in a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Hit {
    /// Position of the document in its index.
    pub doc: usize,
    /// Persistent identifier of the document.
    pub pid: Arc<str>,
    /// First matched token.
    pub start: usize,
    /// One past the last matched token.
    pub end: usize,
    /// The matched tokens, separated by single spaces.
    pub text: String,
}

/// All matches of a search, as returned by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Hits {
    pub hits: Arc<[Hit]>,
    /// Number of matches counted, which may exceed the number retrieved.
    pub counted: usize,
    pub max_retrieve_exceeded: bool,
    pub max_count_exceeded: bool,
}

/// A document together with its matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DocResult {
    pub doc: usize,
    pub pid: Arc<str>,
    pub hits: Vec<Hit>,
}

/// The documents matching a search.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Docs {
    pub docs: Arc<[DocResult]>,
    pub hits_counted: usize,
    pub max_count_exceeded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Group<T> {
    pub identity: String,
    pub items: Vec<T>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Groups<T> {
    pub groups: Arc<[Group<T>]>,
}

/// A page of results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Window<T> {
    pub first: usize,
    pub requested: usize,
    /// Size of the full result this window was taken from.
    pub total: usize,
    pub items: Arc<[T]>,
}

impl<T> Window<T> {
    pub fn has_next(&self) -> bool {
        self.first + self.items.len() < self.total
    }
}

/// The result of a counting job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Total {
    pub hits: usize,
    pub docs: usize,
    pub max_count_exceeded: bool,
}

/// The stored result of a finished job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Hits(Hits),
    Docs(Docs),
    HitGroups(Groups<Hit>),
    DocGroups(Groups<DocResult>),
    HitsWindow(Window<Hit>),
    DocsWindow(Window<DocResult>),
    Total(Total),
}

impl JobOutput {
    /// An approximation of the memory held by this result.
    pub fn estimated_size(&self) -> usize {
        match self {
            JobOutput::Hits(hits) => size_of::<Hits>() + slice_size(&hits.hits),
            JobOutput::Docs(docs) => size_of::<Docs>() + slice_size(&docs.docs),
            JobOutput::HitGroups(groups) => size_of::<Groups<Hit>>() + groups_size(groups),
            JobOutput::DocGroups(groups) => size_of::<Groups<DocResult>>() + groups_size(groups),
            JobOutput::HitsWindow(window) => size_of::<Window<Hit>>() + slice_size(&window.items),
            JobOutput::DocsWindow(window) => {
                size_of::<Window<DocResult>>() + slice_size(&window.items)
            }
            JobOutput::Total(_) => size_of::<Total>(),
        }
    }

    pub fn into_hits(self) -> Result<Hits, JobError> {
        match self {
            JobOutput::Hits(hits) => Ok(hits),
            other => Err(unexpected("hits", &other)),
        }
    }

    pub fn into_docs(self) -> Result<Docs, JobError> {
        match self {
            JobOutput::Docs(docs) => Ok(docs),
            other => Err(unexpected("docs", &other)),
        }
    }

    pub fn into_total(self) -> Result<Total, JobError> {
        match self {
            JobOutput::Total(total) => Ok(total),
            other => Err(unexpected("total", &other)),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            JobOutput::Hits(_) => "hits",
            JobOutput::Docs(_) => "docs",
            JobOutput::HitGroups(_) => "hit_groups",
            JobOutput::DocGroups(_) => "doc_groups",
            JobOutput::HitsWindow(_) => "hits_window",
            JobOutput::DocsWindow(_) => "docs_window",
            JobOutput::Total(_) => "total",
        }
    }
}

fn unexpected(expected: &str, got: &JobOutput) -> JobError {
    JobError::InternalError(format!(
        "expected {expected} result, got {}",
        got.type_name()
    ))
}

trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

impl EstimateSize for Hit {
    fn estimated_size(&self) -> usize {
        size_of::<Hit>() + self.text.len()
    }
}

impl EstimateSize for DocResult {
    fn estimated_size(&self) -> usize {
        size_of::<DocResult>() + slice_size(&self.hits)
    }
}

fn slice_size<T: EstimateSize>(items: &[T]) -> usize {
    items.iter().map(EstimateSize::estimated_size).sum()
}

fn groups_size<T: EstimateSize>(groups: &Groups<T>) -> usize {
    groups
        .groups
        .iter()
        .map(|g| size_of::<Group<T>>() + g.identity.len() + slice_size(&g.items))
        .sum()
}

/// A property results can be sorted or grouped by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Property {
    /// The document identifier.
    DocId,
    /// Position of the match in its document.
    Start,
    /// The matched text.
    Hit,
    /// Number of matches in a document.
    NumHits,
}

impl Property {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "docid" => Property::DocId,
            "start" => Property::Start,
            "hit" => Property::Hit,
            "numhits" => Property::NumHits,
            _ => return None,
        })
    }

    fn applies_to_hits(self) -> bool {
        !matches!(self, Property::NumHits)
    }

    fn applies_to_docs(self) -> bool {
        matches!(self, Property::DocId | Property::NumHits)
    }
}

/// The value of a [`Property`] for one result item.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertyValue<'a> {
    Number(usize),
    Text(&'a str),
}

impl PropertyValue<'_> {
    fn identity(&self) -> String {
        match self {
            PropertyValue::Number(n) => n.to_string(),
            PropertyValue::Text(s) => (*s).to_owned(),
        }
    }
}

/// Result items that can be sorted and grouped.
pub trait Sortable: Clone {
    fn value(&self, property: Property) -> Option<PropertyValue<'_>>;
}

impl Sortable for Hit {
    fn value(&self, property: Property) -> Option<PropertyValue<'_>> {
        match property {
            Property::DocId => Some(PropertyValue::Text(&self.pid)),
            Property::Start => Some(PropertyValue::Number(self.start)),
            Property::Hit => Some(PropertyValue::Text(&self.text)),
            Property::NumHits => None,
        }
    }
}

impl Sortable for DocResult {
    fn value(&self, property: Property) -> Option<PropertyValue<'_>> {
        match property {
            Property::DocId => Some(PropertyValue::Text(&self.pid)),
            Property::NumHits => Some(PropertyValue::Number(self.hits.len())),
            Property::Start | Property::Hit => None,
        }
    }
}

/// A property to sort by, optionally reversed with a leading `-`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub property: Property,
    pub reverse: bool,
}

impl SortSpec {
    /// Parses a sort specification like `-start` for sorting `docs` or hits.
    pub fn parse(spec: &str, docs: bool) -> Result<Self, JobError> {
        let (reverse, name) = match spec.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, spec),
        };
        let property = Property::parse(name)
            .filter(|p| if docs { p.applies_to_docs() } else { p.applies_to_hits() })
            .ok_or_else(|| {
                JobError::bad_request(
                    "UNKNOWN_SORT_PROPERTY",
                    format!("unknown sort property '{name}'"),
                )
            })?;
        Ok(Self { property, reverse })
    }

    /// Stable sort of `items` by this specification.
    pub fn sort<T: Sortable>(&self, items: &mut [T]) {
        items.sort_by(|a, b| {
            let ord = a.value(self.property).cmp(&b.value(self.property));
            if self.reverse { ord.reverse() } else { ord }
        });
    }
}

/// Parses the property to group by.
pub fn parse_group_property(name: &str, docs: bool) -> Result<Property, JobError> {
    Property::parse(name)
        .filter(|p| if docs { p.applies_to_docs() } else { p.applies_to_hits() })
        .ok_or_else(|| {
            JobError::bad_request(
                "UNKNOWN_GROUP_PROPERTY",
                format!("unknown group property '{name}'"),
            )
        })
}

/// How groups are ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupOrder {
    /// By number of items in the group.
    Size,
    /// By the group identity.
    Identity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupSort {
    pub order: GroupOrder,
    pub reverse: bool,
}

impl GroupSort {
    pub fn parse(spec: &str) -> Result<Self, JobError> {
        let (reverse, name) = match spec.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, spec),
        };
        let order = match name {
            "size" => GroupOrder::Size,
            "identity" => GroupOrder::Identity,
            _ => {
                return Err(JobError::bad_request(
                    "UNKNOWN_SORT_PROPERTY",
                    format!("unknown group sort '{name}'"),
                ));
            }
        };
        Ok(Self { order, reverse })
    }

    fn compare<T>(&self, a: &Group<T>, b: &Group<T>) -> Ordering {
        let ord = match self.order {
            GroupOrder::Size => a.items.len().cmp(&b.items.len()),
            GroupOrder::Identity => a.identity.cmp(&b.identity),
        };
        if self.reverse { ord.reverse() } else { ord }
    }
}

/// Groups `items` by `property`, in order of first appearance unless a `sort` is given.
pub fn group_by<T: Sortable>(
    items: &[T],
    property: Property,
    sort: Option<GroupSort>,
) -> Groups<T> {
    let mut groups: Vec<Group<T>> = Vec::new();
    let mut positions = std::collections::HashMap::new();

    for item in items {
        let identity = item
            .value(property)
            .map(|v| v.identity())
            .unwrap_or_default();
        let position = *positions.entry(identity.clone()).or_insert_with(|| {
            groups.push(Group {
                identity,
                items: Vec::new(),
            });
            groups.len() - 1
        });
        groups[position].items.push(item.clone());
    }

    if let Some(sort) = sort {
        groups.sort_by(|a, b| sort.compare(a, b));
    }

    Groups {
        groups: groups.into(),
    }
}

/// Collects hits into their documents, keeping document order.
pub fn collect_docs(hits: &Hits) -> Docs {
    let mut docs: Vec<DocResult> = Vec::new();
    for hit in hits.hits.iter() {
        match docs.last_mut() {
            Some(last) if last.doc == hit.doc => last.hits.push(hit.clone()),
            _ => docs.push(DocResult {
                doc: hit.doc,
                pid: Arc::clone(&hit.pid),
                hits: vec![hit.clone()],
            }),
        }
    }
    Docs {
        docs: docs.into(),
        hits_counted: hits.counted,
        max_count_exceeded: hits.max_count_exceeded,
    }
}

/// Takes a page out of `items`.
///
/// A `first` beyond the end of the results is reset to the beginning.
pub fn window<T: Clone>(items: &[T], first: usize, requested: usize) -> Window<T> {
    let first = if first >= items.len() { 0 } else { first };
    let end = first.saturating_add(requested).min(items.len());
    Window {
        first,
        requested,
        total: items.len(),
        items: items[first..end].into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: usize, start: usize, text: &str) -> Hit {
        Hit {
            doc,
            pid: format!("doc-{doc}").into(),
            start,
            end: start + text.split(' ').count(),
            text: text.into(),
        }
    }

    fn hits() -> Hits {
        let hits = vec![
            hit(0, 3, "the deep"),
            hit(0, 9, "the lone"),
            hit(2, 1, "the forests"),
            hit(3, 4, "the deep"),
        ];
        Hits {
            counted: hits.len(),
            hits: hits.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_spec() {
        let spec = SortSpec::parse("-start", false).unwrap();
        assert_eq!(spec.property, Property::Start);
        assert!(spec.reverse);

        let mut items = hits().hits.to_vec();
        spec.sort(&mut items);
        let starts: Vec<_> = items.iter().map(|h| h.start).collect();
        assert_eq!(starts, [9, 4, 3, 1]);

        assert!(SortSpec::parse("numhits", false).is_err());
        assert!(SortSpec::parse("numhits", true).is_ok());
        assert!(SortSpec::parse("hit", true).is_err());
        assert!(SortSpec::parse("nonsense", false).is_err());
    }

    #[test]
    fn test_sort_is_stable() {
        let mut items = hits().hits.to_vec();
        SortSpec::parse("hit", false).unwrap().sort(&mut items);
        let docs: Vec<_> = items.iter().map(|h| (h.text.as_str(), h.doc)).collect();
        assert_eq!(
            docs,
            [
                ("the deep", 0),
                ("the deep", 3),
                ("the forests", 2),
                ("the lone", 0)
            ]
        );
    }

    #[test]
    fn test_group_by() {
        let hits = hits();
        let groups = group_by(&hits.hits, Property::Hit, None);
        let summary: Vec<_> = groups
            .groups
            .iter()
            .map(|g| (g.identity.as_str(), g.items.len()))
            .collect();
        assert_eq!(summary, [("the deep", 2), ("the lone", 1), ("the forests", 1)]);

        let sort = GroupSort::parse("-size").unwrap();
        let groups = group_by(&hits.hits, Property::DocId, Some(sort));
        assert_eq!(groups.groups[0].identity, "doc-0");
        assert_eq!(groups.groups[0].items.len(), 2);
    }

    #[test]
    fn test_collect_docs() {
        let docs = collect_docs(&hits());
        let summary: Vec<_> = docs.docs.iter().map(|d| (d.doc, d.hits.len())).collect();
        assert_eq!(summary, [(0, 2), (2, 1), (3, 1)]);
        assert_eq!(docs.hits_counted, 4);
    }

    #[test]
    fn test_window() {
        let items = hits().hits.to_vec();

        let page = window(&items, 1, 2);
        assert_eq!(page.first, 1);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_next());

        let page = window(&items, 3, 10);
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_next());

        // out of range resets to the first page
        let page = window(&items, 100, 2);
        assert_eq!(page.first, 0);
        assert_eq!(page.items[0], items[0]);
    }

    #[test]
    fn test_estimated_size_grows_with_content() {
        let empty = JobOutput::Hits(Hits::default());
        let full = JobOutput::Hits(hits());
        assert!(full.estimated_size() > empty.estimated_size());
        assert_eq!(
            JobOutput::Total(Total::default()).estimated_size(),
            size_of::<Total>()
        );
    }
}
