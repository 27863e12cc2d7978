//! Canonical request identity.
//!
//! Requests reach the service as a flat set of named parameters. Only a subset of those is
//! relevant for any particular [`JobKind`]: a window over sorted hits depends on the pagination
//! parameters, while the underlying search does not. A [`Fingerprint`] is the projection of the
//! parameters onto the relevant keys for a job kind, and it defines cache identity.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::JobError;

/// Parameter keys understood by the service.
pub mod keys {
    pub const INDEX: &str = "index";
    pub const PATTERN: &str = "patt";
    pub const FILTER: &str = "filter";
    pub const DOC_PID: &str = "docpid";
    pub const MAX_RETRIEVE: &str = "maxretrieve";
    pub const MAX_COUNT: &str = "maxcount";
    pub const SORT: &str = "sort";
    pub const GROUP: &str = "group";
    pub const FIRST: &str = "first";
    pub const NUMBER: &str = "number";
}

const SEARCH_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::DOC_PID,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
];
const SORTED_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::DOC_PID,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::SORT,
];
const WINDOW_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::DOC_PID,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::SORT,
    keys::FIRST,
    keys::NUMBER,
];
const GROUPED_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::DOC_PID,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::GROUP,
    keys::SORT,
];
const TOTAL_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
];

// Document results never depend on `docpid`, so none of the docs kinds carry it.
const DOCS_KEYS: &[&str] = TOTAL_KEYS;
const DOCS_SORTED_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::SORT,
];
const DOCS_WINDOW_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::SORT,
    keys::FIRST,
    keys::NUMBER,
];
const DOCS_GROUPED_KEYS: &[&str] = &[
    keys::INDEX,
    keys::PATTERN,
    keys::FILTER,
    keys::MAX_RETRIEVE,
    keys::MAX_COUNT,
    keys::GROUP,
    keys::SORT,
];

/// A canonical, order-independent set of request parameters.
///
/// Empty values are treated as absent, so `sort=` and a missing `sort` are the same request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchParameters(BTreeMap<String, String>);

impl SearchParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let key = key.into();
        if value.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Restricts the parameters to the given keys.
    pub fn only(&self, keys: &[&str]) -> Self {
        let inner = self
            .0
            .iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self(inner)
    }

    /// Drops the given keys from the parameters.
    pub fn without(&self, keys: &[&str]) -> Self {
        let inner = self
            .0
            .iter()
            .filter(|(k, _)| !keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self(inner)
    }

    /// Returns the value of a mandatory parameter.
    pub fn require(&self, key: &str) -> Result<&str, JobError> {
        self.get(key).ok_or_else(|| {
            JobError::bad_request("MISSING_PARAMETER", format!("missing parameter '{key}'"))
        })
    }

    /// Parses an optional numeric parameter.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, JobError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value.trim().parse().map(Some).map_err(|_| {
            JobError::bad_request(
                "ILLEGAL_NUMBER",
                format!("parameter '{key}' must be a non-negative number, got '{value}'"),
            )
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SearchParameters {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// The kind of computation a job performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Find all matches of a pattern.
    Hits,
    /// Sort the matches of a pattern.
    HitsSorted,
    /// A page out of (possibly sorted) matches.
    HitsWindow,
    /// Group matches by a property.
    HitsGrouped,
    /// Count matches.
    HitsTotal,
    /// Documents containing matches.
    Docs,
    DocsSorted,
    DocsWindow,
    DocsGrouped,
    /// Count matching documents.
    DocsTotal,
}

impl JobKind {
    pub const ALL: [JobKind; 10] = [
        JobKind::Hits,
        JobKind::HitsSorted,
        JobKind::HitsWindow,
        JobKind::HitsGrouped,
        JobKind::HitsTotal,
        JobKind::Docs,
        JobKind::DocsSorted,
        JobKind::DocsWindow,
        JobKind::DocsGrouped,
        JobKind::DocsTotal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Hits => "hits",
            JobKind::HitsSorted => "hits_sorted",
            JobKind::HitsWindow => "hits_window",
            JobKind::HitsGrouped => "hits_grouped",
            JobKind::HitsTotal => "hits_total",
            JobKind::Docs => "docs",
            JobKind::DocsSorted => "docs_sorted",
            JobKind::DocsWindow => "docs_window",
            JobKind::DocsGrouped => "docs_grouped",
            JobKind::DocsTotal => "docs_total",
        }
    }

    /// Whether this job only counts, as opposed to searching.
    ///
    /// Counting is treated as lower value background work by the scheduler.
    pub fn is_count(self) -> bool {
        matches!(self, JobKind::HitsTotal | JobKind::DocsTotal)
    }

    pub fn is_docs(self) -> bool {
        matches!(
            self,
            JobKind::Docs
                | JobKind::DocsSorted
                | JobKind::DocsWindow
                | JobKind::DocsGrouped
                | JobKind::DocsTotal
        )
    }

    /// The parameter keys that influence the result of this kind of job.
    pub fn relevant_keys(self) -> &'static [&'static str] {
        match self {
            JobKind::Hits => SEARCH_KEYS,
            JobKind::HitsSorted => SORTED_KEYS,
            JobKind::HitsWindow => WINDOW_KEYS,
            JobKind::HitsGrouped => GROUPED_KEYS,
            JobKind::HitsTotal => TOTAL_KEYS,
            JobKind::Docs | JobKind::DocsTotal => DOCS_KEYS,
            JobKind::DocsSorted => DOCS_SORTED_KEYS,
            JobKind::DocsWindow => DOCS_WINDOW_KEYS,
            JobKind::DocsGrouped => DOCS_GROUPED_KEYS,
        }
    }

    /// Picks the sorted or unsorted variant depending on whether a sort was requested.
    pub fn resolve(self, params: &SearchParameters) -> JobKind {
        let sorted = params.contains(keys::SORT);
        match self {
            JobKind::Hits if sorted => JobKind::HitsSorted,
            JobKind::HitsSorted if !sorted => JobKind::Hits,
            JobKind::Docs if sorted => JobKind::DocsSorted,
            JobKind::DocsSorted if !sorted => JobKind::Docs,
            kind => kind,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The cache identity of a job: a job kind plus the parameters relevant to it.
///
/// Equality and hashing are based on a SHA-256 digest over the kind and the canonical
/// parameters.
#[derive(Clone, Debug)]
pub struct Fingerprint {
    kind: JobKind,
    params: Arc<SearchParameters>,
    hash: [u8; 32],
}

impl Fingerprint {
    /// Projects `params` onto the keys relevant for `kind`.
    pub fn new(kind: JobKind, params: &SearchParameters) -> Self {
        let params = params.only(kind.relevant_keys());

        let mut hasher = Sha256::new();
        hasher.update(kind.as_str());
        for (key, value) in params.iter() {
            hasher.update([0]);
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        }

        Self {
            kind,
            params: Arc::new(params),
            hash: hasher.finalize().into(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn params(&self) -> &SearchParameters {
        &self.params
    }

    /// The index this fingerprint searches, if any.
    pub fn index(&self) -> Option<&str> {
        self.params.get(keys::INDEX)
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value:?}")?;
        }
        f.write_str(")")
    }
}
