use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;

use super::{ExecutionControl, HitsQuery, SearchBackend};
use crate::error::JobError;
use crate::results::{Hit, Hits};

/// The on-disk format of a corpus.
#[derive(Debug, Default, Deserialize)]
pub struct CorpusFile {
    pub indexes: BTreeMap<String, Vec<Document>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Document {
    pub pid: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug)]
struct IndexedDocument {
    pid: Arc<str>,
    tokens: Vec<String>,
    metadata: BTreeMap<String, String>,
}

/// A search backend over a small in-memory corpus.
///
/// Documents are tokenized on whitespace, lowercased and stripped of punctuation. A pattern is
/// a sequence of tokens, where `*` matches any single token. Filters have the form
/// `field:value` and match document metadata.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    indexes: HashMap<String, Vec<IndexedDocument>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a corpus from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read corpus file {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let corpus: CorpusFile =
            serde_yaml::from_str(contents).context("failed to parse corpus YAML")?;

        let mut backend = Self::new();
        for (name, documents) in corpus.indexes {
            backend.add_index(name, documents);
        }
        Ok(backend)
    }

    pub fn add_index(&mut self, name: impl Into<String>, documents: Vec<Document>) {
        let documents = documents
            .into_iter()
            .map(|doc| IndexedDocument {
                pid: doc.pid.into(),
                tokens: tokenize(&doc.text),
                metadata: doc.metadata,
            })
            .collect();
        self.indexes.insert(name.into(), documents);
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    async fn search(&self, query: &HitsQuery, control: &ExecutionControl) -> Result<Hits, JobError> {
        let documents = self.indexes.get(&query.index).ok_or_else(|| {
            JobError::bad_request(
                "INDEX_NOT_FOUND",
                format!("index '{}' does not exist", query.index),
            )
        })?;

        let pattern = tokenize(&query.pattern);
        if pattern.is_empty() {
            return Err(JobError::bad_request("EMPTY_PATTERN", "pattern is empty"));
        }
        let filter = query.filter.as_deref().map(parse_filter).transpose()?;

        let mut hits = Vec::new();
        let mut counted = 0;
        let mut max_retrieve_exceeded = false;
        let mut max_count_exceeded = false;

        'documents: for (doc, document) in documents.iter().enumerate() {
            control.checkpoint().await?;

            if query
                .doc_pid
                .as_deref()
                .is_some_and(|pid| pid != &*document.pid)
            {
                continue;
            }
            if let Some((field, value)) = filter {
                if document.metadata.get(field).map(String::as_str) != Some(value) {
                    continue;
                }
            }

            for start in 0..document.tokens.len() {
                let end = start + pattern.len();
                if end > document.tokens.len() || !matches(&pattern, &document.tokens[start..end]) {
                    continue;
                }

                if query.max_count.is_some_and(|max| counted >= max) {
                    max_count_exceeded = true;
                    break 'documents;
                }
                counted += 1;

                if query.max_retrieve.is_some_and(|max| hits.len() >= max) {
                    max_retrieve_exceeded = true;
                    continue;
                }
                hits.push(Hit {
                    doc,
                    pid: Arc::clone(&document.pid),
                    start,
                    end,
                    text: document.tokens[start..end].join(" "),
                });
            }

            control.report_progress(hits.len(), counted);
        }

        control.report_progress(hits.len(), counted);
        tracing::trace!(
            index = %query.index,
            pattern = %query.pattern,
            hits = hits.len(),
            counted,
            "memory search finished"
        );

        Ok(Hits {
            hits: hits.into(),
            counted,
            max_retrieve_exceeded,
            max_count_exceeded,
        })
    }
}

impl SearchBackend for MemoryBackend {
    fn find<'a>(
        &'a self,
        query: &'a HitsQuery,
        control: &'a ExecutionControl,
    ) -> BoxFuture<'a, Result<Hits, JobError>> {
        self.search(query, control).boxed()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| c.is_ascii_punctuation() && c != '*')
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

fn matches(pattern: &[String], tokens: &[String]) -> bool {
    pattern
        .iter()
        .zip(tokens)
        .all(|(expected, token)| expected == "*" || expected == token)
}

fn parse_filter(filter: &str) -> Result<(&str, &str), JobError> {
    filter
        .split_once(':')
        .map(|(field, value)| (field.trim(), value.trim()))
        .filter(|(field, _)| !field.is_empty())
        .ok_or_else(|| {
            JobError::bad_request(
                "FILTER_SYNTAX_ERROR",
                format!("expected 'field:value' filter, got '{filter}'"),
            )
        })
}
