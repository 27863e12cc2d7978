use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use concordance_service::{JobError, JobKind, MemoryBackend, SearchParameters, SearchService};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    /// The corpus searched by all workloads, relative to the workloads file.
    pub corpus: PathBuf,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    pub kind: JobKind,
    pub params: SearchParameters,
    /// Whether requests wait for the job to finish or only for a quick answer.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

impl WorkloadsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).context("failed to open workloads file")?;
        let mut config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;

        if config.corpus.is_relative() {
            if let Some(parent) = path.parent() {
                config.corpus = parent.join(&config.corpus);
            }
        }
        Ok(config)
    }

    pub fn backend(&self) -> Result<MemoryBackend> {
        MemoryBackend::from_path(&self.corpus)
    }
}

/// Runs one request of the given workload.
pub async fn process_workload(service: &SearchService, workload: &Workload) -> Result<(), JobError> {
    let handle = service
        .submit(&workload.params, workload.kind, workload.blocking)
        .await?;
    if workload.blocking {
        handle.wait(None).await?;
    }
    Ok(())
}
