//! Suite, file and run records mutated by the runners and read by views.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::diagnostics::Diagnostics;
use crate::core::plan::Plan;
use crate::core::state::State;
use crate::core::testfile::{FileConfig, RunConfig};
use crate::core::types::{CleanupOutcome, RunRef, Status};

/// Plan and state captured for verbose rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verbose {
    pub plan: Plan,
    pub state: State,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub name: String,
    pub index: usize,
    #[serde(skip)]
    pub config: RunConfig,
    pub status: Status,
    pub diagnostics: Diagnostics,
    #[serde(skip)]
    pub verbose: Option<Verbose>,
}

impl Run {
    pub fn new(index: usize, config: RunConfig) -> Self {
        Self {
            name: config.name.clone(),
            index,
            config,
            status: Status::Pending,
            diagnostics: Diagnostics::new(),
            verbose: None,
        }
    }

    pub fn run_ref(&self) -> RunRef {
        RunRef {
            index: self.index,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestFile {
    pub name: String,
    #[serde(skip)]
    pub config: FileConfig,
    pub runs: Vec<Run>,
    pub status: Status,
    pub diagnostics: Diagnostics,
    pub cleanup: CleanupOutcome,
}

impl TestFile {
    pub fn new(name: impl Into<String>, config: FileConfig) -> Self {
        let runs = config
            .runs
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, run)| Run::new(index, run))
            .collect();
        Self {
            name: name.into(),
            config,
            runs,
            status: Status::Pending,
            diagnostics: Diagnostics::new(),
            cleanup: CleanupOutcome::NotRun,
        }
    }

    /// File name without directories and the `.test.toml` suffix.
    pub fn stem(&self) -> &str {
        let base = self.name.rsplit('/').next().unwrap_or(&self.name);
        base.strip_suffix(".test.toml").unwrap_or(base)
    }
}

/// Files keyed by name, so iteration order is lexicographic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Suite {
    pub files: BTreeMap<String, TestFile>,
    pub status: Status,
}

impl Suite {
    pub fn new(files: impl IntoIterator<Item = TestFile>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|file| (file.name.clone(), file))
                .collect(),
            status: Status::Pending,
        }
    }

    pub fn run_count(&self) -> usize {
        self.files.values().map(|file| file.runs.len()).sum()
    }
}
