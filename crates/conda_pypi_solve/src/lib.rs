//! Resolving conda specs against the records of a list of channels.
//!
//! The hybrid resolver only needs two answers from a solve: the requested
//! specs no channel provides ([`SolveError::PackagesNotFound`]), and the
//! dependencies nothing provides ([`SolveError::Unsatisfiable`]). Both drive
//! the next round of PyPI fetches.

use std::{path::Path, str::FromStr, sync::LazyLock};

use async_trait::async_trait;
use conda_pypi_channel::{ChannelError, ChannelRecord, ChannelSource};
use conda_pypi_consts::consts;
use itertools::Itertools;
use miette::Diagnostic;
use rattler_conda_types::{
    MatchSpec, Matches, PackageName, PackageRecord, ParseMatchSpecError, ParseStrictness,
    VersionWithSource,
};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

mod repodata_solver;

pub use repodata_solver::RepodataSolver;

#[derive(Debug, Error, Diagnostic)]
pub enum SolveError {
    #[error("the following packages are not available from the channels: {}", .0.join(", "))]
    PackagesNotFound(Vec<String>),
    #[error("the environment is unsatisfiable:\n{message}")]
    Unsatisfiable { message: String },
    #[error("invalid conda spec '{0}'")]
    InvalidSpec(String, #[source] ParseMatchSpecError),
    #[error(transparent)]
    Solver(#[from] rattler_solve::SolveError),
    #[error("the solve was cancelled")]
    Cancelled,
    #[error(transparent)]
    #[diagnostic(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A package already installed in the target prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub build: String,
}

impl InstalledPackage {
    /// Reads the `conda-meta/*.json` records of a prefix.
    pub fn from_prefix(prefix: &Path) -> Result<Vec<Self>, SolveError> {
        let conda_meta = prefix.join(consts::CONDA_META_DIR);
        if !conda_meta.is_dir() {
            return Ok(Vec::new());
        }
        let mut installed = Vec::new();
        for entry in fs_err::read_dir(&conda_meta)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = fs_err::read_to_string(&path)?;
            match serde_json::from_str::<InstalledPackage>(&content) {
                Ok(package) => installed.push(package),
                Err(err) => tracing::debug!("skipping {}: {err}", path.display()),
            }
        }
        installed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(installed)
    }

    /// Whether this package satisfies the conda `spec`. Specs or versions
    /// that do not parse never match.
    pub fn satisfies(&self, spec: &str) -> bool {
        let Ok(spec) = MatchSpec::from_str(spec, ParseStrictness::Lenient) else {
            return false;
        };
        let (Ok(name), Ok(version)) = (
            PackageName::try_from(self.name.as_str()),
            VersionWithSource::from_str(&self.version),
        ) else {
            return false;
        };
        spec.matches(&PackageRecord::new(name, version, self.build.clone()))
    }
}

/// The records a solve selected, in the order they were selected.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    pub records: Vec<ChannelRecord>,
}

impl Solution {
    pub fn get(&self, name: &str) -> Option<&ChannelRecord> {
        self.records.iter().find(|record| record.name() == name)
    }

    /// `channel::name-version-build` for every record, sorted by name.
    pub fn summary(&self) -> Vec<String> {
        self.records
            .iter()
            .sorted_by(|a, b| a.name().cmp(b.name()))
            .map(|record| {
                format!(
                    "{}::{}-{}-{}",
                    record.channel,
                    record.name(),
                    record.version(),
                    record.build()
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Solves conda specs against a list of channels.
#[async_trait]
pub trait CondaSolver: Send + Sync {
    async fn solve(
        &self,
        specs: &[String],
        channels: &[ChannelSource],
        installed: &[InstalledPackage],
    ) -> Result<Solution, SolveError>;
}

static NOTHING_PROVIDES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"nothing provides (.*) needed by").expect("valid nothing provides regex")
});

/// Extracts the specs from every `nothing provides X needed by Y` line of an
/// unsatisfiable error message.
pub fn parse_unsatisfiable_message(message: &str) -> Vec<String> {
    NOTHING_PROVIDES
        .captures_iter(message)
        .filter_map(|captures| captures.get(1))
        .map(|spec| spec.as_str().trim().to_string())
        .unique()
        .collect()
}
