//! Fetching wheels for requirements the conda channels could not provide.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use miette::Diagnostic;
use pep508_rs::Requirement;
use thiserror::Error;
use url::Url;

mod finder;
mod simple;
mod target_python;

pub use finder::{Candidate, CandidateLocation, PackageFinder};
pub use simple::{ProjectFile, ProjectPage, Yanked};
pub use target_python::TargetPython;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("python not found in {}", .0.display())]
    #[diagnostic(help("install python into the environment first"))]
    PythonNotFound(PathBuf),
    #[error("invalid python version '{0}'")]
    InvalidPythonVersion(String),
    #[error("invalid index url '{0}'")]
    InvalidIndexUrl(String),
    #[error("request to {0} failed")]
    Request(Url, #[source] reqwest_middleware::Error),
    #[error("failed to parse the project page {0}")]
    InvalidProjectPage(Url, #[source] serde_json::Error),
    #[error("no compatible wheel found for '{0}'")]
    NoMatchingWheel(String),
    #[error("hash mismatch for {location}, expected {expected} but got {actual}")]
    HashMismatch {
        location: String,
        expected: String,
        actual: String,
    },
}

/// Something that can provide a wheel for a requirement.
#[async_trait]
pub trait WheelFetcher: Send + Sync {
    /// Stores the best wheel for `requirement` in `dest` and returns its
    /// path.
    async fn fetch(&self, requirement: &Requirement, dest: &Path) -> Result<PathBuf, FetchError>;
}
