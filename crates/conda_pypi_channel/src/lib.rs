//! Conda channels as seen by conda-pypi.
//!
//! [`LocalChannel`] is the on-disk channel converted wheels are written to,
//! [`ChannelIndex`] is a read-only view of the records of a list of channels.

use std::path::PathBuf;

use conda_pypi_wheel::WheelError;
use miette::Diagnostic;
use thiserror::Error;
use url::Url;

mod index;
mod local;
mod repodata;
mod synth;

pub use index::{ChannelIndex, ChannelLocation, ChannelRecord, ChannelSource};
pub use local::LocalChannel;
pub use rattler_conda_types::{PackageRecord, RepoData, RepoDataRecord};
pub use repodata::RepoDataExt;
pub use synth::synthesize_repodata;

#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid channel '{0}'")]
    #[diagnostic(help("use a channel name, an url or an absolute path"))]
    InvalidChannel(String),
    #[error("invalid channel path {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("failed to parse {}", .0.display())]
    InvalidRepodata(PathBuf, #[source] serde_json::Error),
    #[error("failed to read the package {}: {}", .0.display(), .1)]
    ReadPackage(PathBuf, String),
    #[error("request to {0} failed")]
    Request(Url, #[source] reqwest_middleware::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Wheel(#[from] WheelError),
}
