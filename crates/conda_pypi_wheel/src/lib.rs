//! Conversion of PyPI wheels into `noarch: python` conda packages.
//!
//! A wheel is unpacked into the layout conda expects for noarch python
//! packages (`site-packages/`, `python-scripts/`), its core metadata is
//! translated into `info/index.json` and friends, and the result is written as
//! a `.conda` archive.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

mod conda_metadata;
mod convert;
mod filename;
mod metadata;
mod requirements;
mod tags;

pub use conda_metadata::{CondaMetadata, parse_console_scripts};
pub use convert::{
    ConvertOptions, ConvertedPackage, WheelInfo, convert_wheel, paths_json, read_wheel_metadata,
};
pub use filename::{WheelFilename, WheelFilenameError};
pub use metadata::WheelMetadata;
pub use requirements::{CondaRequirements, conda_to_requires, requires_to_conda};
pub use tags::CompatibilityTags;

#[derive(Debug, Error, Diagnostic)]
pub enum WheelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to read the wheel archive")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    InvalidFilename(#[from] WheelFilenameError),
    #[error("no .dist-info/METADATA found in {}", .0.display())]
    MissingMetadata(PathBuf),
    #[error("invalid core metadata: {0}")]
    InvalidMetadata(String),
    #[error("'{0}' is not a valid conda version")]
    InvalidVersion(String, #[source] rattler_conda_types::ParseVersionError),
    #[error(transparent)]
    InvalidPackageName(#[from] rattler_conda_types::InvalidPackageNameError),
    #[error("invalid requirement '{0}': {1}")]
    InvalidRequirement(String, String),
    #[error("the wheel contains an unsafe path '{0}'")]
    UnsafePath(String),
    #[error("invalid path {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("failed to write package metadata")]
    Json(#[from] serde_json::Error),
    #[error("failed to write RECORD")]
    Csv(#[from] csv::Error),
    #[error("failed to write the conda package {}", .0.display())]
    WritePackage(PathBuf, #[source] std::io::Error),
}
