use std::{
    fmt::{Display, Formatter},
    path::Path,
    str::FromStr,
};

use conda_pypi_consts::consts;
use conda_pypi_wheel::CompatibilityTags;
use pep440_rs::Version;
use serde::Deserialize;

use crate::FetchError;

/// The python interpreter of the environment wheels are fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetPython {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Deserialize)]
struct PrefixRecord {
    name: String,
    version: String,
}

impl TargetPython {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Reads the python version from the `conda-meta` records of a prefix.
    pub fn from_prefix(prefix: &Path) -> Result<Self, FetchError> {
        let conda_meta = prefix.join(consts::CONDA_META_DIR);
        if conda_meta.is_dir() {
            for entry in fs_err::read_dir(&conda_meta)? {
                let path = entry?.path();
                let is_candidate = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("python-") && name.ends_with(".json"));
                if !is_candidate {
                    continue;
                }

                // `python-dateutil-*.json` and friends share the prefix.
                let content = fs_err::read_to_string(&path)?;
                let Ok(record) = serde_json::from_str::<PrefixRecord>(&content) else {
                    tracing::debug!("skipping unreadable record {}", path.display());
                    continue;
                };
                if record.name == "python" {
                    tracing::debug!("found python {} in {}", record.version, prefix.display());
                    return record.version.parse();
                }
            }
        }
        Err(FetchError::PythonNotFound(prefix.to_path_buf()))
    }

    pub fn version(&self) -> Version {
        Version::new([self.major, self.minor, self.patch])
    }

    /// The wheel tags this interpreter accepts, `platforms` are the
    /// platform tags besides `any`.
    pub fn compatibility_tags(&self, platforms: Vec<String>) -> CompatibilityTags {
        CompatibilityTags::new(self.major, self.minor, platforms)
    }
}

impl FromStr for TargetPython {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FetchError::InvalidPythonVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<Option<u64>, FetchError> {
            parts
                .next()
                .map(|part| {
                    // Drop pre-release suffixes like `0rc1`.
                    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                    digits.parse::<u64>().map_err(|_| invalid())
                })
                .transpose()
        };
        let major = next()?.ok_or_else(invalid)?;
        let minor = next()?.ok_or_else(invalid)?;
        let patch = next()?.unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}

impl Display for TargetPython {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
