use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use conda_pypi_consts::consts;
use itertools::Itertools;
use pep440_rs::Version;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WheelFilenameError {
    #[error("'{0}' is not a wheel filename, it must end in '.whl'")]
    InvalidExtension(String),
    #[error("'{0}' must consist of 5 or 6 dash separated parts")]
    InvalidParts(String),
    #[error("'{filename}' has an invalid version: {message}")]
    InvalidVersion { filename: String, message: String },
    #[error("'{0}' has an invalid build tag, it must start with a digit")]
    InvalidBuildTag(String),
}

/// The parts of a wheel filename:
/// `{distribution}-{version}(-{build tag})?-{python tag}-{abi tag}-{platform tag}.whl`.
///
/// Each tag can be a compressed tag set like `py2.py3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelFilename {
    pub distribution: String,
    pub version: Version,
    pub build_tag: Option<String>,
    pub python_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl WheelFilename {
    /// The tag triples this wheel expands to.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str, &str)> + '_ {
        self.python_tags
            .iter()
            .cartesian_product(self.abi_tags.iter())
            .cartesian_product(self.platform_tags.iter())
            .map(|((py, abi), plat)| (py.as_str(), abi.as_str(), plat.as_str()))
    }

    /// The compressed tag part of the filename, e.g. `py3-none-any`.
    pub fn tag_string(&self) -> String {
        format!(
            "{}-{}-{}",
            self.python_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        )
    }

    /// Whether the wheel only contains pure python code.
    pub fn is_pure(&self) -> bool {
        self.platform_tags.iter().all(|tag| tag == "any")
            && self.abi_tags.iter().all(|tag| tag == "none")
    }
}

impl FromStr for WheelFilename {
    type Err = WheelFilenameError;

    fn from_str(filename: &str) -> Result<Self, Self::Err> {
        let stem = filename
            .strip_suffix(consts::WHEEL_EXTENSION)
            .ok_or_else(|| WheelFilenameError::InvalidExtension(filename.to_string()))?;

        let parts: Vec<&str> = stem.split('-').collect();
        let (distribution, version, build_tag, py, abi, plat) = match parts.as_slice() {
            [distribution, version, py, abi, plat] => {
                (*distribution, *version, None, *py, *abi, *plat)
            }
            [distribution, version, build, py, abi, plat] => {
                if !build.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(WheelFilenameError::InvalidBuildTag(filename.to_string()));
                }
                (*distribution, *version, Some(build.to_string()), *py, *abi, *plat)
            }
            _ => return Err(WheelFilenameError::InvalidParts(filename.to_string())),
        };

        if [distribution, version, py, abi, plat]
            .iter()
            .any(|part| part.is_empty())
        {
            return Err(WheelFilenameError::InvalidParts(filename.to_string()));
        }

        let version =
            Version::from_str(version).map_err(|err| WheelFilenameError::InvalidVersion {
                filename: filename.to_string(),
                message: err.to_string(),
            })?;

        let split_tags = |tags: &str| tags.split('.').map(str::to_string).collect::<Vec<_>>();

        Ok(Self {
            distribution: distribution.to_string(),
            version,
            build_tag,
            python_tags: split_tags(py),
            abi_tags: split_tags(abi),
            platform_tags: split_tags(plat),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution, self.version)?;
        if let Some(build_tag) = &self.build_tag {
            write!(f, "-{build_tag}")?;
        }
        write!(f, "-{}{}", self.tag_string(), consts::WHEEL_EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_simple() {
        let filename = WheelFilename::from_str("requests-2.32.3-py3-none-any.whl").unwrap();
        assert_eq!(filename.distribution, "requests");
        assert_eq!(filename.version, Version::from_str("2.32.3").unwrap());
        assert_eq!(filename.build_tag, None);
        assert_eq!(filename.tag_string(), "py3-none-any");
        assert!(filename.is_pure());
    }

    #[test]
    fn test_parse_compressed_tags_and_build() {
        let filename =
            WheelFilename::from_str("six-1.16.0-1-py2.py3-none-any.whl").unwrap();
        assert_eq!(filename.build_tag.as_deref(), Some("1"));
        assert_eq!(filename.python_tags, vec!["py2", "py3"]);
        assert_eq!(filename.tags().count(), 2);
        assert_eq!(filename.to_string(), "six-1.16.0-1-py2.py3-none-any.whl");
    }

    #[test]
    fn test_parse_platform_wheel() {
        let filename = WheelFilename::from_str(
            "numpy-2.1.0-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl",
        )
        .unwrap();
        assert_eq!(filename.platform_tags.len(), 2);
        assert!(!filename.is_pure());
    }

    #[rstest]
    #[case("requests-2.32.3.tar.gz")]
    #[case("requests-py3-none-any.whl")]
    #[case("requests-2.32.3-x1-py3-none-any.whl")]
    #[case("requests-not.a.version!-py3-none-any.whl")]
    #[case("a-b-c-d-e-f-g.whl")]
    fn test_invalid(#[case] input: &str) {
        assert!(WheelFilename::from_str(input).is_err());
    }
}
