use std::str::FromStr;

use conda_pypi_consts::consts;
use conda_pypi_mapping::NameMapping;
use rattler_conda_types::{
    NoArchType, PackageName, VersionWithSource,
    package::{AboutJson, EntryPoint, IndexJson, LinkJson, NoArchLinks, PythonEntryPoints},
};
use url::Url;

use crate::{WheelError, metadata::WheelMetadata, requirements::requires_to_conda};

/// Everything needed to write the `info/` directory of a converted wheel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondaMetadata {
    pub index: IndexJson,
    pub about: AboutJson,
    /// Entries of the `console_scripts` group.
    pub console_scripts: Vec<EntryPoint>,
}

impl CondaMetadata {
    /// Builds conda metadata from wheel metadata.
    ///
    /// With `skip_name_mapping` the package keeps its PyPI name instead of the
    /// mapped conda name, used for packages explicitly requested from PyPI.
    /// Requirements behind an `extra` marker are stored per extra in the
    /// `extra_depends` field of `index.json`.
    pub fn from_wheel_metadata(
        metadata: &WheelMetadata,
        console_scripts: Vec<EntryPoint>,
        mapping: &NameMapping,
        skip_name_mapping: bool,
    ) -> Result<Self, WheelError> {
        let requirements = requires_to_conda(&metadata.requires_dist, mapping)?;

        let python = match &metadata.requires_python {
            Some(requires_python) => format!(
                "python {}",
                requires_python
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect::<String>()
            ),
            None => "python".to_string(),
        };

        let depends = std::iter::once(python)
            .chain(requirements.depends)
            .collect();

        let name = PackageName::try_from(mapping.pypi_to_conda_name(&metadata.name, skip_name_mapping))?;
        let version = VersionWithSource::from_str(&metadata.version)
            .map_err(|err| WheelError::InvalidVersion(metadata.version.clone(), err))?;
        let license = metadata.license().unwrap_or_default().to_string();

        let index = IndexJson {
            arch: None,
            build: format!("{}_0", consts::PYPI_BUILD_STRING),
            build_number: 0,
            constrains: Vec::new(),
            depends,
            experimental_extra_depends: requirements.extras,
            features: None,
            license: Some(license.clone()),
            license_family: Some(String::new()),
            name,
            noarch: NoArchType::python(),
            platform: None,
            purls: None,
            python_site_packages_path: None,
            subdir: Some(consts::NOARCH_SUBDIR.to_string()),
            timestamp: Some(chrono::Utc::now().into()),
            track_features: Vec::new(),
            version,
        };

        let about = AboutJson {
            channels: Vec::new(),
            description: metadata.description.clone(),
            dev_url: Vec::new(),
            doc_url: Vec::new(),
            extra: Default::default(),
            home: metadata
                .home()
                .and_then(|home| Url::parse(home).ok())
                .into_iter()
                .collect(),
            license: Some(license),
            license_family: None,
            source_url: None,
            summary: metadata.summary.clone(),
        };

        Ok(Self {
            index,
            about,
            console_scripts,
        })
    }

    /// `{name}-{version}-{build}`
    pub fn stem(&self) -> String {
        format!(
            "{}-{}-{}",
            self.index.name.as_normalized(),
            self.index.version,
            self.index.build
        )
    }

    /// The filename of the `.conda` archive of this package.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem(), consts::CONDA_PACKAGE_EXTENSION)
    }

    /// `info/link.json`, only written when the package has console scripts.
    pub fn link_json(&self) -> Option<LinkJson> {
        if self.console_scripts.is_empty() {
            return None;
        }
        Some(LinkJson {
            noarch: NoArchLinks::Python(PythonEntryPoints {
                entry_points: self.console_scripts.clone(),
            }),
            package_metadata_version: 1,
        })
    }
}

/// Reads the `console_scripts` group of an `entry_points.txt` file.
pub fn parse_console_scripts(entry_points: &str) -> Vec<EntryPoint> {
    let mut in_console_scripts = false;
    let mut scripts = Vec::new();
    for line in entry_points.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_console_scripts = section.trim() == "console_scripts";
            continue;
        }
        if !in_console_scripts {
            continue;
        }
        match EntryPoint::from_str(line) {
            Ok(entry_point) => scripts.push(entry_point),
            Err(err) => tracing::warn!("skipping console script '{line}': {err}"),
        }
    }
    scripts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> WheelMetadata {
        WheelMetadata::parse(
            b"Metadata-Version: 2.1
Name: zope.interface
Version: 6.0
Summary: Interfaces for Python
License: ZPL 2.1
Home-page: https://github.com/zopefoundation/zope.interface
Requires-Python: >= 3.7
Requires-Dist: setuptools
Requires-Dist: coverage >=5.0.3 ; extra == 'test'

Zope interfaces.
",
        )
        .unwrap()
    }

    #[test]
    fn test_from_wheel_metadata() {
        let conda = CondaMetadata::from_wheel_metadata(
            &metadata(),
            vec![],
            NameMapping::bundled(),
            false,
        )
        .unwrap();

        assert_eq!(conda.index.name.as_normalized(), "zope.interface");
        assert_eq!(conda.index.build, "pypi_0");
        assert_eq!(conda.index.depends, vec!["python >=3.7", "setuptools"]);
        assert_eq!(
            conda.index.experimental_extra_depends.get("test").unwrap(),
            &vec!["coverage >=5.0.3".to_string()]
        );
        assert!(conda.index.noarch.is_python());
        assert_eq!(conda.index.subdir.as_deref(), Some("noarch"));
        assert_eq!(conda.file_name(), "zope.interface-6.0-pypi_0.conda");
        assert_eq!(conda.about.summary.as_deref(), Some("Interfaces for Python"));
        assert_eq!(conda.about.description.as_deref(), Some("Zope interfaces."));
        assert_eq!(
            conda.about.home,
            vec![Url::parse("https://github.com/zopefoundation/zope.interface").unwrap()]
        );
        assert!(conda.link_json().is_none());
    }

    #[test]
    fn test_skip_name_mapping() {
        let conda = CondaMetadata::from_wheel_metadata(
            &metadata(),
            vec![],
            NameMapping::bundled(),
            true,
        )
        .unwrap();
        assert_eq!(conda.index.name.as_normalized(), "zope-interface");
    }

    #[test]
    fn test_index_json_serialization() {
        let mut conda = CondaMetadata::from_wheel_metadata(
            &metadata(),
            vec![EntryPoint::from_str("zope-cli = zope.interface.cli:main").unwrap()],
            NameMapping::bundled(),
            false,
        )
        .unwrap();
        conda.index.timestamp = chrono::DateTime::from_timestamp_millis(1700000000000).map(Into::into);

        insta::assert_json_snapshot!(conda.index, @r###"
        {
          "build": "pypi_0",
          "build_number": 0,
          "depends": [
            "python >=3.7",
            "setuptools"
          ],
          "extra_depends": {
            "test": [
              "coverage >=5.0.3"
            ]
          },
          "license": "ZPL 2.1",
          "license_family": "",
          "name": "zope.interface",
          "noarch": "python",
          "subdir": "noarch",
          "timestamp": 1700000000000,
          "version": "6.0"
        }
        "###);

        let link = serde_json::to_value(conda.link_json().unwrap()).unwrap();
        assert_eq!(
            link,
            serde_json::json!({
                "noarch": {
                    "entry_points": ["zope-cli = zope.interface.cli:main"],
                    "type": "python"
                },
                "package_metadata_version": 1
            })
        );
    }

    #[test]
    fn test_invalid_version() {
        let mut metadata = metadata();
        metadata.version = String::new();
        let err = CondaMetadata::from_wheel_metadata(&metadata, vec![], NameMapping::bundled(), false)
            .unwrap_err();
        assert!(matches!(err, WheelError::InvalidVersion(..)));
    }

    #[test]
    fn test_parse_console_scripts() {
        let entry_points = "
[console_scripts]
black = black:patched_main
blackd = blackd:patched_main [d]
broken = no_function

[gui_scripts]
gui = black.gui:main
";
        let scripts = parse_console_scripts(entry_points);
        assert_eq!(
            scripts.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "black = black:patched_main",
                "blackd = blackd:patched_main [d]"
            ]
        );
        assert_eq!(scripts[0].module, "black");
    }
}
