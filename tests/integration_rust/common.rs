//! Fixtures shared by the integration tests: a fake prefix, a conda channel
//! and a find-links directory standing in for PyPI.

use std::path::{Path, PathBuf};

use conda_pypi::{
    ConvertTree, ConvertTreeOptions,
    channel::LocalChannel,
    config::Config,
    fetch::{PackageFinder, TargetPython},
    mapping::NameMapping,
    solve::RepodataSolver,
};
use conda_pypi_test_utils::{
    mock_repo_data::{MockChannel, MockRepoData, Package},
    pypi_index::{Database, FlatIndex, PyPIPackage},
};
use tempfile::TempDir;

/// A prefix with a `conda-meta` record for python.
pub fn python_prefix(version: &str) -> TempDir {
    let prefix = TempDir::new().unwrap();
    install_record(prefix.path(), "python", version, "h_0");
    prefix
}

/// Writes a `conda-meta` record as if the package was installed.
pub fn install_record(prefix: &Path, name: &str, version: &str, build: &str) {
    let conda_meta = prefix.join("conda-meta");
    fs_err::create_dir_all(&conda_meta).unwrap();
    let record = serde_json::json!({
        "name": name,
        "version": version,
        "build": build,
        "build_number": 0,
    });
    fs_err::write(
        conda_meta.join(format!("{name}-{version}-{build}.json")),
        serde_json::to_string_pretty(&record).unwrap(),
    )
    .unwrap();
}

/// A channel that provides python and requests, but nothing from PyPI only.
pub fn conda_forge() -> MockChannel {
    MockRepoData::default()
        .with_package(Package::build("python", "3.12.4").with_build("h_0").finish())
        .with_package(
            Package::build("requests", "2.32.3")
                .with_dependency("python >=3.8")
                .finish(),
        )
        .into_channel()
        .unwrap()
}

/// Wheels that only exist on "PyPI".
pub fn pypi() -> FlatIndex {
    Database::new()
        .with(
            PyPIPackage::new("demo-pkg", "1.0")
                .with_requires_dist(["requests>=2", "tomli>=2"])
                .with_console_script("demo", "demo_pkg:main"),
        )
        .with(PyPIPackage::new("tomli", "2.0.1").with_requires_python(">=3.8"))
        .with(PyPIPackage::new("torch", "2.3.1"))
        .into_flat_index()
        .unwrap()
}

pub fn finder(find_links: &Path) -> PackageFinder {
    let (_, client) =
        conda_pypi_utils::reqwest::build_reqwest_clients(Some(&Config::default())).unwrap();
    PackageFinder::new(client, TargetPython::new(3, 12, 4))
        .with_index_urls(vec![])
        .with_find_links(vec![find_links.to_path_buf()])
}

pub fn solver() -> RepodataSolver {
    let (_, client) =
        conda_pypi_utils::reqwest::build_reqwest_clients(Some(&Config::default())).unwrap();
    RepodataSolver::new(client)
}

pub fn options(channels: &[&Path]) -> ConvertTreeOptions {
    ConvertTreeOptions {
        channels: channels
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        max_attempts: 5,
        concurrent_downloads: 4,
        ..ConvertTreeOptions::default()
    }
}

/// Everything a resolution needs, kept alive for the duration of a test.
pub struct Setup {
    pub prefix: TempDir,
    pub conda_forge: MockChannel,
    pub pypi: FlatIndex,
    pub workdir: TempDir,
}

impl Setup {
    pub fn new() -> Self {
        Self {
            prefix: python_prefix("3.12.4"),
            conda_forge: conda_forge(),
            pypi: pypi(),
            workdir: TempDir::new().unwrap(),
        }
    }

    pub fn local_channel_dir(&self) -> PathBuf {
        self.workdir.path().join("local-channel")
    }

    pub fn convert_tree(
        &self,
        mapping: NameMapping,
        options: ConvertTreeOptions,
    ) -> ConvertTree<PackageFinder, RepodataSolver> {
        ConvertTree::new(
            self.prefix.path().to_path_buf(),
            LocalChannel::new(self.local_channel_dir()),
            finder(self.pypi.path()),
            solver(),
            mapping,
            options,
        )
    }

    pub fn default_options(&self) -> ConvertTreeOptions {
        options(&[self.conda_forge.path()])
    }
}
