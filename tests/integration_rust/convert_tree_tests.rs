use std::{
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use conda_pypi::{
    ConvertTree, ConvertTreeError, ConvertTreeOptions,
    channel::{ChannelSource, LocalChannel, RepoDataExt},
    config::{Config, MappingSourceName, NameMappingConfig},
    fetch::{FetchError, WheelFetcher},
    mapping::{MappingEntry, NameMapping},
    solve::{CondaSolver, InstalledPackage, Solution, SolveError},
};
use pep508_rs::Requirement;

use crate::{
    common::{Setup, install_record, python_prefix},
    setup_tracing,
};

fn specs(specs: &[&str]) -> Vec<String> {
    specs.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn test_convert_tree_fetches_missing_packages() {
    setup_tracing();
    let setup = Setup::new();
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());

    let result = tree.convert_tree(&specs(&["demo-pkg"])).await.unwrap();

    // The request, then its unsatisfied dependency, then the solve succeeds.
    assert_eq!(result.attempts, 3);
    assert_eq!(result.fetched, specs(&["demo-pkg", "tomli >=2"]));
    assert_eq!(
        result
            .converted
            .iter()
            .map(|package| package.metadata.index.name.as_normalized())
            .collect::<Vec<_>>(),
        vec!["demo-pkg", "tomli"]
    );

    let local_url = tree.local_channel().url().unwrap().to_string();
    let demo = result.solution.get("demo-pkg").unwrap();
    assert_eq!(demo.channel, local_url);
    assert_eq!(result.solution.get("tomli").unwrap().channel, local_url);
    let requests = result.solution.get("requests").unwrap();
    assert_eq!(requests.channel, setup.conda_forge.path().display().to_string());
    assert_eq!(requests.version().as_str(), "2.32.3");

    let repodata = LocalChannel::new(setup.local_channel_dir()).repodata().unwrap();
    assert_eq!(repodata.len(), 2);

    assert_eq!(result.install.specs, specs(&["demo-pkg"]));
    assert_eq!(result.install.local_channel.to_string(), local_url);
}

#[tokio::test]
async fn test_convert_tree_reuses_local_channel() {
    setup_tracing();
    let setup = Setup::new();
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());
    tree.convert_tree(&specs(&["demo-pkg"])).await.unwrap();

    let result = tree.convert_tree(&specs(&["demo-pkg"])).await.unwrap();
    assert_eq!(result.attempts, 1);
    assert!(result.fetched.is_empty());
    assert!(result.converted.is_empty());
}

#[tokio::test]
async fn test_convert_tree_without_progress() {
    setup_tracing();
    let setup = Setup::new();
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());

    let err = tree.convert_tree(&specs(&["ghost"])).await.unwrap_err();
    match err {
        ConvertTreeError::NoProgress { missing } => assert_eq!(missing, specs(&["ghost"])),
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_convert_tree_missing_prefix() {
    setup_tracing();
    let setup = Setup::new();
    let mut tree_prefix = setup.workdir.path().to_path_buf();
    tree_prefix.push("does-not-exist");
    let tree = ConvertTree::new(
        tree_prefix,
        LocalChannel::new(setup.local_channel_dir()),
        crate::common::finder(setup.pypi.path()),
        crate::common::solver(),
        NameMapping::default(),
        setup.default_options(),
    );

    let err = tree.convert_tree(&specs(&["demo-pkg"])).await.unwrap_err();
    assert!(matches!(err, ConvertTreeError::PrefixNotFound(_)));
    assert!(!setup.local_channel_dir().exists());
}

#[tokio::test]
async fn test_convert_tree_fetch_requested_first_keeps_pypi_name() {
    setup_tracing();
    let setup = Setup::new();
    let mapping = NameMapping::from_entries([MappingEntry {
        pypi_name: "torch".to_string(),
        conda_name: "pytorch".to_string(),
        import_name: Some("torch".to_string()),
        mapping_source: Some("regro-bot".to_string()),
        version_constraint: None,
    }]);
    let options = ConvertTreeOptions {
        fetch_requested_first: true,
        ..setup.default_options()
    };
    let tree = setup.convert_tree(mapping, options);

    let result = tree.convert_tree(&specs(&["torch"])).await.unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(result.fetched, specs(&["torch"]));
    assert!(result.solution.get("pytorch").is_none());
    assert_eq!(
        result.solution.get("torch").unwrap().channel,
        tree.local_channel().url().unwrap().to_string()
    );
}

#[tokio::test]
async fn test_convert_tree_override_channels() {
    setup_tracing();
    let setup = Setup::new();
    let options = ConvertTreeOptions {
        override_channels: true,
        ..setup.default_options()
    };
    let tree = setup.convert_tree(NameMapping::default(), options);

    // Only the local channel is consulted, python is already installed but
    // nothing provides it.
    let err = tree.convert_tree(&specs(&["tomli"])).await.unwrap_err();
    match err {
        ConvertTreeError::NoProgress { missing } => {
            assert!(missing.iter().any(|spec| spec.starts_with("python")));
        }
        err => panic!("unexpected error: {err}"),
    }
}

/// A solver that never succeeds and reports a new missing dependency on
/// every call.
#[derive(Default)]
struct EndlessSolver {
    calls: AtomicUsize,
}

#[async_trait]
impl CondaSolver for EndlessSolver {
    async fn solve(
        &self,
        _specs: &[String],
        _channels: &[ChannelSource],
        _installed: &[InstalledPackage],
    ) -> Result<Solution, SolveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SolveError::Unsatisfiable {
            message: format!("nothing provides dep-{call} needed by root-1.0-0"),
        })
    }
}

/// Records the requirements it was asked for, never provides a wheel.
#[derive(Default)]
struct RecordingFetcher {
    requested: Mutex<Vec<String>>,
}

#[async_trait]
impl WheelFetcher for RecordingFetcher {
    async fn fetch(&self, requirement: &Requirement, _dest: &Path) -> Result<PathBuf, FetchError> {
        self.requested.lock().unwrap().push(requirement.to_string());
        Err(FetchError::NoMatchingWheel(requirement.to_string()))
    }
}

#[tokio::test]
async fn test_convert_tree_max_attempts() {
    setup_tracing();
    let setup = Setup::new();
    let options = ConvertTreeOptions {
        max_attempts: 3,
        ..setup.default_options()
    };
    let tree = ConvertTree::new(
        setup.prefix.path().to_path_buf(),
        LocalChannel::new(setup.local_channel_dir()),
        RecordingFetcher::default(),
        EndlessSolver::default(),
        NameMapping::default(),
        options,
    );

    let err = tree.convert_tree(&specs(&["root"])).await.unwrap_err();
    match err {
        ConvertTreeError::MaxAttempts {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, Some(SolveError::Unsatisfiable { .. })));
        }
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test]
async fn test_convert_tree_from_config() {
    setup_tracing();
    let prefix = python_prefix("3.11.9");
    let channel_dir = tempfile::TempDir::new().unwrap();
    let config = Config {
        channels: vec!["bioconda".to_string()],
        local_channel: Some(channel_dir.path().to_path_buf()),
        max_attempts: Some(7),
        name_mapping: NameMappingConfig {
            sources: vec![MappingSourceName::Bundled],
            offline: Some(true),
            ..NameMappingConfig::default()
        },
        ..Config::default()
    };

    let tree = ConvertTree::from_config(&config, prefix.path()).await.unwrap();
    assert_eq!(tree.local_channel().root(), channel_dir.path());
    assert_eq!(tree.mapping().pypi_to_conda_name("torch", false), "pytorch");

    let options = ConvertTreeOptions::from_config(&config);
    assert_eq!(options.channels, vec!["bioconda".to_string()]);
    assert_eq!(options.max_attempts, 7);
    assert!(!options.override_channels);
}

#[tokio::test]
async fn test_convert_packages_without_dependencies() {
    setup_tracing();
    let setup = Setup::new();
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());

    let converted = tree
        .convert_packages(&specs(&["demo-pkg", "ghost"]), None)
        .await
        .unwrap();

    // Only the request is converted, its `tomli` dependency is not.
    assert_eq!(converted.len(), 1);
    assert_eq!(converted[0].metadata.index.name.as_normalized(), "demo-pkg");
    assert_eq!(
        converted[0].path.parent().unwrap(),
        tree.local_channel().noarch_dir()
    );
    let repodata = LocalChannel::new(setup.local_channel_dir()).repodata().unwrap();
    assert_eq!(repodata.len(), 1);
}

#[tokio::test]
async fn test_convert_packages_into_output_dir() {
    setup_tracing();
    let setup = Setup::new();
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());
    let output_dir = setup.workdir.path().join("out");

    let converted = tree
        .convert_packages(&specs(&["tomli"]), Some(&output_dir))
        .await
        .unwrap();

    assert_eq!(converted.len(), 1);
    assert_eq!(
        converted[0].path,
        output_dir.join("tomli-2.0.1-pypi_0.conda")
    );
    assert!(converted[0].path.is_file());
    assert!(!setup.local_channel_dir().exists());
}

#[tokio::test]
async fn test_convert_packages_missing_prefix() {
    setup_tracing();
    let setup = Setup::new();
    let tree = ConvertTree::new(
        setup.workdir.path().join("does-not-exist"),
        LocalChannel::new(setup.local_channel_dir()),
        crate::common::finder(setup.pypi.path()),
        crate::common::solver(),
        NameMapping::default(),
        setup.default_options(),
    );

    let err = tree
        .convert_packages(&specs(&["tomli"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertTreeError::PrefixNotFound(_)));
}

#[test]
fn test_filter_installed_uses_name_variants() {
    setup_tracing();
    let setup = Setup::new();
    install_record(setup.prefix.path(), "typing_extensions", "4.12.2", "pyha770c72_0");
    let tree = setup.convert_tree(NameMapping::default(), setup.default_options());

    let remaining = tree
        .filter_installed(&specs(&[
            "typing-extensions",
            "python >=3.12",
            "python <3",
            "demo-pkg",
        ]))
        .unwrap();
    assert_eq!(remaining, specs(&["python <3", "demo-pkg"]));
}

#[test]
fn test_filter_installed_requires_python() {
    setup_tracing();
    let setup = Setup::new();
    let prefix = tempfile::TempDir::new().unwrap();
    install_record(prefix.path(), "zlib", "1.3.1", "h_0");
    let tree = ConvertTree::new(
        prefix.path().to_path_buf(),
        LocalChannel::new(setup.local_channel_dir()),
        crate::common::finder(setup.pypi.path()),
        crate::common::solver(),
        NameMapping::default(),
        setup.default_options(),
    );

    let err = tree.filter_installed(&specs(&["tomli"])).unwrap_err();
    assert!(matches!(err, ConvertTreeError::PythonNotInstalled(_)));
}
