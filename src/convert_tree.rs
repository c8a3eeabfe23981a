use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};

use conda_pypi_channel::{ChannelError, ChannelLocation, ChannelSource, LocalChannel};
use conda_pypi_config::Config;
use conda_pypi_consts::consts::{self, PypiEmoji};
use conda_pypi_fetch::{PackageFinder, TargetPython, WheelFetcher};
use conda_pypi_mapping::{MappingClient, MappingSource, NameMapping, spec_name_variants};
use conda_pypi_solve::{
    CondaSolver, InstalledPackage, RepodataSolver, Solution, SolveError,
    parse_unsatisfiable_message,
};
use conda_pypi_wheel::{ConvertOptions, ConvertedPackage, conda_to_requires, convert_wheel};
use futures::{StreamExt, stream};
use itertools::Itertools;
use miette::{Diagnostic, IntoDiagnostic};
use thiserror::Error;
use url::Url;

use crate::InstallRequest;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvertTreeError {
    #[error("the prefix {} does not exist", .0.display())]
    PrefixNotFound(PathBuf),
    #[error("the prefix {} has no python installed", .0.display())]
    #[diagnostic(help("install python into the prefix first"))]
    PythonNotInstalled(PathBuf),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Solve(#[from] SolveError),
    #[error("could not resolve {}: nothing new to fetch from PyPI", .missing.iter().join(", "))]
    #[diagnostic(help("the missing packages could not be found on PyPI either"))]
    NoProgress { missing: Vec<String> },
    #[error("exceeded the maximum of {attempts} attempts")]
    #[diagnostic(help("increase `max-attempts` in the configuration"))]
    MaxAttempts {
        attempts: usize,
        #[source]
        last_error: Option<SolveError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Settings of the hybrid resolution loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertTreeOptions {
    /// Channels consulted after the local channel.
    pub channels: Vec<String>,
    pub channel_alias: Url,
    /// Only solve against the local channel.
    pub override_channels: bool,
    pub max_attempts: usize,
    /// Fetch and convert the requested packages before the first solve.
    pub fetch_requested_first: bool,
    pub concurrent_downloads: usize,
}

impl Default for ConvertTreeOptions {
    fn default() -> Self {
        Self {
            channels: consts::DEFAULT_CHANNELS
                .iter()
                .map(ToString::to_string)
                .collect(),
            channel_alias: consts::DEFAULT_CHANNEL_ALIAS.clone(),
            override_channels: false,
            max_attempts: consts::DEFAULT_MAX_ATTEMPTS,
            fetch_requested_first: false,
            concurrent_downloads: consts::DEFAULT_CONCURRENT_DOWNLOADS,
        }
    }
}

impl ConvertTreeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channels: config.channels(),
            channel_alias: config.channel_alias(),
            override_channels: config.override_channels(),
            max_attempts: config.max_attempts(),
            fetch_requested_first: config.fetch_requested_first(),
            concurrent_downloads: config.max_concurrent_downloads(),
        }
    }
}

/// The outcome of a successful [`ConvertTree::convert_tree`].
#[derive(Debug, Clone)]
pub struct ConvertTreeResult {
    pub solution: Solution,
    /// The specs that were looked up on PyPI.
    pub fetched: Vec<String>,
    pub converted: Vec<ConvertedPackage>,
    pub attempts: usize,
    pub install: InstallRequest,
}

/// Resolves a request conda-first and converts whatever is missing from the
/// conda channels from PyPI wheels into the local channel.
pub struct ConvertTree<F, S> {
    prefix: PathBuf,
    channel: LocalChannel,
    fetcher: F,
    solver: S,
    mapping: NameMapping,
    options: ConvertTreeOptions,
}

impl ConvertTree<PackageFinder, RepodataSolver> {
    /// Sets up fetching from the configured PyPI indexes and solving with
    /// the [`RepodataSolver`] for the python found in `prefix`.
    pub async fn from_config(config: &Config, prefix: &Path) -> miette::Result<Self> {
        let (_, client) = conda_pypi_utils::reqwest::build_reqwest_clients(Some(config))?;

        let target = TargetPython::from_prefix(prefix)?;
        tracing::info!("converting for python {target} in {}", prefix.display());
        let fetcher = PackageFinder::from_config(client.clone(), target, config.pypi_config());
        let solver = RepodataSolver::new(client.clone());

        let sources = MappingSource::from_config(config.name_mapping());
        let mapping = MappingClient::new(client)
            .load(&sources)
            .await
            .into_diagnostic()?;

        Ok(Self::new(
            prefix.to_path_buf(),
            LocalChannel::new(config.local_channel()?),
            fetcher,
            solver,
            mapping,
            ConvertTreeOptions::from_config(config),
        ))
    }
}

impl<F: WheelFetcher, S: CondaSolver> ConvertTree<F, S> {
    pub fn new(
        prefix: PathBuf,
        channel: LocalChannel,
        fetcher: F,
        solver: S,
        mapping: NameMapping,
        options: ConvertTreeOptions,
    ) -> Self {
        Self {
            prefix,
            channel,
            fetcher,
            solver,
            mapping,
            options,
        }
    }

    pub fn local_channel(&self) -> &LocalChannel {
        &self.channel
    }

    pub fn mapping(&self) -> &NameMapping {
        &self.mapping
    }

    /// The local channel followed by the configured channels, unless
    /// channels are overridden.
    fn channels(&self) -> Result<Vec<ChannelSource>, ChannelError> {
        let mut channels = vec![ChannelSource {
            name: self.channel.url()?.to_string(),
            location: ChannelLocation::Path(self.channel.root().to_path_buf()),
        }];
        if !self.options.override_channels {
            for channel in &self.options.channels {
                channels.push(ChannelSource::parse(channel, &self.options.channel_alias)?);
            }
        }
        Ok(channels)
    }

    /// Solves `requested` against the local channel and the configured
    /// channels, fetching and converting wheels from PyPI until the solve
    /// succeeds.
    pub async fn convert_tree(
        &self,
        requested: &[String],
    ) -> Result<ConvertTreeResult, ConvertTreeError> {
        if !self.prefix.is_dir() {
            return Err(ConvertTreeError::PrefixNotFound(self.prefix.clone()));
        }

        let was_indexed = self.channel.is_indexed();
        let channel = LocalChannel::ensure(self.channel.root())?;
        if !was_indexed {
            channel.reindex()?;
        }

        let channels = self.channels()?;
        let installed = InstalledPackage::from_prefix(&self.prefix)?;
        let wheel_dir = tempfile::Builder::new().prefix("wheels").tempdir()?;

        let mut fetched: BTreeSet<String> = BTreeSet::new();
        let mut converted: HashSet<PathBuf> = HashSet::new();
        let mut converted_packages = Vec::new();

        if self.options.fetch_requested_first {
            tracing::info!("fetching the requested packages from PyPI first");
            let requested_set: BTreeSet<String> = requested.iter().cloned().collect();
            self.fetch_all(&requested_set, wheel_dir.path()).await;
            fetched.extend(requested_set);
            converted_packages.extend(self.convert_new_wheels(
                wheel_dir.path(),
                &channel.noarch_dir(),
                &mut converted,
                true,
            )?);
            channel.reindex()?;
        }

        let mut missing: BTreeSet<String> = BTreeSet::new();
        let mut last_error = None;
        let mut attempts = 0;
        while attempts < self.options.max_attempts && fetched.len() < self.options.max_attempts {
            attempts += 1;
            tracing::debug!("solve attempt {attempts} of {}", self.options.max_attempts);

            match self.solver.solve(requested, &channels, &installed).await {
                Ok(solution) => {
                    tracing::info!("solved after {attempts} attempt(s)");
                    return Ok(ConvertTreeResult {
                        install: self.install_request(requested)?,
                        solution,
                        fetched: fetched.into_iter().collect(),
                        converted: converted_packages,
                        attempts,
                    });
                }
                Err(SolveError::PackagesNotFound(packages)) => {
                    tracing::debug!("missing packages: {}", packages.join(", "));
                    missing = packages.iter().cloned().collect();
                    last_error = Some(SolveError::PackagesNotFound(packages));
                }
                Err(SolveError::Unsatisfiable { message }) => {
                    tracing::warn!("unsatisfiable: {message}");
                    missing.extend(parse_unsatisfiable_message(&message));
                    last_error = Some(SolveError::Unsatisfiable { message });
                }
                Err(err) => return Err(err.into()),
            }

            let new: BTreeSet<String> = missing.difference(&fetched).cloned().collect();
            if new.is_empty() {
                return Err(ConvertTreeError::NoProgress {
                    missing: missing.into_iter().collect(),
                });
            }

            self.fetch_all(&new, wheel_dir.path()).await;
            fetched.extend(new);

            converted_packages.extend(self.convert_new_wheels(
                wheel_dir.path(),
                &channel.noarch_dir(),
                &mut converted,
                false,
            )?);
            channel.reindex()?;
        }

        tracing::error!("exceeded maximum of {} attempts", self.options.max_attempts);
        Err(ConvertTreeError::MaxAttempts {
            attempts: self.options.max_attempts,
            last_error,
        })
    }

    /// Converts only the requested packages, without resolving or converting
    /// their dependencies.
    ///
    /// The archives are written to `output_dir`, or into the local channel
    /// which is then reindexed. Packages that could not be fetched or
    /// converted are logged and left out of the result.
    pub async fn convert_packages(
        &self,
        requested: &[String],
        output_dir: Option<&Path>,
    ) -> Result<Vec<ConvertedPackage>, ConvertTreeError> {
        if !self.prefix.is_dir() {
            return Err(ConvertTreeError::PrefixNotFound(self.prefix.clone()));
        }

        let (channel, output_dir) = match output_dir {
            Some(output_dir) => {
                fs_err::create_dir_all(output_dir)?;
                (None, output_dir.to_path_buf())
            }
            None => {
                let channel = LocalChannel::ensure(self.channel.root())?;
                let noarch_dir = channel.noarch_dir();
                (Some(channel), noarch_dir)
            }
        };

        let wheel_dir = tempfile::Builder::new().prefix("wheels").tempdir()?;
        let specs: BTreeSet<String> = requested.iter().cloned().collect();
        self.fetch_all(&specs, wheel_dir.path()).await;

        let packages =
            self.convert_new_wheels(wheel_dir.path(), &output_dir, &mut HashSet::new(), true)?;
        if let Some(channel) = channel {
            channel.reindex()?;
        }
        Ok(packages)
    }

    /// Drops the requested specs that a package in the prefix already
    /// satisfies under any of its name variants.
    ///
    /// Fails when the prefix does not exist or has no python installed.
    pub fn filter_installed(&self, requested: &[String]) -> Result<Vec<String>, ConvertTreeError> {
        if !self.prefix.is_dir() {
            return Err(ConvertTreeError::PrefixNotFound(self.prefix.clone()));
        }
        let installed = InstalledPackage::from_prefix(&self.prefix)?;
        if !installed.iter().any(|package| package.name == "python") {
            return Err(ConvertTreeError::PythonNotInstalled(self.prefix.clone()));
        }

        Ok(requested
            .iter()
            .filter(|spec| {
                let satisfied = spec_name_variants(spec).iter().any(|variant| {
                    installed.iter().any(|package| package.satisfies(variant))
                });
                if satisfied {
                    tracing::info!("package {spec} is already installed; ignoring");
                }
                !satisfied
            })
            .cloned()
            .collect())
    }

    /// Fetches a wheel for every spec, failures are logged and skipped.
    async fn fetch_all(&self, specs: &BTreeSet<String>, wheel_dir: &Path) {
        stream::iter(specs.iter())
            .map(|spec| async move {
                let Some(requirement) = conda_to_requires(spec, &self.mapping) else {
                    tracing::warn!("could not translate '{spec}' into a python requirement");
                    return;
                };
                tracing::info!("{PypiEmoji} fetching {requirement} for '{spec}'");
                if let Err(err) = self.fetcher.fetch(&requirement, wheel_dir).await {
                    tracing::warn!("could not fetch '{spec}': {err}");
                }
            })
            .buffer_unordered(self.options.concurrent_downloads.max(1))
            .collect::<Vec<()>>()
            .await;
    }

    /// Converts the wheels in `wheel_dir` that were not converted before
    /// into `output_dir`.
    fn convert_new_wheels(
        &self,
        wheel_dir: &Path,
        output_dir: &Path,
        converted: &mut HashSet<PathBuf>,
        skip_name_mapping: bool,
    ) -> Result<Vec<ConvertedPackage>, ConvertTreeError> {
        let wheels = fs_err::read_dir(wheel_dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "whl"))
            .filter(|path| !converted.contains(path))
            .sorted()
            .collect_vec();

        let options = ConvertOptions {
            skip_name_mapping,
            ..ConvertOptions::default()
        };
        let mut packages = Vec::new();
        for wheel in wheels {
            tracing::info!("converting {}", wheel.display());
            match convert_wheel(&wheel, output_dir, &self.mapping, &options) {
                Ok(package) => {
                    if package.reused {
                        tracing::info!(
                            "{} was already converted",
                            package.metadata.file_name()
                        );
                    }
                    packages.push(package);
                }
                Err(err) => tracing::warn!("could not convert {}: {err}", wheel.display()),
            }
            converted.insert(wheel);
        }
        Ok(packages)
    }

    fn install_request(&self, requested: &[String]) -> Result<InstallRequest, ChannelError> {
        Ok(InstallRequest {
            prefix: self.prefix.clone(),
            local_channel: self.channel.url()?,
            channels: if self.options.override_channels {
                Vec::new()
            } else {
                self.options.channels.clone()
            },
            override_channels: self.options.override_channels,
            specs: requested.to_vec(),
        })
    }
}
