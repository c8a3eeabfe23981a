use std::{
    collections::BTreeSet as Set,
    path::{Path, PathBuf},
    str::FromStr,
};

use conda_pypi_consts::consts;
use itertools::Itertools;
use miette::IntoDiagnostic;
use serde::{
    Deserialize, Serialize,
    de::{Error, IntoDeserializer},
};
use url::Url;

/// The known sources of PyPI to conda name mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingSourceName {
    /// The mapping that ships with conda-pypi.
    Bundled,
    /// The mapping maintained by grayskull, it contains version delimiters.
    Grayskull,
    /// The mapping generated by the conda-forge bot.
    CfGraph,
    /// The mapping maintained by the parselmouth project.
    Parselmouth,
}

impl MappingSourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSourceName::Bundled => "bundled",
            MappingSourceName::Grayskull => "grayskull",
            MappingSourceName::CfGraph => "cf-graph",
            MappingSourceName::Parselmouth => "parselmouth",
        }
    }
}

impl FromStr for MappingSourceName {
    type Err = serde::de::value::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::deserialize(s.into_deserializer())
    }
}

impl std::fmt::Display for MappingSourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sources queried when no `name-mapping.sources` is configured. Grayskull
/// and cf-graph come first because they contain version delimiters.
pub fn default_mapping_sources() -> Vec<MappingSourceName> {
    vec![
        MappingSourceName::Bundled,
        MappingSourceName::Grayskull,
        MappingSourceName::CfGraph,
        MappingSourceName::Parselmouth,
    ]
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct NameMappingConfig {
    /// The ordered list of mapping sources, earlier sources win.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<MappingSourceName>,

    /// A user defined mapping in the grayskull json format, either a path or
    /// a url. It takes precedence over all other sources.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,

    /// Only consult the sources that do not require network access.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline: Option<bool>,
}

impl NameMappingConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            sources: if other.sources.is_empty() {
                self.sources
            } else {
                other.sources
            },
            custom: other.custom.or(self.custom),
            offline: other.offline.or(self.offline),
        }
    }

    /// The configured sources or the defaults.
    pub fn sources(&self) -> Vec<MappingSourceName> {
        if self.sources.is_empty() {
            default_mapping_sources()
        } else {
            self.sources.clone()
        }
    }

    pub fn offline(&self) -> bool {
        self.offline.unwrap_or(false)
    }

    fn is_default(&self) -> bool {
        self.sources.is_empty() && self.custom.is_none() && self.offline.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PyPIConfig {
    /// The default index url for PyPI packages.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_url: Option<Url>,

    /// A list of extra index urls for PyPI packages.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_index_urls: Vec<Url>,

    /// Local directories containing wheels that are searched next to the
    /// indexes.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub find_links: Vec<PathBuf>,

    /// Platform tags that are accepted next to `any`. Everything is packaged
    /// as `noarch` so this is empty unless explicitly configured.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platform_tags: Vec<String>,

    /// Whether yanked releases may be selected.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_yanked: Option<bool>,
}

impl PyPIConfig {
    /// Merge the given PyPIConfig into the current one.
    pub fn merge(self, other: Self) -> Self {
        Self {
            index_url: other.index_url.or(self.index_url),
            extra_index_urls: self
                .extra_index_urls
                .into_iter()
                .chain(other.extra_index_urls)
                .unique()
                .collect(),
            find_links: self
                .find_links
                .into_iter()
                .chain(other.find_links)
                .unique()
                .collect(),
            platform_tags: if other.platform_tags.is_empty() {
                self.platform_tags
            } else {
                other.platform_tags
            },
            allow_yanked: other.allow_yanked.or(self.allow_yanked),
        }
    }

    /// The index url, defaults to pypi.org.
    pub fn index_url(&self) -> Url {
        self.index_url
            .clone()
            .unwrap_or_else(|| consts::DEFAULT_PYPI_INDEX_URL.clone())
    }

    /// All index urls in the order they are queried.
    pub fn index_urls(&self) -> Vec<Url> {
        std::iter::once(self.index_url())
            .chain(self.extra_index_urls.iter().cloned())
            .collect()
    }

    pub fn allow_yanked(&self) -> bool {
        self.allow_yanked.unwrap_or(false)
    }

    fn is_default(&self) -> bool {
        self.index_url.is_none()
            && self.extra_index_urls.is_empty()
            && self.find_links.is_empty()
            && self.platform_tags.is_empty()
            && self.allow_yanked.is_none()
    }
}

/// The default maximum number of concurrent downloads that can be run at once.
fn default_max_concurrent_downloads() -> usize {
    consts::DEFAULT_CONCURRENT_DOWNLOADS
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ConcurrencyConfig {
    /// The maximum number of concurrent HTTP requests to make.
    // Needs its own default next to the struct default, otherwise serde uses
    // 0 when the table is present but the key is omitted.
    #[serde(default = "default_max_concurrent_downloads")]
    pub downloads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            downloads: default_max_concurrent_downloads(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn merge(self, other: Self) -> Self {
        Self {
            downloads: if other.downloads != ConcurrencyConfig::default().downloads {
                other.downloads
            } else {
                self.downloads
            },
        }
    }

    pub fn is_default(&self) -> bool {
        ConcurrencyConfig::default() == *self
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Channels that are queried after the local channel, in priority order.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// The url that is prepended to channel names that are not urls.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_alias: Option<Url>,

    /// Only use the local channel of converted packages. Everything that is
    /// missing is fetched from PyPI.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_channels: Option<bool>,

    /// The directory of the local channel that caches converted packages.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_channel: Option<PathBuf>,

    /// How often the resolver retries after fetching missing packages.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,

    /// Always fetch the explicitly requested packages from PyPI before the
    /// first solve.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_requested_first: Option<bool>,

    /// A credentials file in the rattler json format that replaces the
    /// default credential stores. Tokens are keyed by host.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_override_file: Option<PathBuf>,

    /// If set to true, the TLS certificates of servers are not verified.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_no_verify: Option<bool>,

    #[serde(default)]
    #[serde(skip_serializing_if = "PyPIConfig::is_default")]
    pub pypi_config: PyPIConfig,

    #[serde(default)]
    #[serde(skip_serializing_if = "NameMappingConfig::is_default")]
    pub name_mapping: NameMappingConfig,

    #[serde(default)]
    #[serde(skip_serializing_if = "ConcurrencyConfig::is_default")]
    pub concurrency: ConcurrencyConfig,

    #[serde(skip)]
    pub loaded_from: Vec<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no file was found at {0}")]
    FileNotFound(PathBuf),
    #[error("failed to read config from '{0}'")]
    ReadError(std::io::Error),
    #[error("failed to parse config of {1}: {0}")]
    ParseError(miette::Report, PathBuf),
    #[error("validation error of {1}: {0}")]
    ValidationError(miette::Report, PathBuf),
}

impl Config {
    /// Parse a config from a toml string.
    ///
    /// Returns the config together with the keys that were not recognized.
    pub fn from_toml(toml: &str) -> miette::Result<(Config, Set<String>)> {
        let de = toml_edit::de::Deserializer::from_str(toml).into_diagnostic()?;

        let mut unused_keys = Set::new();
        let config: Config = serde_ignored::deserialize(de, |path| {
            unused_keys.insert(path.to_string());
        })
        .into_diagnostic()?;

        Ok((config, unused_keys))
    }

    /// Load the config from the given path.
    pub fn from_path(path: &Path) -> Result<Config, ConfigError> {
        tracing::debug!("Loading config from {}", path.display());
        let s = match fs_err::read_to_string(path) {
            Ok(content) => content,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::NotADirectory =>
            {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::ReadError(e)),
        };

        let (mut config, unused_keys) =
            Config::from_toml(&s).map_err(|e| ConfigError::ParseError(e, path.to_path_buf()))?;

        if !unused_keys.is_empty() {
            tracing::warn!(
                "Ignoring '{}' in {}",
                console::style(unused_keys.iter().join(", ")).yellow(),
                path.display()
            );
        }

        config.loaded_from.push(path.to_path_buf());

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e, path.to_path_buf()))?;

        Ok(config)
    }

    /// Validate the config file.
    pub fn validate(&self) -> miette::Result<()> {
        if self.max_attempts == Some(0) {
            miette::bail!("'max-attempts' must be at least 1");
        }

        if self.concurrency.downloads == 0 {
            miette::bail!("'concurrency.downloads' must be at least 1");
        }

        if let Some(custom) = &self.name_mapping.custom
            && custom.trim().is_empty()
        {
            miette::bail!("'name-mapping.custom' must not be empty");
        }

        Ok(())
    }

    /// Load the global config file from the global config locations.
    pub fn load_global() -> Config {
        let mut config = Config::default();

        for p in config_path_global() {
            match Self::from_path(&p) {
                Ok(c) => config = config.merge_config(c),
                Err(ConfigError::FileNotFound(_)) => (),
                Err(e) => tracing::error!(
                    "Failed to load global config '{}' with error: {}",
                    p.display(),
                    e
                ),
            }
        }

        config
    }

    /// Load the global config and layer the config found in the given
    /// project root on top of it.
    pub fn load(project_root: &Path) -> Config {
        let mut config = Self::load_global();
        let local_config_path = project_root
            .join(consts::CONFIG_DIR)
            .join(consts::CONFIG_FILE);

        match Self::from_path(&local_config_path) {
            Ok(c) => config = config.merge_config(c),
            Err(e) => tracing::debug!(
                "Failed to load local config: {} (error: {})",
                local_config_path.display(),
                e
            ),
        }

        config
    }

    /// Merge the `other` config into `self`.
    /// The `other` config will have higher priority
    #[must_use]
    pub fn merge_config(self, mut other: Config) -> Self {
        other.loaded_from.extend(self.loaded_from);

        Self {
            channels: if other.channels.is_empty() {
                self.channels
            } else {
                other.channels
            },
            channel_alias: other.channel_alias.or(self.channel_alias),
            override_channels: other.override_channels.or(self.override_channels),
            local_channel: other.local_channel.or(self.local_channel),
            max_attempts: other.max_attempts.or(self.max_attempts),
            fetch_requested_first: other.fetch_requested_first.or(self.fetch_requested_first),
            authentication_override_file: other
                .authentication_override_file
                .or(self.authentication_override_file),
            tls_no_verify: other.tls_no_verify.or(self.tls_no_verify),
            pypi_config: self.pypi_config.merge(other.pypi_config),
            name_mapping: self.name_mapping.merge(other.name_mapping),
            concurrency: self.concurrency.merge(other.concurrency),
            loaded_from: other.loaded_from,
        }
    }

    /// The channels queried after the local channel (defaults to
    /// `["conda-forge"]`).
    pub fn channels(&self) -> Vec<String> {
        if self.channels.is_empty() {
            consts::DEFAULT_CHANNELS
                .iter()
                .map(|c| c.to_string())
                .collect()
        } else {
            self.channels.clone()
        }
    }

    pub fn channel_alias(&self) -> Url {
        self.channel_alias
            .clone()
            .unwrap_or_else(|| consts::DEFAULT_CHANNEL_ALIAS.clone())
    }

    pub fn override_channels(&self) -> bool {
        self.override_channels.unwrap_or(false)
    }

    /// The directory of the local channel, defaults to the `pypi` directory
    /// in the user data directory.
    pub fn local_channel(&self) -> miette::Result<PathBuf> {
        match &self.local_channel {
            Some(path) => Ok(path.clone()),
            None => default_local_channel_dir(),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts.unwrap_or(consts::DEFAULT_MAX_ATTEMPTS)
    }

    pub fn fetch_requested_first(&self) -> bool {
        self.fetch_requested_first.unwrap_or(false)
    }

    pub fn authentication_override_file(&self) -> Option<&PathBuf> {
        self.authentication_override_file.as_ref()
    }

    pub fn tls_no_verify(&self) -> bool {
        self.tls_no_verify.unwrap_or(false)
    }

    pub fn pypi_config(&self) -> &PyPIConfig {
        &self.pypi_config
    }

    pub fn name_mapping(&self) -> &NameMappingConfig {
        &self.name_mapping
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.concurrency.downloads
    }
}

/// Returns the directory that holds the local channel of converted packages.
pub fn default_local_channel_dir() -> miette::Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join(consts::LOCAL_CHANNEL_DIR))
        .ok_or_else(|| miette::miette!("could not determine the user data directory"))
}

/// Returns the path(s) to the global config file.
pub fn config_path_global() -> Vec<PathBuf> {
    vec![
        dirs::config_dir().map(|d| d.join(consts::APP_DIR_NAME).join(consts::CONFIG_FILE)),
        dirs::home_dir().map(|d| d.join(consts::CONFIG_DIR).join(consts::CONFIG_FILE)),
    ]
    .into_iter()
    .flatten()
    .collect()
}
