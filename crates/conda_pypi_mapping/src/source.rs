use std::{collections::HashMap, path::PathBuf};

use conda_pypi_config::{MappingSourceName, NameMappingConfig};
use conda_pypi_consts::consts;
use miette::Diagnostic;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{MappingEntry, NameMapping, canonicalize_name};

#[derive(Debug, Clone)]
pub enum MappingLocation {
    Path(PathBuf),
    Url(Url),
    Memory(NameMapping),
}

impl MappingLocation {
    /// Interprets `value` as a url when it has a `http`, `https` or `file`
    /// scheme and as a path otherwise.
    pub fn parse(value: &str) -> Self {
        match Url::parse(value) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => {
                MappingLocation::Url(url)
            }
            _ => MappingLocation::Path(PathBuf::from(value)),
        }
    }
}

/// A source of name mappings.
#[derive(Debug, Clone)]
pub enum MappingSource {
    /// The mapping embedded in this crate.
    Bundled,
    /// The grayskull strategy config, keyed by PyPI name with a `conda_forge`
    /// field and optional version delimiters.
    Grayskull,
    /// The mapping generated by the conda-forge bot, keyed by PyPI name with a
    /// `conda_name` field.
    CfGraph,
    /// The parselmouth json mapping of conda names to PyPI names.
    Parselmouth,
    /// A user provided mapping in the grayskull json format.
    Custom(MappingLocation),
    Disabled,
}

impl MappingSource {
    /// The sources described by the configuration in priority order.
    pub fn from_config(config: &NameMappingConfig) -> Vec<MappingSource> {
        let custom = config
            .custom
            .as_deref()
            .map(|custom| MappingSource::Custom(MappingLocation::parse(custom)));

        let named = config.sources().into_iter().filter_map(|name| match name {
            MappingSourceName::Bundled => Some(MappingSource::Bundled),
            _ if config.offline() => None,
            MappingSourceName::Grayskull => Some(MappingSource::Grayskull),
            MappingSourceName::CfGraph => Some(MappingSource::CfGraph),
            MappingSourceName::Parselmouth => Some(MappingSource::Parselmouth),
        });

        custom.into_iter().chain(named).collect()
    }

    fn remote_url(&self) -> Option<&'static str> {
        match self {
            MappingSource::Grayskull => Some(consts::GRAYSKULL_MAPPING_URL),
            MappingSource::CfGraph => Some(consts::CF_GRAPH_MAPPING_URL),
            MappingSource::Parselmouth => Some(consts::PARSELMOUTH_MAPPING_URL),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum MappingError {
    #[error("failed to read the name mapping at {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Request(#[from] reqwest_middleware::Error),
    #[error("failed to parse the name mapping located at {0}, please make sure it is valid json")]
    InvalidJson(String, #[source] serde_json::Error),
    #[error("failed to parse the name mapping located at {0}")]
    InvalidYaml(String, #[source] serde_yaml::Error),
    #[error("{0} is not a valid file url")]
    InvalidFileUrl(Url),
}

/// A scalar in the yaml mappings, delimiters are sometimes written as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct YamlMappingEntry {
    #[serde(default)]
    conda_forge: Option<String>,
    #[serde(default)]
    conda_name: Option<String>,
    #[serde(default)]
    import_name: Option<String>,
    #[serde(default)]
    mapping_source: Option<String>,
    #[serde(default)]
    delimiter_min: Option<Scalar>,
    #[serde(default)]
    delimiter_max: Option<Scalar>,
}

/// Turns grayskull style version delimiters into a conda constraint.
fn delimiter_constraint(min: Option<Scalar>, max: Option<Scalar>) -> Option<String> {
    let parts: Vec<String> = [
        min.map(|min| format!(">={}", min.into_string())),
        max.map(|max| format!("<{}.0dev0", max.into_string())),
    ]
    .into_iter()
    .flatten()
    .collect();
    (!parts.is_empty()).then(|| parts.join(","))
}

/// Parses one of the yaml mappings. `name_key` selects the field that holds
/// the conda name. Entries that do not have it are skipped.
pub(crate) fn parse_yaml_mapping(
    content: &[u8],
    name_key: &str,
    source: &str,
) -> Result<NameMapping, serde_yaml::Error> {
    let raw: HashMap<String, serde_yaml::Value> = serde_yaml::from_slice(content)?;
    let mut entries = Vec::with_capacity(raw.len());
    for (pypi_name, value) in raw {
        let entry: YamlMappingEntry = match serde_yaml::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::trace!("skipping mapping entry for {pypi_name}: {err}");
                continue;
            }
        };
        let conda_name = match name_key {
            "conda_forge" => entry.conda_forge,
            _ => entry.conda_name,
        };
        let Some(conda_name) = conda_name else {
            continue;
        };
        entries.push(MappingEntry {
            pypi_name: canonicalize_name(&pypi_name),
            conda_name,
            import_name: entry.import_name,
            mapping_source: entry.mapping_source.or_else(|| Some(source.to_string())),
            version_constraint: delimiter_constraint(entry.delimiter_min, entry.delimiter_max),
        });
    }
    entries.sort_by(|a, b| a.pypi_name.cmp(&b.pypi_name));
    Ok(NameMapping::from_entries(entries))
}

/// Parses the parselmouth mapping which maps conda names to PyPI names.
pub(crate) fn parse_parselmouth_mapping(content: &str) -> Result<NameMapping, serde_json::Error> {
    let raw: HashMap<String, Option<String>> = serde_json::from_str(content)?;
    let mut entries: Vec<MappingEntry> = raw
        .into_iter()
        .filter_map(|(conda_name, pypi_name)| {
            Some(MappingEntry {
                pypi_name: canonicalize_name(&pypi_name?),
                conda_name,
                import_name: None,
                mapping_source: Some("parselmouth".to_string()),
                version_constraint: None,
            })
        })
        .collect();
    entries.sort_by(|a, b| {
        a.pypi_name
            .cmp(&b.pypi_name)
            .then_with(|| a.conda_name.cmp(&b.conda_name))
    });
    Ok(NameMapping::from_entries(entries))
}

/// Loads name mappings from their sources.
#[derive(Clone)]
pub struct MappingClient {
    client: ClientWithMiddleware,
}

impl MappingClient {
    pub fn new(client: ClientWithMiddleware) -> Self {
        Self { client }
    }

    /// Loads every source and layers them, earlier sources win.
    pub async fn load(&self, sources: &[MappingSource]) -> Result<NameMapping, MappingError> {
        let mut mappings = Vec::with_capacity(sources.len());
        for source in sources {
            let mapping = self.load_source(source).await?;
            tracing::debug!("loaded {} name mapping entries from {:?}", mapping.len(), source);
            mappings.push(mapping);
        }
        Ok(NameMapping::layered(mappings))
    }

    pub async fn load_source(&self, source: &MappingSource) -> Result<NameMapping, MappingError> {
        match source {
            MappingSource::Bundled => Ok(NameMapping::bundled().clone()),
            MappingSource::Disabled => Ok(NameMapping::default()),
            MappingSource::Custom(location) => self.load_custom(location).await,
            MappingSource::Grayskull | MappingSource::CfGraph | MappingSource::Parselmouth => {
                let Some(url) = source.remote_url() else {
                    return Ok(NameMapping::default());
                };
                let Some(content) = self.fetch(url).await? else {
                    return Ok(NameMapping::default());
                };
                match source {
                    MappingSource::Grayskull => {
                        parse_yaml_mapping(&content, "conda_forge", "grayskull")
                            .map_err(|e| MappingError::InvalidYaml(url.to_string(), e))
                    }
                    MappingSource::CfGraph => parse_yaml_mapping(&content, "conda_name", "cf-graph")
                        .map_err(|e| MappingError::InvalidYaml(url.to_string(), e)),
                    _ => parse_parselmouth_mapping(&String::from_utf8_lossy(&content))
                        .map_err(|e| MappingError::InvalidJson(url.to_string(), e)),
                }
            }
        }
    }

    /// Downloads a remote mapping. An unsuccessful status code is not an
    /// error, the source is simply treated as empty.
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>, MappingError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            tracing::debug!(
                "could not fetch name mapping {url}: status {}",
                response.status()
            );
            return Ok(None);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(reqwest_middleware::Error::from)?;
        Ok(Some(bytes.to_vec()))
    }

    async fn load_custom(&self, location: &MappingLocation) -> Result<NameMapping, MappingError> {
        match location {
            MappingLocation::Memory(mapping) => Ok(mapping.clone()),
            MappingLocation::Path(path) => load_grayskull_json_file(path),
            MappingLocation::Url(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| MappingError::InvalidFileUrl(url.clone()))?;
                load_grayskull_json_file(&path)
            }
            MappingLocation::Url(url) => {
                let Some(content) = self.fetch(url.as_str()).await? else {
                    return Ok(NameMapping::default());
                };
                NameMapping::from_grayskull_json(&String::from_utf8_lossy(&content))
                    .map_err(|e| MappingError::InvalidJson(url.to_string(), e))
            }
        }
    }
}

fn load_grayskull_json_file(path: &std::path::Path) -> Result<NameMapping, MappingError> {
    let content =
        fs_err::read_to_string(path).map_err(|e| MappingError::Io(path.to_path_buf(), e))?;
    NameMapping::from_grayskull_json(&content)
        .map_err(|e| MappingError::InvalidJson(path.display().to_string(), e))
}
