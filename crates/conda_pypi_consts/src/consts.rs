use std::{
    fmt::{Display, Formatter},
    sync::LazyLock,
};

use url::Url;

pub const CONFIG_DIR: &str = ".conda-pypi";
pub const CONFIG_FILE: &str = "config.toml";
pub const APP_DIR_NAME: &str = "conda-pypi";

/// Name of the directory below the user data directory that holds the local
/// channel with converted packages.
pub const LOCAL_CHANNEL_DIR: &str = "pypi";
pub const NOARCH_SUBDIR: &str = "noarch";
pub const REPODATA_JSON: &str = "repodata.json";
pub const CHANNELDATA_JSON: &str = "channeldata.json";
pub const CONDA_META_DIR: &str = "conda-meta";

/// Every converted wheel is built as `pypi_<build number>`.
pub const PYPI_BUILD_STRING: &str = "pypi";
pub const CONDA_PACKAGE_EXTENSION: &str = ".conda";
pub const WHEEL_EXTENSION: &str = ".whl";

/// Content type of the PEP 691 json simple api.
pub const SIMPLE_API_JSON: &str = "application/vnd.pypi.simple.v1+json";

/// Value written to the `INSTALLER` file of every converted distribution.
pub const CONDA_INSTALLER: &str = "conda";

/// How often the hybrid resolver retries before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 20;
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 50;

/// The default channels used for everything that is not found locally.
pub const DEFAULT_CHANNELS: &[&str] = &["conda-forge"];

pub const GRAYSKULL_MAPPING_URL: &str =
    "https://raw.githubusercontent.com/conda/grayskull/main/grayskull/strategy/config.yaml";
pub const CF_GRAPH_MAPPING_URL: &str = "https://raw.githubusercontent.com/regro/cf-graph-countyfair/master/mappings/pypi/grayskull_pypi_mapping.yaml";
pub const PARSELMOUTH_MAPPING_URL: &str =
    "https://raw.githubusercontent.com/prefix-dev/parselmouth/main/files/mapping_as_grayskull.json";

pub static DEFAULT_PYPI_INDEX_URL: LazyLock<Url> =
    LazyLock::new(|| Url::parse("https://pypi.org/simple/").expect("valid index url"));
pub static DEFAULT_CHANNEL_ALIAS: LazyLock<Url> =
    LazyLock::new(|| Url::parse("https://conda.anaconda.org/").expect("valid channel alias"));

pub struct CondaEmoji;

impl Display for CondaEmoji {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if console::Term::stderr().features().colors_supported() {
            write!(f, "{}", console::style("C").bold().green())
        } else {
            write!(f, "(conda)")
        }
    }
}

pub struct PypiEmoji;

impl Display for PypiEmoji {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if console::Term::stderr().features().colors_supported() {
            write!(f, "{}", console::style("P").bold().blue())
        } else {
            write!(f, "(pypi)")
        }
    }
}
