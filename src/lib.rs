//! conda-pypi converts PyPI wheels into conda packages so that environments
//! can be resolved conda-first, with PyPI as a fallback for everything the
//! conda channels do not provide.
//!
//! [`ConvertTree`] drives the resolution: it solves the request against a
//! local channel of converted packages plus the configured channels, fetches
//! the missing packages from PyPI, converts them and tries again.

mod classify;
mod convert_tree;
mod install_request;

pub use classify::{ClassifiedDependencies, classify_dependencies, find_on_conda};
pub use convert_tree::{ConvertTree, ConvertTreeError, ConvertTreeOptions, ConvertTreeResult};
pub use install_request::InstallRequest;

pub use conda_pypi_channel as channel;
pub use conda_pypi_config as config;
pub use conda_pypi_fetch as fetch;
pub use conda_pypi_mapping as mapping;
pub use conda_pypi_solve as solve;
pub use conda_pypi_wheel as wheel;
