//! Repodata built straight from wheel metadata, without converting the
//! wheels into conda archives first.

use conda_pypi_consts::consts;
use conda_pypi_mapping::{NameMapping, canonicalize_name};
use std::str::FromStr;

use conda_pypi_wheel::{WheelError, WheelInfo, requires_to_conda};
use rattler_conda_types::{NoArchType, PackageName, PackageRecord, RepoData, VersionWithSource};

use crate::{ChannelError, repodata::RepoDataExt};

/// Builds a `noarch` repodata with one record per wheel.
///
/// Records are keyed by the wheel filename and use the wheel tags as build
/// string, so several wheels of the same version can coexist.
pub fn synthesize_repodata(
    wheels: &[WheelInfo],
    mapping: &NameMapping,
) -> Result<RepoData, ChannelError> {
    let mut repodata = RepoData::empty(consts::NOARCH_SUBDIR);

    for wheel in wheels {
        let metadata = &wheel.metadata;
        let requirements = requires_to_conda(&metadata.requires_dist, mapping)?;
        let python = match &metadata.requires_python {
            Some(requires_python) => format!("python {requires_python}"),
            None => "python".to_string(),
        };

        let file_name = wheel.filename.to_string();
        let build = file_name
            .splitn(3, '-')
            .nth(2)
            .and_then(|rest| rest.strip_suffix(consts::WHEEL_EXTENSION))
            .unwrap_or_default()
            .to_string();

        let name = PackageName::try_from(canonicalize_name(&metadata.name))
            .map_err(WheelError::from)?;
        let version = VersionWithSource::from_str(&metadata.version)
            .map_err(|err| WheelError::InvalidVersion(metadata.version.clone(), err))?;

        let mut record = PackageRecord::new(name, version, build);
        record.depends = std::iter::once(python)
            .chain(requirements.depends)
            .collect();
        record.experimental_extra_depends = requirements.extras;
        record.noarch = NoArchType::python();
        record.subdir = consts::NOARCH_SUBDIR.to_string();
        record.size = Some(0);

        tracing::debug!("synthesized {file_name}");
        repodata.packages.insert(file_name, record);
    }

    Ok(repodata)
}
