use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::LazyLock,
};

use conda_pypi_mapping::{NameMapping, SpecParts, canonicalize_name};
use pep508_rs::{Requirement, VersionOrUrl};
use regex::Regex;

use crate::WheelError;

/// Dependencies of a package in conda form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondaRequirements {
    /// Unconditional dependencies, e.g. `requests >=2.0`.
    pub depends: Vec<String>,
    /// Dependencies per optional feature.
    pub extras: BTreeMap<String, Vec<String>>,
}

fn extra_names(marker: &str) -> Vec<String> {
    static EXTRA: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"\bextra\s*==\s*['"]([^'"]+)['"]"#).expect("valid regex")
    });
    EXTRA
        .captures_iter(marker)
        .map(|captures| captures[1].trim().to_string())
        .collect()
}

/// Translates `Requires-Dist` entries into conda dependencies.
///
/// Names are canonicalized and mapped to conda names. Requirements guarded
/// by an `extra == "x"` marker end up in `extras["x"]`, requirements with any
/// other marker are not emitted.
pub fn requires_to_conda(
    requires: &[String],
    mapping: &NameMapping,
) -> Result<CondaRequirements, WheelError> {
    let mut result = CondaRequirements::default();

    for requirement in requires {
        let (spec, marker) = match requirement.split_once(';') {
            Some((spec, marker)) => (spec.trim(), Some(marker.trim())),
            None => (requirement.trim(), None),
        };

        let parsed: Requirement = Requirement::from_str(spec)
            .map_err(|err| WheelError::InvalidRequirement(requirement.clone(), err.to_string()))?;

        let name = mapping.pypi_to_conda_name(&canonicalize_name(parsed.name.as_ref()), false);
        let specifier = match &parsed.version_or_url {
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => specifiers
                .to_string()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect(),
            Some(VersionOrUrl::Url(_)) => {
                tracing::debug!("ignoring the url of requirement '{requirement}'");
                String::new()
            }
            None => String::new(),
        };
        let as_conda = format!("{name} {specifier}").trim().to_string();

        match marker {
            Some(marker) => {
                let extras = extra_names(marker);
                if extras.is_empty() {
                    tracing::debug!("dropping requirement '{requirement}' with marker '{marker}'");
                }
                for extra in extras {
                    result
                        .extras
                        .entry(extra)
                        .or_default()
                        .push(as_conda.clone());
                }
            }
            None => result.depends.push(as_conda),
        }
    }

    Ok(result)
}

/// Translates a conda spec back into a PEP 508 requirement.
///
/// Tries `"{name} {version}"`, then `"{name}=={version}"`, then the bare name.
pub fn conda_to_requires(spec: &str, mapping: &NameMapping) -> Option<Requirement> {
    let parts = SpecParts::parse(spec);
    let pypi_name = mapping.conda_to_pypi_name(&parts.name);

    let candidates = match &parts.version {
        Some(version) => vec![
            format!("{pypi_name} {version}"),
            format!("{pypi_name}=={version}"),
            pypi_name.clone(),
        ],
        None => vec![pypi_name.clone()],
    };

    candidates
        .into_iter()
        .find_map(|candidate| Requirement::from_str(&candidate).ok())
}
