use conda_pypi_channel::ChannelIndex;
use conda_pypi_consts::consts::{CondaEmoji, PypiEmoji};
use conda_pypi_mapping::{NameMapping, SpecParts, canonicalize_name, spec_name_variants};
use indexmap::IndexMap;
use rattler_conda_types::{MatchSpec, ParseStrictness};

/// PyPI requirements split by where they will be installed from.
///
/// Both maps are keyed by package name, the conda map by conda name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedDependencies {
    pub conda: IndexMap<String, Vec<String>>,
    pub pypi: IndexMap<String, Vec<String>>,
}

/// Looks up a PyPI spec in the channel index.
///
/// Every name variant of the spec is translated to a conda spec, the first
/// conda spec with a matching record is returned.
pub fn find_on_conda(pypi_spec: &str, mapping: &NameMapping, index: &ChannelIndex) -> Option<String> {
    spec_name_variants(pypi_spec).into_iter().find_map(|variant| {
        let conda_spec = mapping.pypi_spec_to_conda_spec(&variant);
        let spec = MatchSpec::from_str(&conda_spec, ParseStrictness::Lenient).ok()?;
        index
            .matching_records(&spec)
            .next()
            .is_some()
            .then_some(conda_spec)
    })
}

/// Splits PyPI specs into dependencies that conda channels provide and the
/// ones that have to come from PyPI.
///
/// With `prefer_on_conda` disabled everything stays on the PyPI side.
pub fn classify_dependencies(
    pypi_specs: &[String],
    mapping: &NameMapping,
    index: &ChannelIndex,
    prefer_on_conda: bool,
) -> ClassifiedDependencies {
    let mut classified = ClassifiedDependencies::default();
    for pypi_spec in pypi_specs {
        let name = canonicalize_name(&SpecParts::parse(pypi_spec).name);
        if prefer_on_conda {
            if let Some(conda_spec) = find_on_conda(pypi_spec, mapping, index) {
                tracing::info!("{CondaEmoji} {pypi_spec} is available as {conda_spec}");
                let conda_name = SpecParts::parse(&conda_spec).name;
                push_unique(classified.conda.entry(conda_name).or_default(), conda_spec);
                continue;
            }
        }
        tracing::debug!("{PypiEmoji} {pypi_spec}");
        push_unique(classified.pypi.entry(name).or_default(), pypi_spec.clone());
    }
    classified
}

fn push_unique(specs: &mut Vec<String>, spec: String) {
    if !specs.contains(&spec) {
        specs.push(spec);
    }
}
