use std::{
    collections::{BTreeMap, HashMap},
    sync::{LazyLock, OnceLock},
};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod source;
pub mod spec;

pub use source::{MappingClient, MappingError, MappingLocation, MappingSource};
pub use spec::{SpecParts, spec_name_variants};

static BUNDLED_MAPPING_JSON: &str = include_str!("../data/grayskull_pypi_mapping.json");

static BUNDLED_MAPPING: LazyLock<NameMapping> = LazyLock::new(|| {
    NameMapping::from_grayskull_json(BUNDLED_MAPPING_JSON)
        .expect("the bundled mapping must be valid json")
});

/// Normalizes a PyPI project name as described in PEP 503: lowercase with
/// every run of `-`, `_` and `.` replaced by a single `-`.
pub fn canonicalize_name(name: &str) -> String {
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[-_.]+").expect("valid regex"));
    SEPARATORS
        .replace_all(name.trim(), "-")
        .to_ascii_lowercase()
}

/// One entry of a mapping in the grayskull json format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub pypi_name: String,
    pub conda_name: String,
    #[serde(default)]
    pub import_name: Option<String>,
    #[serde(default)]
    pub mapping_source: Option<String>,
    /// A conda version constraint that has to be merged into every spec that
    /// is translated through this entry, e.g. `>=5,<6.0dev0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
}

impl MappingEntry {
    /// The entry used for names that are not part of any mapping.
    pub fn identity(name: &str) -> Self {
        let name = canonicalize_name(name);
        Self {
            pypi_name: name.clone(),
            conda_name: name,
            import_name: None,
            mapping_source: None,
            version_constraint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub total_mappings: usize,
    pub mapping_sources: BTreeMap<String, usize>,
}

/// A table of PyPI to conda names keyed by canonical PyPI name.
#[derive(Debug, Default)]
pub struct NameMapping {
    entries: IndexMap<String, MappingEntry>,
    reverse: OnceLock<HashMap<String, usize>>,
}

impl Clone for NameMapping {
    fn clone(&self) -> Self {
        Self::from_entries(self.entries.values().cloned())
    }
}

impl NameMapping {
    /// The mapping that is embedded in this crate.
    pub fn bundled() -> &'static NameMapping {
        &BUNDLED_MAPPING
    }

    /// Builds a mapping from entries. The first entry for a PyPI name wins.
    pub fn from_entries(entries: impl IntoIterator<Item = MappingEntry>) -> Self {
        let mut map = IndexMap::new();
        for entry in entries {
            map.entry(canonicalize_name(&entry.pypi_name))
                .or_insert(entry);
        }
        Self {
            entries: map,
            reverse: OnceLock::new(),
        }
    }

    /// Parses a mapping in the grayskull json format, an object keyed by PyPI
    /// name.
    pub fn from_grayskull_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: IndexMap<String, MappingEntry> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries.into_values()))
    }

    /// Combines mappings, entries of earlier mappings take precedence.
    pub fn layered(mappings: impl IntoIterator<Item = NameMapping>) -> Self {
        Self::from_entries(
            mappings
                .into_iter()
                .flat_map(|mapping| mapping.entries.into_values()),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    fn get(&self, pypi_name: &str) -> Option<&MappingEntry> {
        self.entries.get(&canonicalize_name(pypi_name))
    }

    fn reverse(&self) -> &HashMap<String, usize> {
        self.reverse.get_or_init(|| {
            let mut reverse = HashMap::with_capacity(self.entries.len());
            for (idx, entry) in self.entries.values().enumerate() {
                reverse.entry(entry.conda_name.clone()).or_insert(idx);
            }
            reverse
        })
    }

    /// Returns the conda name of a PyPI project.
    ///
    /// With `skip_mapping` only the canonical name is returned. This is used
    /// for explicitly requested projects that have to come from PyPI.
    pub fn pypi_to_conda_name(&self, pypi_name: &str, skip_mapping: bool) -> String {
        let canonical = canonicalize_name(pypi_name);
        if skip_mapping {
            return canonical;
        }
        match self.entries.get(&canonical) {
            Some(entry) => entry.conda_name.clone(),
            None => canonical,
        }
    }

    /// Returns the PyPI name of a conda package. Unknown names are returned
    /// canonicalized.
    pub fn conda_to_pypi_name(&self, conda_name: &str) -> String {
        match self
            .reverse()
            .get(conda_name)
            .and_then(|idx| self.entries.get_index(*idx))
        {
            Some((_, entry)) => canonicalize_name(&entry.pypi_name),
            None => canonicalize_name(conda_name),
        }
    }

    /// Returns the full entry for a PyPI name, or an identity entry.
    pub fn mapping_info(&self, pypi_name: &str) -> MappingEntry {
        self.get(pypi_name)
            .cloned()
            .unwrap_or_else(|| MappingEntry::identity(pypi_name))
    }

    pub fn has_mapping(&self, pypi_name: &str) -> bool {
        self.get(pypi_name).is_some()
    }

    pub fn stats(&self) -> MappingStats {
        let mut mapping_sources = BTreeMap::new();
        for entry in self.entries.values() {
            let source = entry.mapping_source.as_deref().unwrap_or("unknown");
            *mapping_sources.entry(source.to_string()).or_insert(0) += 1;
        }
        MappingStats {
            total_mappings: self.entries.len(),
            mapping_sources,
        }
    }

    /// Translates a PyPI spec into a conda spec.
    ///
    /// The package is renamed and a version constraint carried by the mapping
    /// is merged in. Specs without a mapping that changes anything are
    /// returned unchanged.
    pub fn pypi_spec_to_conda_spec(&self, spec: &str) -> String {
        let parts = SpecParts::parse(spec);
        let Some(entry) = self.get(&parts.name) else {
            return spec.to_string();
        };

        let canonical = canonicalize_name(&parts.name);
        if entry.conda_name == canonical && entry.version_constraint.is_none() {
            return spec.to_string();
        }

        parts
            .with_name(entry.conda_name.clone())
            .merge_constraint(entry.version_constraint.as_deref())
            .to_string()
    }
}
