//! Helpers to take apart the loosely formatted `name version` specs that are
//! exchanged between the mapping, the converter and the solver.

use std::fmt::{Display, Formatter};

use itertools::Itertools;

/// Characters that continue a constraint across whitespace.
const CONSTRAINT_JOINERS: &str = "<>=!~,|";

/// A package spec split into its name, an optional version constraint and an
/// optional build string.
///
/// Accepts both conda style (`numpy >=1.20`, `numpy 1.20.* py312_0`) and
/// PEP 508 style (`numpy>=1.20`) input. Whitespace inside the constraint is
/// removed, a whitespace separated token after a complete constraint is the
/// build string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecParts {
    pub name: String,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl SpecParts {
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let end = spec
            .find(|c: char| c.is_whitespace() || "<>=!~,;[(*".contains(c))
            .unwrap_or(spec.len());
        let (name, rest) = spec.split_at(end);

        let mut tokens = rest.split_whitespace().peekable();
        let mut version = String::new();
        while let Some(token) = tokens.next() {
            version.push_str(token);
            let continues = version.ends_with(|c: char| CONSTRAINT_JOINERS.contains(c))
                || tokens
                    .peek()
                    .is_some_and(|next| next.starts_with(|c: char| CONSTRAINT_JOINERS.contains(c)));
            if !continues {
                break;
            }
        }
        let build = tokens.join(" ");

        Self {
            name: name.to_string(),
            version: (!version.is_empty()).then_some(version),
            build: (!build.is_empty()).then_some(build),
        }
    }

    /// Returns a copy with a different name but the same constraint.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Joins the constraints of both specs, keeping the name of `self`.
    pub fn merge_constraint(&self, constraint: Option<&str>) -> Self {
        let version = [self.version.as_deref(), constraint]
            .into_iter()
            .flatten()
            .filter(|v| !v.is_empty())
            .unique()
            .join(",");
        Self {
            name: self.name.clone(),
            version: (!version.is_empty()).then_some(version),
            build: self.build.clone(),
        }
    }
}

impl Display for SpecParts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        if let Some(build) = &self.build {
            write!(f, " {}{build}", if self.version.is_none() { "* " } else { "" })?;
        }
        Ok(())
    }
}

/// The spec itself followed by its dash to underscore and underscore to dash
/// variants. Variants that do not change the name are skipped.
pub fn spec_name_variants(spec: &str) -> Vec<String> {
    let parts = SpecParts::parse(spec);
    let mut variants = vec![spec.to_string()];
    let mut seen = vec![parts.name.clone()];
    for name in [parts.name.replace('-', "_"), parts.name.replace('_', "-")] {
        if !seen.contains(&name) {
            variants.push(parts.with_name(name.clone()).to_string());
            seen.push(name);
        }
    }
    variants
}
