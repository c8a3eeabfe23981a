//! Types of the PEP 691 json simple repository api.

use std::collections::HashMap;

use serde::Deserialize;

/// A project page, `GET <index>/<project>/`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectPage {
    pub name: String,
    #[serde(default)]
    pub files: Vec<ProjectFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectFile {
    pub filename: String,
    /// Absolute, or relative to the project page.
    pub url: String,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub yanked: Yanked,
}

impl ProjectFile {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }
}

/// Either a flag or the reason the file was yanked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Yanked {
    Bool(bool),
    Reason(String),
}

impl Default for Yanked {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl Yanked {
    pub fn is_yanked(&self) -> bool {
        match self {
            Self::Bool(yanked) => *yanked,
            Self::Reason(_) => true,
        }
    }
}
