use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use conda_pypi_config::PyPIConfig;
use conda_pypi_consts::consts;
use conda_pypi_mapping::canonicalize_name;
use conda_pypi_utils::atomic_write;
use conda_pypi_wheel::{CompatibilityTags, WheelFilename};
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{Requirement, VersionOrUrl};
use rattler_digest::{Sha256, compute_bytes_digest};
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

use crate::{
    FetchError, WheelFetcher,
    simple::{ProjectFile, ProjectPage},
    target_python::TargetPython,
};

/// Where a wheel can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateLocation {
    Url(Url),
    Path(PathBuf),
}

impl Display for CandidateLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A wheel offered by an index or a find-links directory.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub filename: WheelFilename,
    pub location: CandidateLocation,
    pub sha256: Option<String>,
    pub requires_python: Option<String>,
    pub yanked: bool,
}

impl Candidate {
    pub fn version(&self) -> &Version {
        &self.filename.version
    }

    fn from_project_file(file: &ProjectFile, page_url: &Url) -> Option<Self> {
        if !file.filename.ends_with(consts::WHEEL_EXTENSION) {
            return None;
        }
        let filename = match WheelFilename::from_str(&file.filename) {
            Ok(filename) => filename,
            Err(err) => {
                tracing::debug!("skipping {}: {err}", file.filename);
                return None;
            }
        };
        let url = page_url.join(&file.url).ok()?;
        let location = match url.scheme() {
            "file" => CandidateLocation::Path(url.to_file_path().ok()?),
            _ => CandidateLocation::Url(url),
        };
        Some(Self {
            filename,
            location,
            sha256: file.sha256().map(str::to_string),
            requires_python: file.requires_python.clone(),
            yanked: file.yanked.is_yanked(),
        })
    }
}

/// Finds the best wheel for a requirement.
///
/// Looks at PEP 691 json simple indexes and at local directories of wheels.
/// Only wheels are considered, source distributions are never built.
#[derive(Debug, Clone)]
pub struct PackageFinder {
    client: ClientWithMiddleware,
    index_urls: Vec<Url>,
    find_links: Vec<PathBuf>,
    target: TargetPython,
    tags: CompatibilityTags,
    allow_yanked: bool,
}

impl PackageFinder {
    /// A finder that queries pypi.org for `target`.
    pub fn new(client: ClientWithMiddleware, target: TargetPython) -> Self {
        Self {
            client,
            index_urls: vec![consts::DEFAULT_PYPI_INDEX_URL.clone()],
            find_links: Vec::new(),
            tags: target.compatibility_tags(Vec::new()),
            target,
            allow_yanked: false,
        }
    }

    pub fn from_config(
        client: ClientWithMiddleware,
        target: TargetPython,
        config: &PyPIConfig,
    ) -> Self {
        Self::new(client, target)
            .with_index_urls(config.index_urls())
            .with_find_links(config.find_links.clone())
            .with_platform_tags(config.platform_tags.clone())
            .with_allow_yanked(config.allow_yanked())
    }

    pub fn with_index_urls(mut self, index_urls: Vec<Url>) -> Self {
        self.index_urls = index_urls.into_iter().map(with_trailing_slash).collect();
        self
    }

    pub fn with_find_links(mut self, find_links: Vec<PathBuf>) -> Self {
        self.find_links = find_links;
        self
    }

    pub fn with_platform_tags(mut self, platforms: Vec<String>) -> Self {
        self.tags = self.target.compatibility_tags(platforms);
        self
    }

    pub fn with_allow_yanked(mut self, allow_yanked: bool) -> Self {
        self.allow_yanked = allow_yanked;
        self
    }

    pub fn target_python(&self) -> TargetPython {
        self.target
    }

    /// All wheels of `name` from every index and find-links directory.
    pub async fn candidates(&self, name: &str) -> Result<Vec<Candidate>, FetchError> {
        let name = canonicalize_name(name);
        let mut candidates = self.local_candidates(&name)?;
        for index in &self.index_urls {
            let Some((page, page_url)) = self.project_page(index, &name).await? else {
                continue;
            };
            candidates.extend(
                page.files
                    .iter()
                    .filter_map(|file| Candidate::from_project_file(file, &page_url)),
            );
        }
        tracing::debug!("found {} wheels for {name}", candidates.len());
        Ok(candidates)
    }

    fn local_candidates(&self, name: &str) -> Result<Vec<Candidate>, FetchError> {
        let mut candidates = Vec::new();
        for dir in &self.find_links {
            if !dir.is_dir() {
                tracing::warn!("find-links directory {} does not exist", dir.display());
                continue;
            }
            for entry in fs_err::read_dir(dir)? {
                let path = entry?.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Ok(filename) = WheelFilename::from_str(file_name) else {
                    continue;
                };
                if canonicalize_name(&filename.distribution) != name {
                    continue;
                }
                candidates.push(Candidate {
                    filename,
                    location: CandidateLocation::Path(path),
                    sha256: None,
                    requires_python: None,
                    yanked: false,
                });
            }
        }
        Ok(candidates)
    }

    /// Fetches the project page of `name`, `None` when the index does not
    /// know the project.
    async fn project_page(
        &self,
        index: &Url,
        name: &str,
    ) -> Result<Option<(ProjectPage, Url)>, FetchError> {
        let page_url = index
            .join(&format!("{name}/"))
            .map_err(|_| FetchError::InvalidIndexUrl(index.to_string()))?;

        if page_url.scheme() == "file" {
            let dir = page_url
                .to_file_path()
                .map_err(|_| FetchError::InvalidIndexUrl(index.to_string()))?;
            let path = dir.join("index.json");
            if !path.is_file() {
                return Ok(None);
            }
            let content = fs_err::read_to_string(&path)?;
            let page = serde_json::from_str(&content)
                .map_err(|err| FetchError::InvalidProjectPage(page_url.clone(), err))?;
            return Ok(Some((page, page_url)));
        }

        let response = self
            .client
            .get(page_url.clone())
            .header(reqwest::header::ACCEPT, consts::SIMPLE_API_JSON)
            .send()
            .await
            .map_err(|err| FetchError::Request(page_url.clone(), err))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("{name} is not available on {index}");
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|err| FetchError::Request(page_url.clone(), err.into()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Request(page_url.clone(), err.into()))?;
        let page = serde_json::from_slice(&bytes)
            .map_err(|err| FetchError::InvalidProjectPage(page_url.clone(), err))?;
        Ok(Some((page, page_url)))
    }

    /// Picks the best candidate for `requirement`.
    ///
    /// The highest version wins, among wheels of the same version the one
    /// with the best tag. Pre-releases are only selected when the requirement
    /// asks for one or nothing else matches.
    pub fn select(&self, requirement: &Requirement, candidates: Vec<Candidate>) -> Option<Candidate> {
        let name = canonicalize_name(requirement.name.as_ref());
        let specifiers = match &requirement.version_or_url {
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => Some(specifiers),
            _ => None,
        };
        let python = self.target.version();

        let matching: Vec<(Candidate, u64)> = candidates
            .into_iter()
            .filter(|candidate| canonicalize_name(&candidate.filename.distribution) == name)
            .filter(|candidate| {
                if candidate.yanked && !self.allow_yanked {
                    tracing::debug!("skipping yanked {}", candidate.filename);
                    return false;
                }
                true
            })
            .filter(|candidate| requires_python_matches(candidate, &python))
            .filter(|candidate| {
                specifiers.is_none_or(|specifiers| specifiers.contains(candidate.version()))
            })
            .filter_map(|candidate| {
                let priority = self.tags.priority(&candidate.filename)?;
                Some((candidate, priority))
            })
            .collect();

        let wants_prerelease = specifiers.is_some_and(|specifiers| {
            specifiers
                .iter()
                .any(|specifier| specifier.version().any_prerelease())
        });
        let has_final = matching
            .iter()
            .any(|(candidate, _)| !candidate.version().any_prerelease());

        matching
            .into_iter()
            .filter(|(candidate, _)| {
                wants_prerelease || !has_final || !candidate.version().any_prerelease()
            })
            .max_by(|(a, a_priority), (b, b_priority)| {
                a.version()
                    .cmp(b.version())
                    .then_with(|| b_priority.cmp(a_priority))
            })
            .map(|(candidate, _)| candidate)
    }

    pub async fn find_best_match(
        &self,
        requirement: &Requirement,
    ) -> Result<Option<Candidate>, FetchError> {
        let candidates = self.candidates(requirement.name.as_ref()).await?;
        Ok(self.select(requirement, candidates))
    }

    /// Downloads or copies `candidate` into `dest` and returns the path of
    /// the wheel. The sha256 is verified when the index provides one.
    pub async fn download(&self, candidate: &Candidate, dest: &Path) -> Result<PathBuf, FetchError> {
        fs_err::create_dir_all(dest)?;
        let target = dest.join(candidate.filename.to_string());

        let bytes = match &candidate.location {
            CandidateLocation::Path(path) => fs_err::read(path)?,
            CandidateLocation::Url(url) => {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|response| {
                        response
                            .error_for_status()
                            .map_err(reqwest_middleware::Error::from)
                    })
                    .map_err(|err| FetchError::Request(url.clone(), err))?;
                response
                    .bytes()
                    .await
                    .map_err(|err| FetchError::Request(url.clone(), err.into()))?
                    .to_vec()
            }
        };

        if let Some(expected) = &candidate.sha256 {
            let actual = format!("{:x}", compute_bytes_digest::<Sha256>(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::HashMismatch {
                    location: candidate.location.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        atomic_write(&target, &bytes).await?;
        tracing::info!("fetched {} from {}", candidate.filename, candidate.location);
        Ok(target)
    }
}

fn requires_python_matches(candidate: &Candidate, python: &Version) -> bool {
    let Some(requires_python) = &candidate.requires_python else {
        return true;
    };
    match VersionSpecifiers::from_str(requires_python) {
        Ok(specifiers) => specifiers.contains(python),
        Err(err) => {
            tracing::warn!(
                "ignoring invalid requires-python '{requires_python}' of {}: {err}",
                candidate.filename
            );
            true
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl WheelFetcher for PackageFinder {
    async fn fetch(&self, requirement: &Requirement, dest: &Path) -> Result<PathBuf, FetchError> {
        let candidate = self
            .find_best_match(requirement)
            .await?
            .ok_or_else(|| FetchError::NoMatchingWheel(requirement.to_string()))?;
        self.download(&candidate, dest).await
    }
}
