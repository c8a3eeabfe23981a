use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
};

use conda_pypi_consts::consts;
use conda_pypi_mapping::spec_name_variants;
use itertools::Itertools;
use rattler_conda_types::{
    MatchSpec, Matches, PackageRecord, Platform, RepoData, RepoDataRecord, VersionWithSource,
    compute_package_url,
};
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

use crate::{ChannelError, repodata::RepoDataExt};

/// Where the repodata of a channel lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelLocation {
    Path(PathBuf),
    Url(Url),
}

impl ChannelLocation {
    /// Resolves a channel as given by the user.
    ///
    /// Urls are taken as is, absolute or relative paths are local channels
    /// and bare names like `conda-forge` are joined onto `channel_alias`.
    pub fn parse(channel: &str, channel_alias: &Url) -> Result<Self, ChannelError> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(ChannelError::InvalidChannel(channel.to_string()));
        }
        if channel.contains("://") {
            let url = Url::parse(channel)
                .map_err(|_| ChannelError::InvalidChannel(channel.to_string()))?;
            if url.scheme() == "file" {
                let path = url
                    .to_file_path()
                    .map_err(|_| ChannelError::InvalidChannel(channel.to_string()))?;
                return Ok(Self::Path(path));
            }
            return Ok(Self::Url(with_trailing_slash(url)));
        }
        if channel.starts_with('/')
            || channel.starts_with("./")
            || channel.starts_with("../")
            || channel.starts_with('~')
            || Path::new(channel).is_absolute()
        {
            let path = match channel.strip_prefix("~/") {
                Some(rest) => dirs::home_dir()
                    .map(|home| home.join(rest))
                    .ok_or_else(|| ChannelError::InvalidChannel(channel.to_string()))?,
                None => PathBuf::from(channel),
            };
            return Ok(Self::Path(path));
        }
        let url = with_trailing_slash(channel_alias.clone())
            .join(&format!("{}/", channel.trim_matches('/')))
            .map_err(|_| ChannelError::InvalidChannel(channel.to_string()))?;
        Ok(Self::Url(url))
    }

    /// Url form of the location as passed to conda.
    pub fn url(&self) -> Result<Url, ChannelError> {
        match self {
            Self::Path(path) => Url::from_directory_path(path)
                .map_err(|_| ChannelError::InvalidPath(path.clone())),
            Self::Url(url) => Ok(url.clone()),
        }
    }

    /// The url of a platform subdir, with a trailing slash.
    pub fn subdir_url(&self, subdir: Platform) -> Result<Url, ChannelError> {
        self.url()?
            .join(&format!("{}/", subdir.as_str()))
            .map_err(|_| ChannelError::InvalidChannel(self.to_string()))
    }
}

impl Display for ChannelLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
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

/// A channel together with its name, the name is what ends up in the
/// records and the install command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSource {
    pub name: String,
    pub location: ChannelLocation,
}

impl ChannelSource {
    pub fn parse(channel: &str, channel_alias: &Url) -> Result<Self, ChannelError> {
        Ok(Self {
            name: channel.trim().to_string(),
            location: ChannelLocation::parse(channel, channel_alias)?,
        })
    }

    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            location: ChannelLocation::Path(path.into()),
        }
    }
}

/// A record of a channel index, remembering where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub channel: String,
    /// Position of the channel in the channel list, lower wins.
    pub priority: usize,
    pub record: RepoDataRecord,
}

impl ChannelRecord {
    pub fn package_record(&self) -> &PackageRecord {
        &self.record.package_record
    }

    pub fn name(&self) -> &str {
        self.record.package_record.name.as_normalized()
    }

    pub fn version(&self) -> &VersionWithSource {
        &self.record.package_record.version
    }

    pub fn build(&self) -> &str {
        &self.record.package_record.build
    }

    pub fn subdir(&self) -> &str {
        &self.record.package_record.subdir
    }

    pub fn file_name(&self) -> &str {
        &self.record.file_name
    }

    pub fn depends(&self) -> &[String] {
        &self.record.package_record.depends
    }

    /// `name-version-build`
    pub fn stem(&self) -> String {
        format!("{}-{}-{}", self.name(), self.version(), self.build())
    }
}

/// The records of a list of channels, grouped by package name.
#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    channels: Vec<String>,
    records: HashMap<String, Vec<ChannelRecord>>,
}

impl ChannelIndex {
    /// Loads `noarch` and the given platform subdirs of every channel.
    ///
    /// A subdir without a `repodata.json` is treated as empty, channels
    /// often only provide some subdirs.
    pub async fn load(
        client: &ClientWithMiddleware,
        channels: &[ChannelSource],
        platforms: &[Platform],
    ) -> Result<Self, ChannelError> {
        let subdirs = std::iter::once(Platform::NoArch)
            .chain(platforms.iter().copied())
            .unique()
            .collect_vec();

        let mut repodata = Vec::new();
        for (priority, channel) in channels.iter().enumerate() {
            for subdir in &subdirs {
                let subdir_url = channel.location.subdir_url(*subdir)?;
                let data = match &channel.location {
                    ChannelLocation::Path(path) => read_local_repodata(path, *subdir)?,
                    ChannelLocation::Url(_) => fetch_repodata(client, &subdir_url).await?,
                };
                if let Some(data) = data {
                    tracing::debug!(
                        "loaded {} records from {}/{}",
                        data.len(),
                        channel.location,
                        subdir
                    );
                    repodata.push((priority, channel.name.clone(), subdir_url, data));
                }
            }
        }

        let mut index = Self::from_repodata(repodata);
        index.channels = channels.iter().map(|c| c.name.clone()).collect();
        Ok(index)
    }

    /// Builds an index from already parsed repodata as
    /// `(priority, channel, subdir url, repodata)`.
    pub fn from_repodata(
        repodata: impl IntoIterator<Item = (usize, String, Url, RepoData)>,
    ) -> Self {
        let mut channels = Vec::new();
        let mut records: HashMap<String, Vec<ChannelRecord>> = HashMap::new();
        for (priority, channel, subdir_url, data) in repodata {
            if !channels.contains(&channel) {
                channels.push(channel.clone());
            }
            let base_url = data.base_url().map(ToOwned::to_owned);
            for (file_name, package_record) in data.records() {
                let record = RepoDataRecord {
                    package_record: package_record.clone(),
                    file_name: file_name.clone(),
                    url: compute_package_url(&subdir_url, base_url.as_deref(), file_name),
                    channel: Some(channel.clone()),
                };
                records
                    .entry(package_record.name.as_normalized().to_string())
                    .or_default()
                    .push(ChannelRecord {
                        channel: channel.clone(),
                        priority,
                        record,
                    });
            }
        }
        for list in records.values_mut() {
            list.sort_by_key(|record| record.priority);
        }
        Self { channels, records }
    }

    /// The names of the loaded channels in priority order.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// All records called `name`, the highest priority channel first.
    pub fn records_by_name(&self, name: &str) -> &[ChannelRecord] {
        self.records
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The records of `name` in the highest priority channel that has it.
    ///
    /// With strict channel priority these are the only candidates for the
    /// package.
    pub fn preferred_records(&self, name: &str) -> &[ChannelRecord] {
        let records = self.records_by_name(name);
        let Some(first) = records.first() else {
            return records;
        };
        let end = records
            .iter()
            .position(|record| record.priority != first.priority)
            .unwrap_or(records.len());
        &records[..end]
    }

    /// The records of every channel that match `spec`.
    pub fn matching_records<'i>(
        &'i self,
        spec: &'i MatchSpec,
    ) -> impl Iterator<Item = &'i ChannelRecord> + 'i {
        let records = match &spec.name {
            Some(name) => self.records_by_name(name.as_normalized()),
            None => &[],
        };
        records
            .iter()
            .filter(move |record| spec.matches(record.package_record()))
    }

    /// Every record of the index, grouped by package name.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.records.values().flatten()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        !self.records_by_name(name).is_empty()
    }

    /// Whether any of the name variants of `name` is available, returns the
    /// variant that was found.
    pub fn find_name_variant(&self, name: &str) -> Option<String> {
        spec_name_variants(name)
            .into_iter()
            .find(|variant| self.contains_name(variant))
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn read_local_repodata(
    channel: &Path,
    subdir: Platform,
) -> Result<Option<RepoData>, ChannelError> {
    let path = channel.join(subdir.as_str()).join(consts::REPODATA_JSON);
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs_err::read_to_string(&path)?;
    let repodata =
        serde_json::from_str(&content).map_err(|err| ChannelError::InvalidRepodata(path, err))?;
    Ok(Some(repodata))
}

async fn fetch_repodata(
    client: &ClientWithMiddleware,
    subdir_url: &Url,
) -> Result<Option<RepoData>, ChannelError> {
    let url = subdir_url
        .join(consts::REPODATA_JSON)
        .map_err(|_| ChannelError::InvalidChannel(subdir_url.to_string()))?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| ChannelError::Request(url.clone(), err))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        tracing::debug!("{url} does not exist, treating it as empty");
        return Ok(None);
    }
    let response = response
        .error_for_status()
        .map_err(|err| ChannelError::Request(url.clone(), err.into()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ChannelError::Request(url.clone(), err.into()))?;
    let repodata = serde_json::from_slice(&bytes)
        .map_err(|err| ChannelError::InvalidRepodata(PathBuf::from(url.as_str()), err))?;
    Ok(Some(repodata))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use conda_pypi_test_utils::{
        http_server::TestServer,
        mock_repo_data::{MockRepoData, Package},
    };
    use rattler_conda_types::{PackageName, ParseStrictness};
    use rstest::rstest;

    use super::*;

    fn alias() -> Url {
        Url::parse("https://conda.anaconda.org/").unwrap()
    }

    #[rstest]
    #[case("conda-forge", "https://conda.anaconda.org/conda-forge/")]
    #[case("bioconda/", "https://conda.anaconda.org/bioconda/")]
    #[case("https://prefix.dev/my-channel", "https://prefix.dev/my-channel/")]
    fn test_parse_url_channels(#[case] channel: &str, #[case] expected: &str) {
        let location = ChannelLocation::parse(channel, &alias()).unwrap();
        assert_eq!(location, ChannelLocation::Url(Url::parse(expected).unwrap()));
    }

    #[test]
    fn test_parse_path_channels() {
        assert_eq!(
            ChannelLocation::parse("/tmp/channel", &alias()).unwrap(),
            ChannelLocation::Path(PathBuf::from("/tmp/channel"))
        );
        assert_eq!(
            ChannelLocation::parse("file:///tmp/channel", &alias()).unwrap(),
            ChannelLocation::Path(PathBuf::from("/tmp/channel"))
        );
        assert!(ChannelLocation::parse("  ", &alias()).is_err());
    }

    #[tokio::test]
    async fn test_load_local_channels_in_priority_order() {
        let first = MockRepoData::default()
            .with_package(Package::build("requests", "2.31.0").finish())
            .into_channel()
            .unwrap();
        let second = MockRepoData::default()
            .with_package(Package::build("requests", "2.32.3").finish())
            .with_package(Package::build("urllib3", "2.2.1").finish())
            .into_channel()
            .unwrap();

        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let channels = [
            ChannelSource::local("first", first.path()),
            ChannelSource::parse(second.url().as_str(), &alias()).unwrap(),
        ];
        let index = ChannelIndex::load(&client, &channels, &[Platform::current()])
            .await
            .unwrap();

        assert_eq!(index.len(), 3);
        let requests = index.records_by_name("requests");
        assert_eq!(requests[0].channel, "first");
        assert_eq!(requests[0].version().to_string(), "2.31.0");
        assert_eq!(requests[0].record.url.scheme(), "file");
        assert_eq!(index.preferred_records("requests").len(), 1);
        assert_eq!(requests[1].priority, 1);
        assert!(index.contains_name("urllib3"));
        assert!(!index.contains_name("numpy"));
        assert!(index.records_by_name("numpy").is_empty());
    }

    fn noarch_url(channel: &str) -> Url {
        Url::parse(&format!("https://conda.anaconda.org/{channel}/noarch/")).unwrap()
    }

    fn repodata(records: &[(&str, &str, &str)]) -> RepoData {
        let mut repodata = RepoData::empty("noarch");
        for (name, version, build) in records {
            let mut record = PackageRecord::new(
                PackageName::try_from(*name).unwrap(),
                VersionWithSource::from_str(version).unwrap(),
                build.to_string(),
            );
            record.subdir = "noarch".to_string();
            repodata
                .conda_packages
                .insert(format!("{name}-{version}-{build}.conda"), record);
        }
        repodata
    }

    #[test]
    fn test_find_name_variant() {
        let repodata = repodata(&[("typing_extensions", "4.12.2", "pyha770c72_0")]);
        let index = ChannelIndex::from_repodata([(
            0,
            "conda-forge".to_string(),
            noarch_url("conda-forge"),
            repodata,
        )]);

        assert_eq!(
            index.find_name_variant("typing-extensions").as_deref(),
            Some("typing_extensions")
        );
        assert_eq!(index.find_name_variant("attrs"), None);
        assert_eq!(index.channels(), ["conda-forge".to_string()]);

        let record = &index.records_by_name("typing_extensions")[0];
        assert_eq!(
            record.record.url.as_str(),
            "https://conda.anaconda.org/conda-forge/noarch/typing_extensions-4.12.2-pyha770c72_0.conda"
        );
        assert_eq!(record.record.channel.as_deref(), Some("conda-forge"));
        assert_eq!(record.stem(), "typing_extensions-4.12.2-pyha770c72_0");
    }

    #[test]
    fn test_preferred_and_matching_records() {
        let index = ChannelIndex::from_repodata([
            (
                0,
                "first".to_string(),
                noarch_url("first"),
                repodata(&[("numpy", "1.26.4", "0")]),
            ),
            (
                1,
                "second".to_string(),
                noarch_url("second"),
                repodata(&[("numpy", "2.0.0", "0"), ("numpy", "2.1.0", "0")]),
            ),
        ]);

        let preferred = index.preferred_records("numpy");
        assert_eq!(preferred.len(), 1);
        assert_eq!(preferred[0].channel, "first");
        assert!(index.preferred_records("scipy").is_empty());

        let spec = MatchSpec::from_str("numpy >=2", ParseStrictness::Lenient).unwrap();
        let versions = index
            .matching_records(&spec)
            .map(|record| record.version().to_string())
            .sorted()
            .collect_vec();
        assert_eq!(versions, vec!["2.0.0", "2.1.0"]);
    }

    #[tokio::test]
    async fn test_load_remote_channel() {
        let repodata = repodata(&[("requests", "2.32.3", "pyhd8ed1ab_0")]);
        let server = TestServer::builder()
            .with_json(
                "/conda-forge/noarch/repodata.json",
                &serde_json::to_value(&repodata).unwrap(),
            )
            .with_status("/broken/noarch/repodata.json", 500)
            .start()
            .await
            .unwrap();

        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let channels = [ChannelSource::parse("conda-forge", server.url()).unwrap()];
        let index = ChannelIndex::load(&client, &channels, &[Platform::Linux64])
            .await
            .unwrap();

        // The platform subdir does not exist and counts as empty.
        assert_eq!(server.requests_for("/conda-forge/linux-64/repodata.json").len(), 1);
        assert_eq!(index.len(), 1);
        let requests = &index.records_by_name("requests")[0];
        assert_eq!(
            requests.record.url,
            server.url_for("conda-forge/noarch/requests-2.32.3-pyhd8ed1ab_0.conda")
        );

        let channels = [ChannelSource::parse("broken", server.url()).unwrap()];
        let err = ChannelIndex::load(&client, &channels, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Request(..)));
    }
}
