use rattler_conda_types::{ChannelInfo, PackageRecord, RepoData};

/// Helpers on top of [`RepoData`] that the channel code needs everywhere.
pub trait RepoDataExt {
    /// An empty repodata for the given subdir.
    fn empty(subdir: &str) -> Self;

    /// Iterates over all records with their filename, `.conda` archives first.
    fn records(&self) -> impl Iterator<Item = (&String, &PackageRecord)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RepoDataExt for RepoData {
    fn empty(subdir: &str) -> Self {
        RepoData {
            info: Some(ChannelInfo {
                subdir: Some(subdir.to_string()),
                base_url: None,
            }),
            packages: Default::default(),
            conda_packages: Default::default(),
            removed: Default::default(),
            version: Some(1),
        }
    }

    fn records(&self) -> impl Iterator<Item = (&String, &PackageRecord)> {
        self.conda_packages.iter().chain(self.packages.iter())
    }

    fn len(&self) -> usize {
        self.packages.len() + self.conda_packages.len()
    }
}
