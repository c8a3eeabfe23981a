use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use conda_pypi_consts::consts;
use conda_pypi_utils::atomic_write_sync;
use rattler_conda_types::{
    PackageRecord, Platform, RepoData, VersionWithSource,
    package::{IndexJson, PackageFile},
};
use rattler_digest::{Md5, Sha256, compute_file_digest};
use serde::Serialize;
use url::Url;

use crate::{ChannelError, repodata::RepoDataExt};

/// A conda channel on disk that holds the packages converted from wheels.
///
/// Converted packages are always `noarch`, the current platform subdir only
/// exists so conda accepts the directory as a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChannel {
    root: PathBuf,
}

#[derive(Debug, Serialize)]
struct ChannelDataPackage {
    subdirs: Vec<String>,
    version: VersionWithSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    license: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ChannelData {
    channeldata_version: u64,
    packages: BTreeMap<String, ChannelDataPackage>,
    subdirs: Vec<String>,
}

impl LocalChannel {
    /// Opens the channel at `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the channel layout at `root` when it does not exist yet.
    pub fn ensure(root: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let channel = Self::new(root);
        for subdir in [Platform::NoArch, Platform::current()] {
            let dir = channel.root.join(subdir.as_str());
            fs_err::create_dir_all(&dir)?;
            let repodata = dir.join(consts::REPODATA_JSON);
            if !repodata.exists() {
                tracing::debug!("creating empty {}", repodata.display());
                write_json(&repodata, &RepoData::empty(subdir.as_str()))?;
            }
        }
        Ok(channel)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory converted packages are written to.
    pub fn noarch_dir(&self) -> PathBuf {
        self.root.join(consts::NOARCH_SUBDIR)
    }

    pub fn url(&self) -> Result<Url, ChannelError> {
        Url::from_directory_path(&self.root)
            .map_err(|_| ChannelError::InvalidPath(self.root.clone()))
    }

    fn repodata_path(&self) -> PathBuf {
        self.noarch_dir().join(consts::REPODATA_JSON)
    }

    /// Whether `noarch/repodata.json` exists.
    pub fn is_indexed(&self) -> bool {
        self.repodata_path().is_file()
    }

    /// Reads the current `noarch/repodata.json`.
    pub fn repodata(&self) -> Result<RepoData, ChannelError> {
        let path = self.repodata_path();
        let content = fs_err::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|err| ChannelError::InvalidRepodata(path, err))
    }

    /// The `.conda` archives in the noarch directory, sorted by name.
    pub fn package_files(&self) -> Result<Vec<PathBuf>, ChannelError> {
        let mut files = Vec::new();
        for entry in fs_err::read_dir(self.noarch_dir())? {
            let path = entry?.path();
            let is_conda = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(consts::CONDA_PACKAGE_EXTENSION));
            if is_conda && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Rebuilds `noarch/repodata.json` and `channeldata.json` from the
    /// archives in the noarch directory.
    ///
    /// Records of archives whose name and size did not change are reused
    /// without reading or hashing the archive again.
    pub fn reindex(&self) -> Result<RepoData, ChannelError> {
        let previous = if self.is_indexed() {
            match self.repodata() {
                Ok(repodata) => repodata,
                Err(err) => {
                    tracing::warn!("ignoring unreadable repodata: {err}");
                    RepoData::empty(consts::NOARCH_SUBDIR)
                }
            }
        } else {
            RepoData::empty(consts::NOARCH_SUBDIR)
        };

        let mut repodata = RepoData::empty(consts::NOARCH_SUBDIR);
        for path in self.package_files()? {
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| ChannelError::InvalidPath(path.clone()))?
                .to_string();
            let size = fs_err::metadata(&path)?.len();

            if let Some(record) = previous
                .conda_packages
                .get(&file_name)
                .filter(|record| record.size == Some(size))
            {
                repodata
                    .conda_packages
                    .insert(file_name, record.clone());
                continue;
            }

            match index_package(&path, size) {
                Ok(record) => {
                    tracing::debug!("indexed {file_name}");
                    repodata.conda_packages.insert(file_name, record);
                }
                Err(err) => tracing::warn!("skipping {}: {err}", path.display()),
            }
        }

        write_json(&self.repodata_path(), &repodata)?;
        self.write_channeldata(&repodata)?;

        tracing::info!(
            "indexed {} packages in {}",
            repodata.conda_packages.len(),
            self.root.display()
        );
        Ok(repodata)
    }

    fn write_channeldata(&self, repodata: &RepoData) -> Result<(), ChannelError> {
        let mut packages: BTreeMap<String, ChannelDataPackage> = BTreeMap::new();
        for (_, record) in repodata.records() {
            let name = record.name.as_normalized();
            let newer = packages
                .get(name)
                .is_none_or(|existing| record.version > existing.version);
            if newer {
                packages.insert(
                    name.to_string(),
                    ChannelDataPackage {
                        subdirs: vec![consts::NOARCH_SUBDIR.to_string()],
                        version: record.version.clone(),
                        license: record.license.clone().filter(|l| !l.is_empty()),
                        timestamp: record.timestamp.map(|t| t.timestamp_millis()),
                    },
                );
            }
        }
        let channeldata = ChannelData {
            channeldata_version: 1,
            packages,
            subdirs: vec![consts::NOARCH_SUBDIR.to_string()],
        };
        write_json(&self.root.join(consts::CHANNELDATA_JSON), &channeldata)
    }
}

/// Reads `info/index.json` from a `.conda` archive.
///
/// Archives that are not valid zip files or lack the info component are
/// reported as [`ChannelError::ReadPackage`].
pub(crate) fn read_index_json(path: &Path) -> Result<IndexJson, ChannelError> {
    let read_error = |err: &dyn std::fmt::Display| {
        ChannelError::ReadPackage(path.to_path_buf(), err.to_string())
    };
    let file = fs_err::File::open(path)?;
    let mut info = rattler_package_streaming::seek::stream_conda_info(file)
        .map_err(|err| read_error(&err))?;
    for entry in info.entries().map_err(|err| read_error(&err))? {
        let mut entry = entry.map_err(|err| read_error(&err))?;
        let is_index = entry
            .path()
            .is_ok_and(|entry_path| &*entry_path == IndexJson::package_path());
        if is_index {
            return IndexJson::from_reader(&mut entry).map_err(|err| read_error(&err));
        }
    }
    Err(read_error(&"the archive has no info/index.json"))
}

fn index_package(path: &Path, size: u64) -> Result<PackageRecord, ChannelError> {
    let index = read_index_json(path)?;
    let sha256 = compute_file_digest::<Sha256>(path)?;
    let md5 = compute_file_digest::<Md5>(path)?;
    PackageRecord::from_index_json(index, Some(size), Some(sha256), Some(md5))
        .map_err(|err| ChannelError::ReadPackage(path.to_path_buf(), err.to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ChannelError> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|err| ChannelError::InvalidRepodata(path.to_path_buf(), err))?;
    atomic_write_sync(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::ensure(dir.path().join("pypi")).unwrap();

        assert!(channel.is_indexed());
        assert!(
            channel
                .root()
                .join(Platform::current().as_str())
                .join("repodata.json")
                .is_file()
        );
        let repodata = channel.repodata().unwrap();
        assert!(repodata.is_empty());
        assert_eq!(repodata.version, Some(1));
    }

    #[test]
    fn test_ensure_keeps_existing_repodata() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::ensure(dir.path()).unwrap();
        let path = channel.noarch_dir().join("repodata.json");
        fs_err::write(&path, r#"{"packages": {}, "packages.conda": {}, "repodata_version": 1, "info": {"subdir": "noarch"}, "extra": true}"#).unwrap();

        LocalChannel::ensure(dir.path()).unwrap();
        assert!(fs_err::read_to_string(&path).unwrap().contains("extra"));
    }

    #[test]
    fn test_reindex_skips_invalid_archives() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::ensure(dir.path()).unwrap();
        fs_err::write(channel.noarch_dir().join("broken-1.0-pypi_0.conda"), "garbage").unwrap();
        fs_err::write(channel.noarch_dir().join("notes.txt"), "ignored").unwrap();

        let repodata = channel.reindex().unwrap();
        assert!(repodata.is_empty());
        assert!(dir.path().join("channeldata.json").is_file());
    }

    #[test]
    fn test_read_index_json_of_invalid_archives() {
        let dir = tempfile::tempdir().unwrap();

        let garbage = dir.path().join("garbage-1.0-pypi_0.conda");
        fs_err::write(&garbage, "garbage").unwrap();
        let err = read_index_json(&garbage).unwrap_err();
        assert!(matches!(err, ChannelError::ReadPackage(path, _) if path == garbage));

        // A valid zip without the info component.
        let empty_zip = dir.path().join("empty-1.0-pypi_0.conda");
        let mut writer = zip::ZipWriter::new(fs_err::File::create(&empty_zip).unwrap());
        writer
            .start_file(
                "metadata.json",
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        std::io::Write::write_all(&mut writer, br#"{"conda_pkg_format_version": 2}"#).unwrap();
        writer.finish().unwrap();
        let err = read_index_json(&empty_zip).unwrap_err();
        assert!(matches!(err, ChannelError::ReadPackage(..)));
    }
}
