//! [`MockRepoData`] holds easily constructable package definitions and writes
//! them as repodata of a fake channel.

use std::{collections::HashSet, path::Path};

use miette::IntoDiagnostic;
use rattler_conda_types::{
    ChannelInfo, NoArchType, PackageName, PackageRecord, Platform, RepoData, VersionWithSource,
};
use tempfile::TempDir;
use url::Url;

/// A channel on disk backed by a temporary directory.
pub struct MockChannel {
    dir: TempDir,
}

impl MockChannel {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> Url {
        Url::from_directory_path(self.dir.path()).expect("absolute path")
    }
}

/// A database of packages.
#[derive(Default, Clone, Debug)]
pub struct MockRepoData {
    packages: Vec<Package>,
}

impl MockRepoData {
    pub fn with_package(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Writes `repodata.json` for `noarch`, the current platform and every
    /// subdir a package uses.
    pub fn write_repodata(&self, channel_path: &Path) -> miette::Result<()> {
        let mut platforms: HashSet<Platform> =
            self.packages.iter().map(|pkg| pkg.subdir).collect();
        platforms.insert(Platform::NoArch);
        platforms.insert(Platform::current());

        for platform in platforms {
            let subdir_path = channel_path.join(platform.as_str());
            fs_err::create_dir_all(&subdir_path).into_diagnostic()?;

            let conda_packages = self
                .packages
                .iter()
                .filter(|pkg| pkg.subdir == platform)
                .map(|pkg| (pkg.file_name(), pkg.package_record.clone()))
                .collect();

            let repodata = RepoData {
                info: Some(ChannelInfo {
                    subdir: Some(platform.to_string()),
                    base_url: None,
                }),
                packages: Default::default(),
                conda_packages,
                removed: Default::default(),
                version: Some(1),
            };
            fs_err::write(
                subdir_path.join("repodata.json"),
                serde_json::to_string_pretty(&repodata).into_diagnostic()?,
            )
            .into_diagnostic()?;
        }

        Ok(())
    }

    /// Writes the repodata into a new temporary channel.
    pub fn into_channel(self) -> miette::Result<MockChannel> {
        let dir = TempDir::new().into_diagnostic()?;
        self.write_repodata(dir.path())?;
        Ok(MockChannel { dir })
    }
}

/// Description of a package.
#[derive(Clone, Debug)]
pub struct Package {
    pub package_record: PackageRecord,
    subdir: Platform,
}

impl AsRef<PackageRecord> for Package {
    fn as_ref(&self) -> &PackageRecord {
        &self.package_record
    }
}

impl Package {
    /// Constructs a new noarch package, the build string defaults to the
    /// build number.
    pub fn build(name: impl ToString, version: &str) -> PackageBuilder {
        PackageBuilder {
            name: name.to_string(),
            version: version.parse().expect("valid version"),
            build: None,
            build_number: 0,
            depends: vec![],
            constrains: vec![],
            subdir: Platform::NoArch,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.conda",
            self.package_record.name.as_normalized(),
            self.package_record.version,
            self.package_record.build
        )
    }
}

/// A builder for a [`Package`].
pub struct PackageBuilder {
    name: String,
    version: VersionWithSource,
    build: Option<String>,
    build_number: u64,
    depends: Vec<String>,
    constrains: Vec<String>,
    subdir: Platform,
}

impl PackageBuilder {
    pub fn with_build(mut self, build: impl ToString) -> Self {
        self.build = Some(build.to_string());
        self
    }

    pub fn with_build_number(mut self, build_number: u64) -> Self {
        self.build_number = build_number;
        self
    }

    pub fn with_dependency(mut self, dependency: impl ToString) -> Self {
        self.depends.push(dependency.to_string());
        self
    }

    pub fn with_constraint(mut self, constraint: impl ToString) -> Self {
        self.constrains.push(constraint.to_string());
        self
    }

    /// Explicitly set the platform of this package
    pub fn with_subdir(mut self, subdir: Platform) -> Self {
        self.subdir = subdir;
        self
    }

    pub fn finish(self) -> Package {
        let build = self
            .build
            .unwrap_or_else(|| self.build_number.to_string());

        // No archive exists, the hashes are derived from the file name.
        let hash = format!("{}-{}-{}.conda", self.name, self.version, build);
        let md5 = rattler_digest::compute_bytes_digest::<rattler_digest::Md5>(&hash);
        let sha256 = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(&hash);

        let mut package_record = PackageRecord::new(
            PackageName::new_unchecked(self.name),
            self.version,
            build,
        );
        package_record.build_number = self.build_number;
        package_record.depends = self.depends;
        package_record.constrains = self.constrains;
        package_record.md5 = Some(md5);
        package_record.sha256 = Some(sha256);
        package_record.size = Some(0);
        package_record.subdir = self.subdir.to_string();
        if self.subdir == Platform::NoArch {
            package_record.noarch = NoArchType::python();
        }

        Package {
            package_record,
            subdir: self.subdir,
        }
    }
}
