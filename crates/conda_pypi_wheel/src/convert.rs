use std::{
    io::Read,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use conda_pypi_consts::consts;
use conda_pypi_mapping::NameMapping;
use rattler_conda_types::{
    compression_level::CompressionLevel,
    package::{EntryPoint, PathType, PathsEntry, PathsJson},
};
use rattler_digest::{Sha256, compute_bytes_digest, compute_file_digest};
use zip::ZipArchive;

use crate::{
    WheelError,
    conda_metadata::{CondaMetadata, parse_console_scripts},
    filename::WheelFilename,
    metadata::WheelMetadata,
};

const SITE_PACKAGES: &str = "site-packages";
const PYTHON_SCRIPTS: &str = "python-scripts";

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Keep the PyPI name instead of mapping it to a conda name.
    pub skip_name_mapping: bool,
    /// Replace an already converted package instead of reusing it.
    pub overwrite: bool,
    pub compression_level: CompressionLevel,
}

#[derive(Debug, Clone)]
pub struct ConvertedPackage {
    /// The path of the written `.conda` archive.
    pub path: PathBuf,
    pub wheel: PathBuf,
    pub metadata: CondaMetadata,
    /// True when an existing archive was kept.
    pub reused: bool,
}

/// The metadata of a wheel as found in its `.dist-info` directory.
#[derive(Debug, Clone)]
pub struct WheelInfo {
    pub filename: WheelFilename,
    /// The name of the `.dist-info` directory, e.g. `requests-2.32.3.dist-info`.
    pub dist_info: String,
    pub metadata: WheelMetadata,
    pub console_scripts: Vec<EntryPoint>,
}

impl WheelInfo {
    /// Builds conda metadata for the wheel.
    pub fn conda_metadata(
        &self,
        mapping: &NameMapping,
        skip_name_mapping: bool,
    ) -> Result<CondaMetadata, WheelError> {
        CondaMetadata::from_wheel_metadata(
            &self.metadata,
            self.console_scripts.clone(),
            mapping,
            skip_name_mapping,
        )
    }

    fn data_dir(&self) -> String {
        let stem = self
            .dist_info
            .strip_suffix(".dist-info")
            .unwrap_or(&self.dist_info);
        format!("{stem}.data")
    }
}

fn wheel_filename(wheel: &Path) -> Result<WheelFilename, WheelError> {
    let name = wheel
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WheelError::InvalidPath(wheel.to_path_buf()))?;
    Ok(WheelFilename::from_str(name)?)
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, WheelError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

fn read_wheel_info_from_archive<R: Read + std::io::Seek>(
    wheel: &Path,
    archive: &mut ZipArchive<R>,
) -> Result<WheelInfo, WheelError> {
    let filename = wheel_filename(wheel)?;

    let dist_info = archive
        .file_names()
        .filter_map(|name| name.strip_suffix("/METADATA"))
        .filter(|dir| dir.ends_with(".dist-info") && !dir.contains('/'))
        .min_by_key(|dir| {
            // Prefer the directory that belongs to the distribution in the
            // filename when a wheel vendors other dist-info directories.
            !dir.to_ascii_lowercase()
                .starts_with(&filename.distribution.to_ascii_lowercase())
        })
        .map(str::to_string)
        .ok_or_else(|| WheelError::MissingMetadata(wheel.to_path_buf()))?;

    let metadata = read_entry(archive, &format!("{dist_info}/METADATA"))?
        .ok_or_else(|| WheelError::MissingMetadata(wheel.to_path_buf()))?;
    let metadata = WheelMetadata::parse(&metadata)?;

    let console_scripts = read_entry(archive, &format!("{dist_info}/entry_points.txt"))?
        .map(|bytes| parse_console_scripts(&String::from_utf8_lossy(&bytes)))
        .unwrap_or_default();

    Ok(WheelInfo {
        filename,
        dist_info,
        metadata,
        console_scripts,
    })
}

/// Reads the metadata of a wheel without unpacking it.
pub fn read_wheel_metadata(wheel: &Path) -> Result<WheelInfo, WheelError> {
    let file = fs_err::File::open(wheel)?;
    let mut archive = ZipArchive::new(file)?;
    read_wheel_info_from_archive(wheel, &mut archive)
}

/// Where a file of the wheel ends up in the noarch python package layout.
fn install_location(info: &WheelInfo, path: &Path) -> Result<Option<PathBuf>, WheelError> {
    let mut components = path.components();
    let first = match components.next() {
        Some(Component::Normal(first)) => first.to_string_lossy(),
        _ => return Err(WheelError::UnsafePath(path.display().to_string())),
    };

    if first == info.data_dir() {
        let scheme = match components.next() {
            Some(Component::Normal(scheme)) => scheme.to_string_lossy().into_owned(),
            _ => return Err(WheelError::UnsafePath(path.display().to_string())),
        };
        let rest = components.as_path();
        return Ok(match scheme.as_str() {
            "purelib" | "platlib" => Some(Path::new(SITE_PACKAGES).join(rest)),
            "scripts" => Some(Path::new(PYTHON_SCRIPTS).join(rest)),
            "data" => Some(rest.to_path_buf()),
            "headers" => Some(
                Path::new("include")
                    .join(&info.metadata.name)
                    .join(rest),
            ),
            other => {
                tracing::warn!("skipping '{}' with unknown scheme '{other}'", path.display());
                None
            }
        });
    }

    if first == info.dist_info {
        let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or_default();
        if path.parent() == Some(Path::new(&info.dist_info))
            && matches!(file_name, "RECORD" | "RECORD.jws" | "RECORD.p7s" | "INSTALLER")
        {
            return Ok(None);
        }
    }

    Ok(Some(Path::new(SITE_PACKAGES).join(path)))
}

/// The path of an installed file as written to RECORD, relative to the
/// site-packages directory of the environment.
fn record_path(location: &Path) -> String {
    let as_posix = |path: &Path| {
        path.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    };
    if let Ok(rest) = location.strip_prefix(SITE_PACKAGES) {
        as_posix(rest)
    } else if let Ok(rest) = location.strip_prefix(PYTHON_SCRIPTS) {
        format!("../../../bin/{}", as_posix(rest))
    } else {
        format!("../../../{}", as_posix(location))
    }
}

fn record_hash(bytes: &[u8]) -> String {
    let digest = compute_bytes_digest::<Sha256>(bytes);
    format!("sha256={}", URL_SAFE_NO_PAD.encode(digest))
}

#[cfg(unix)]
fn set_executable(path: &Path, mode: Option<u32>) -> Result<(), WheelError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode
        && mode & 0o111 != 0
    {
        fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _mode: Option<u32>) -> Result<(), WheelError> {
    Ok(())
}

/// Unpacks the wheel into `staging` using the noarch python layout and
/// rewrites RECORD. Returns the paths that were written.
fn unpack_wheel<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    info: &WheelInfo,
    staging: &Path,
) -> Result<(), WheelError> {
    let mut records = Vec::new();

    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| WheelError::UnsafePath(entry.name().to_string()))?;
        let Some(location) = install_location(info, &relative)? else {
            continue;
        };

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;

        let destination = staging.join(&location);
        if let Some(parent) = destination.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(&destination, &bytes)?;
        set_executable(&destination, entry.unix_mode())?;

        records.push((
            record_path(&location),
            record_hash(&bytes),
            bytes.len().to_string(),
        ));
    }

    let dist_info_dir = staging.join(SITE_PACKAGES).join(&info.dist_info);
    fs_err::create_dir_all(&dist_info_dir)?;

    let installer = format!("{}\n", consts::CONDA_INSTALLER);
    fs_err::write(dist_info_dir.join("INSTALLER"), &installer)?;
    records.push((
        format!("{}/INSTALLER", info.dist_info),
        record_hash(installer.as_bytes()),
        installer.len().to_string(),
    ));
    records.push((format!("{}/RECORD", info.dist_info), String::new(), String::new()));

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in &records {
        writer.write_record([&record.0, &record.1, &record.2])?;
    }
    let record = writer
        .into_inner()
        .map_err(|err| WheelError::Io(err.into_error()))?;
    fs_err::write(dist_info_dir.join("RECORD"), record)?;

    Ok(())
}

/// Recursively collects every file below `dir`, skipping `.git` entries and
/// the top level `info` directory.
fn collect_files(base: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), WheelError> {
    for entry in fs_err::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" || (dir == base && entry.file_name() == "info") {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &path, files)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            files.push(path);
        } else {
            tracing::debug!("not a regular file: {}", path.display());
        }
    }
    Ok(())
}

/// Builds `info/paths.json` for the files in `base`.
pub fn paths_json(base: &Path) -> Result<PathsJson, WheelError> {
    let mut files = Vec::new();
    collect_files(base, base, &mut files)?;

    let mut paths = Vec::with_capacity(files.len());
    for file in files {
        let relative_path = file
            .strip_prefix(base)
            .map_err(|_| WheelError::InvalidPath(file.clone()))?
            .to_path_buf();

        let is_symlink = fs_err::symlink_metadata(&file)?.file_type().is_symlink();
        let (sha256, size_in_bytes) = match fs_err::metadata(&file) {
            Ok(metadata) => (compute_file_digest::<Sha256>(&file)?, metadata.len()),
            // A symlink pointing nowhere is recorded as an empty file.
            Err(_) if is_symlink => (compute_bytes_digest::<Sha256>(b""), 0),
            Err(err) => return Err(err.into()),
        };

        paths.push(PathsEntry {
            relative_path,
            no_link: false,
            path_type: if is_symlink {
                PathType::SoftLink
            } else {
                PathType::HardLink
            },
            prefix_placeholder: None,
            sha256: Some(sha256),
            size_in_bytes: Some(size_in_bytes),
        });
    }
    paths.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(PathsJson {
        paths,
        paths_version: 1,
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), WheelError> {
    fs_err::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Converts a wheel into a `noarch: python` conda package in `output_dir`.
///
/// The archive is named `{name}-{version}-pypi_0.conda`. An existing archive
/// with that name is reused unless [`ConvertOptions::overwrite`] is set.
pub fn convert_wheel(
    wheel: &Path,
    output_dir: &Path,
    mapping: &NameMapping,
    options: &ConvertOptions,
) -> Result<ConvertedPackage, WheelError> {
    let file = fs_err::File::open(wheel)?;
    let mut archive = ZipArchive::new(file)?;
    let info = read_wheel_info_from_archive(wheel, &mut archive)?;
    let metadata = info.conda_metadata(mapping, options.skip_name_mapping)?;

    fs_err::create_dir_all(output_dir)?;
    let output = output_dir.join(metadata.file_name());
    if output.exists() {
        if !options.overwrite {
            tracing::debug!("reusing existing package {}", output.display());
            return Ok(ConvertedPackage {
                path: output,
                wheel: wheel.to_path_buf(),
                metadata,
                reused: true,
            });
        }
        fs_err::remove_file(&output)?;
    }

    let staging = tempfile::tempdir()?;
    unpack_wheel(&mut archive, &info, staging.path())?;

    let info_dir = staging.path().join("info");
    fs_err::create_dir_all(&info_dir)?;
    let paths = paths_json(staging.path())?;
    write_json(&info_dir.join("index.json"), &metadata.index)?;
    write_json(&info_dir.join("about.json"), &metadata.about)?;
    if let Some(link) = metadata.link_json() {
        write_json(&info_dir.join("link.json"), &link)?;
    }
    write_json(&info_dir.join("paths.json"), &paths)?;

    let mut files = Vec::new();
    collect_files(staging.path(), staging.path(), &mut files)?;
    for entry in fs_err::read_dir(&info_dir)? {
        files.push(entry?.path());
    }

    let mut temp_file = tempfile::NamedTempFile::new_in(output_dir)?;
    rattler_package_streaming::write::write_conda_package(
        temp_file.as_file_mut(),
        staging.path(),
        &files,
        options.compression_level,
        None,
        &metadata.stem(),
        None,
        None,
    )
    .map_err(|err| WheelError::WritePackage(output.clone(), err))?;
    temp_file
        .persist(&output)
        .map_err(|err| WheelError::WritePackage(output.clone(), err.error))?;

    tracing::info!(
        "converted {} into {}",
        wheel.display(),
        output.display()
    );

    Ok(ConvertedPackage {
        path: output,
        wheel: wheel.to_path_buf(),
        metadata,
        reused: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> WheelInfo {
        WheelInfo {
            filename: WheelFilename::from_str("demo_pkg-1.0-py3-none-any.whl").unwrap(),
            dist_info: "demo_pkg-1.0.dist-info".to_string(),
            metadata: WheelMetadata {
                name: "demo-pkg".to_string(),
                version: "1.0".to_string(),
                ..WheelMetadata::default()
            },
            console_scripts: vec![],
        }
    }

    #[test]
    fn test_install_location() {
        let info = info();
        let location = |p: &str| install_location(&info, Path::new(p)).unwrap();
        assert_eq!(
            location("demo_pkg/__init__.py"),
            Some(PathBuf::from("site-packages/demo_pkg/__init__.py"))
        );
        assert_eq!(
            location("demo_pkg-1.0.data/scripts/demo"),
            Some(PathBuf::from("python-scripts/demo"))
        );
        assert_eq!(
            location("demo_pkg-1.0.data/data/share/demo.txt"),
            Some(PathBuf::from("share/demo.txt"))
        );
        assert_eq!(
            location("demo_pkg-1.0.data/headers/demo.h"),
            Some(PathBuf::from("include/demo-pkg/demo.h"))
        );
        assert_eq!(
            location("demo_pkg-1.0.data/platlib/native.so"),
            Some(PathBuf::from("site-packages/native.so"))
        );
        assert_eq!(location("demo_pkg-1.0.dist-info/RECORD"), None);
        assert_eq!(location("demo_pkg-1.0.dist-info/INSTALLER"), None);
        assert_eq!(
            location("demo_pkg-1.0.dist-info/METADATA"),
            Some(PathBuf::from("site-packages/demo_pkg-1.0.dist-info/METADATA"))
        );
    }

    #[test]
    fn test_record_path() {
        assert_eq!(
            record_path(Path::new("site-packages/demo_pkg/__init__.py")),
            "demo_pkg/__init__.py"
        );
        assert_eq!(
            record_path(Path::new("python-scripts/demo")),
            "../../../bin/demo"
        );
        assert_eq!(
            record_path(Path::new("share/demo.txt")),
            "../../../share/demo.txt"
        );
    }

    #[test]
    fn test_record_hash() {
        assert_eq!(
            record_hash(b""),
            "sha256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn test_paths_json_skips_info_and_git() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs_err::create_dir_all(base.join("info")).unwrap();
        fs_err::create_dir_all(base.join("site-packages/pkg/.git")).unwrap();
        fs_err::write(base.join("info/index.json"), "{}").unwrap();
        fs_err::write(base.join("site-packages/pkg/.git/HEAD"), "ref").unwrap();
        fs_err::write(base.join("site-packages/pkg/b.py"), "b").unwrap();
        fs_err::write(base.join("site-packages/pkg/a.py"), "").unwrap();

        let paths = paths_json(base).unwrap();
        assert_eq!(paths.paths_version, 1);
        let names: Vec<_> = paths.paths.iter().map(|p| p.relative_path.as_path()).collect();
        assert_eq!(
            names,
            vec![
                Path::new("site-packages/pkg/a.py"),
                Path::new("site-packages/pkg/b.py")
            ]
        );
        assert_eq!(
            format!("{:x}", paths.paths[0].sha256.unwrap()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(paths.paths[1].size_in_bytes, Some(1));
        assert_eq!(paths.paths[1].path_type, PathType::HardLink);
    }
}
