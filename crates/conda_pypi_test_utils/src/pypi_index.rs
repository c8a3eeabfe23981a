//! Fake wheels and PyPI indexes for tests.
//!
//! - Flat (find-links) directories of wheels
//! - PEP 691 json project pages describing those wheels

use std::{
    borrow::Cow,
    fmt::Write as _,
    io::Write as _,
    path::{Path, PathBuf},
};

use miette::IntoDiagnostic;
use tempfile::TempDir;
use url::Url;
use zip::{ZipWriter, write::SimpleFileOptions};

/// A wheel tag triple, defaults to `py3-none-any`.
#[derive(Clone, Debug)]
pub struct WheelTag {
    pub py: String,
    pub abi: String,
    pub plat: String,
}

impl Default for WheelTag {
    fn default() -> Self {
        Self {
            py: "py3".to_string(),
            abi: "none".to_string(),
            plat: "any".to_string(),
        }
    }
}

/// Description of a fake PyPI package that is emitted as a wheel.
#[derive(Clone, Debug)]
pub struct PyPIPackage {
    pub name: String,
    pub version: String,
    pub tag: WheelTag,
    pub requires_dist: Vec<String>,
    pub requires_python: Option<String>,
    pub summary: Option<String>,
    pub license: Option<String>,
    pub console_scripts: Vec<(String, String)>,
    /// Files below `{name}-{version}.data/`, e.g. `scripts/tool`.
    pub data_files: Vec<(String, Vec<u8>)>,
    pub yanked: bool,
}

impl PyPIPackage {
    /// Start building a package (defaults to `py3-none-any`).
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tag: WheelTag::default(),
            requires_dist: vec![],
            requires_python: None,
            summary: None,
            license: None,
            console_scripts: vec![],
            data_files: vec![],
            yanked: false,
        }
    }

    pub fn with_tag(
        mut self,
        py: impl Into<String>,
        abi: impl Into<String>,
        plat: impl Into<String>,
    ) -> Self {
        self.tag = WheelTag {
            py: py.into(),
            abi: abi.into(),
            plat: plat.into(),
        };
        self
    }

    pub fn with_requires_dist(mut self, reqs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.requires_dist = reqs.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn with_requires_python(mut self, spec: impl Into<String>) -> Self {
        self.requires_python = Some(spec.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    /// Adds a `console_scripts` entry point, e.g. `("demo", "demo.cli:main")`.
    pub fn with_console_script(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.console_scripts.push((name.into(), target.into()));
        self
    }

    pub fn with_data_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.data_files.push((path.into(), content.into()));
        self
    }

    pub fn yanked(mut self) -> Self {
        self.yanked = true;
        self
    }

    /// The wheel filename: `{name}-{version}-{py}-{abi}-{plat}.whl`.
    pub fn wheel_filename(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}.whl",
            normalize_dist_name(&self.name),
            &self.version,
            self.tag.py,
            self.tag.abi,
            self.tag.plat
        )
    }

    fn dist_info_dir(&self) -> String {
        format!(
            "{}-{}.dist-info",
            normalize_dist_name(&self.name),
            &self.version
        )
    }

    fn data_dir(&self) -> String {
        format!("{}-{}.data", normalize_dist_name(&self.name), &self.version)
    }

    /// The METADATA file contents.
    pub fn metadata(&self) -> String {
        let mut s = String::new();
        s.push_str("Metadata-Version: 2.1\n");
        let _ = writeln!(s, "Name: {}", self.name);
        let _ = writeln!(s, "Version: {}", self.version);
        if let Some(summary) = &self.summary {
            let _ = writeln!(s, "Summary: {summary}");
        }
        if let Some(license) = &self.license {
            let _ = writeln!(s, "License: {license}");
        }
        if let Some(rp) = &self.requires_python {
            let _ = writeln!(s, "Requires-Python: {rp}");
        }
        for req in &self.requires_dist {
            let _ = writeln!(s, "Requires-Dist: {req}");
        }
        s.push_str("\nA package generated for tests.\n");
        s
    }

    fn wheel_file(&self) -> String {
        format!(
            "Wheel-Version: 1.0\nGenerator: conda-pypi-tests\nRoot-Is-Purelib: true\nTag: {}-{}-{}\n",
            self.tag.py, self.tag.abi, self.tag.plat
        )
    }

    fn entry_points(&self) -> Option<String> {
        if self.console_scripts.is_empty() {
            return None;
        }
        let mut s = String::from("[console_scripts]\n");
        for (name, target) in &self.console_scripts {
            let _ = writeln!(s, "{name} = {target}");
        }
        Some(s)
    }

    fn module(&self) -> (String, Vec<u8>) {
        let module_dir = normalize_dist_name(&self.name).to_lowercase();
        let path = format!("{module_dir}/__init__.py");
        let content = format!(
            "# generated by conda-pypi tests\n__version__ = \"{}\"\n",
            self.version
        );
        (path, content.into_bytes())
    }

    /// Writes the wheel to `out_dir` and returns its path.
    pub fn write_wheel(&self, out_dir: &Path) -> miette::Result<PathBuf> {
        let wheel_path = out_dir.join(self.wheel_filename());

        let file = fs_err::File::create(&wheel_path).into_diagnostic()?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        let dist_info = self.dist_info_dir();
        let mut entries: Vec<(String, Vec<u8>)> = vec![self.module()];
        for (path, content) in &self.data_files {
            entries.push((format!("{}/{path}", self.data_dir()), content.clone()));
        }
        entries.push((format!("{dist_info}/METADATA"), self.metadata().into_bytes()));
        entries.push((format!("{dist_info}/WHEEL"), self.wheel_file().into_bytes()));
        if let Some(entry_points) = self.entry_points() {
            entries.push((
                format!("{dist_info}/entry_points.txt"),
                entry_points.into_bytes(),
            ));
        }

        for (name, bytes) in &entries {
            zip.start_file(name.as_str(), options).into_diagnostic()?;
            zip.write_all(bytes).into_diagnostic()?;
        }

        // Hashes and sizes may be omitted from RECORD.
        let mut record = String::new();
        for (name, _) in &entries {
            let _ = writeln!(record, "{name},,");
        }
        let record_path = format!("{dist_info}/RECORD");
        let _ = writeln!(record, "{record_path},,");
        zip.start_file(record_path.as_str(), options).into_diagnostic()?;
        zip.write_all(record.as_bytes()).into_diagnostic()?;

        zip.finish().into_diagnostic()?;
        Ok(wheel_path)
    }
}

/// Replaces `-` with `_` as done for wheel filenames.
fn normalize_dist_name(name: &str) -> Cow<'_, str> {
    if name.contains('-') {
        Cow::Owned(name.replace('-', "_"))
    } else {
        Cow::Borrowed(name)
    }
}

/// A collection of packages that can be written as a flat index.
#[derive(Default)]
pub struct Database {
    packages: Vec<PyPIPackage>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pkg: PyPIPackage) {
        self.packages.push(pkg);
    }

    pub fn with(mut self, pkg: PyPIPackage) -> Self {
        self.add(pkg);
        self
    }

    /// Writes all packages as wheels to a temporary directory.
    pub fn into_flat_index(self) -> miette::Result<FlatIndex> {
        let dir = TempDir::new().into_diagnostic()?;
        for pkg in &self.packages {
            pkg.write_wheel(dir.path())?;
        }
        Ok(FlatIndex {
            dir,
            packages: self.packages,
        })
    }
}

/// A local flat index (find-links), a directory of wheel files.
pub struct FlatIndex {
    dir: TempDir,
    packages: Vec<PyPIPackage>,
}

impl FlatIndex {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn wheel_path(&self, pkg: &PyPIPackage) -> PathBuf {
        self.dir.path().join(pkg.wheel_filename())
    }

    /// The PEP 503 normalized names of the projects in this index.
    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self
            .packages
            .iter()
            .map(|pkg| project_name(&pkg.name))
            .collect();
        projects.sort();
        projects.dedup();
        projects
    }

    /// Filenames and paths of all wheels.
    pub fn wheels(&self) -> Vec<(String, PathBuf)> {
        self.packages
            .iter()
            .map(|pkg| (pkg.wheel_filename(), self.wheel_path(pkg)))
            .collect()
    }

    /// A PEP 691 json project page for `project` pointing at the wheels in
    /// this directory with `file://` urls.
    pub fn json_project_page(&self, project: &str) -> miette::Result<serde_json::Value> {
        self.json_project_page_with(project, |filename| {
            let path = self.dir.path().join(filename);
            Url::from_file_path(&path)
                .map(String::from)
                .map_err(|_| miette::miette!("not an absolute path: {}", path.display()))
        })
    }

    /// A PEP 691 json project page for `project`, `file_url` turns a wheel
    /// filename into the url written to the page.
    pub fn json_project_page_with(
        &self,
        project: &str,
        file_url: impl Fn(&str) -> miette::Result<String>,
    ) -> miette::Result<serde_json::Value> {
        let project = project_name(project);
        let mut files = Vec::new();
        for pkg in self
            .packages
            .iter()
            .filter(|pkg| project_name(&pkg.name) == project)
        {
            let filename = pkg.wheel_filename();
            let bytes = fs_err::read(self.wheel_path(pkg)).into_diagnostic()?;
            let sha256 = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(&bytes);
            let mut file = serde_json::json!({
                "filename": filename,
                "url": file_url(&filename)?,
                "hashes": { "sha256": format!("{sha256:x}") },
                "yanked": pkg.yanked,
            });
            if let Some(requires_python) = &pkg.requires_python {
                file["requires-python"] = serde_json::Value::from(requires_python.as_str());
            }
            files.push(file);
        }
        Ok(serde_json::json!({
            "meta": { "api-version": "1.1" },
            "name": project,
            "files": files,
        }))
    }
}

/// Lowercases and collapses `_` and `.` into `-`.
fn project_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}
