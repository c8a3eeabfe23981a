use crate::filename::WheelFilename;

/// The tags a target python environment accepts.
///
/// Converted packages are always `noarch`, so only `any` platform wheels are
/// accepted unless additional platform tags are configured explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityTags {
    major: u64,
    minor: u64,
    platforms: Vec<String>,
}

impl CompatibilityTags {
    pub fn new(major: u64, minor: u64, platforms: Vec<String>) -> Self {
        Self {
            major,
            minor,
            platforms,
        }
    }

    pub fn python_version(&self) -> (u64, u64) {
        (self.major, self.minor)
    }

    /// Ranks an interpreter/abi pair, lower is better.
    ///
    /// Order: `cpXY-cpXY`, `cpXY-abi3` (newest first), `cpXY-none`, `pyXY`
    /// (newest first), `pyX`.
    fn interpreter_rank(&self, python: &str, abi: &str) -> Option<u64> {
        if let Some(version) = python.strip_prefix("cp") {
            let (major, minor) = split_tag_version(version)?;
            let minor = minor?;
            if major != self.major || minor > self.minor {
                return None;
            }
            let exact = format!("cp{}{}", self.major, self.minor);
            if abi == exact || abi.strip_prefix(exact.as_str()).is_some_and(|s| s.len() == 1) {
                return (minor == self.minor).then_some(0);
            }
            return match abi {
                "abi3" => Some(1 + (self.minor - minor)),
                "none" if minor == self.minor => Some(self.minor + 2),
                _ => None,
            };
        }

        let version = python.strip_prefix("py")?;
        if abi != "none" {
            return None;
        }
        let offset = self.minor + 3;
        match split_tag_version(version)? {
            (major, Some(minor)) if major == self.major && minor <= self.minor => {
                Some(offset + (self.minor - minor))
            }
            (major, None) if major == self.major => Some(offset + self.minor + 1),
            _ => None,
        }
    }

    fn platform_rank(&self, platform: &str) -> Option<u64> {
        if platform == "any" {
            return Some(self.platforms.len() as u64);
        }
        self.platforms
            .iter()
            .position(|p| p == platform)
            .map(|idx| idx as u64)
    }

    /// Returns the priority of the best matching tag of the wheel, lower is
    /// better. `None` means the wheel is not compatible.
    pub fn priority(&self, filename: &WheelFilename) -> Option<u64> {
        let platform_count = self.platforms.len() as u64 + 1;
        filename
            .tags()
            .filter_map(|(python, abi, platform)| {
                let interpreter = self.interpreter_rank(python, abi)?;
                let platform = self.platform_rank(platform)?;
                Some(interpreter * platform_count + platform)
            })
            .min()
    }

    pub fn is_compatible(&self, filename: &WheelFilename) -> bool {
        self.priority(filename).is_some()
    }
}

/// Splits the version part of a tag like `312` or `3` into major and minor.
fn split_tag_version(version: &str) -> Option<(u64, Option<u64>)> {
    let mut chars = version.chars();
    let major = chars.next()?.to_digit(10)? as u64;
    let rest = chars.as_str();
    if rest.is_empty() {
        return Some((major, None));
    }
    Some((major, Some(rest.parse().ok()?)))
}
