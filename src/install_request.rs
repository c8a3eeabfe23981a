use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use itertools::Itertools;
use url::Url;

/// The `conda install` invocation that installs a resolved request from the
/// local channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub prefix: PathBuf,
    pub local_channel: Url,
    /// The configured channels, empty with `override_channels`.
    pub channels: Vec<String>,
    pub override_channels: bool,
    pub specs: Vec<String>,
}

impl InstallRequest {
    /// Arguments for `conda`, starting with the `install` subcommand.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--prefix".to_string(),
            self.prefix.display().to_string(),
            "-c".to_string(),
            self.local_channel.to_string(),
            "-y".to_string(),
        ];
        if self.override_channels {
            args.push("--override-channels".to_string());
        } else {
            for channel in &self.channels {
                args.push("-c".to_string());
                args.push(channel.clone());
            }
        }
        args.extend(self.specs.iter().cloned());
        args
    }
}

/// The command as a user would type it.
impl Display for InstallRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conda {}",
            self.args().iter().map(|arg| quote(arg)).join(" ")
        )
    }
}

fn quote(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || "<>|&;*?\"'$!(){}".contains(c));
    if needs_quotes {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}
