use mailparse::MailHeaderMap;

use crate::WheelError;

/// The core metadata of a distribution as found in `*.dist-info/METADATA` or
/// served next to a wheel by an index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WheelMetadata {
    pub metadata_version: Option<String>,
    pub name: String,
    pub version: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub license_expression: Option<String>,
    pub home_page: Option<String>,
    /// `Project-URL` entries as label and url.
    pub project_urls: Vec<(String, String)>,
    pub requires_python: Option<String>,
    pub requires_dist: Vec<String>,
    pub provides_extra: Vec<String>,
}

impl WheelMetadata {
    /// Parses RFC 822 style core metadata. `Name` and `Version` are required.
    pub fn parse(content: &[u8]) -> Result<Self, WheelError> {
        let (headers, body_start) = mailparse::parse_headers(content)
            .map_err(|err| WheelError::InvalidMetadata(err.to_string()))?;

        let non_empty = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty() && v != "UNKNOWN")
        };

        let name = non_empty(headers.get_first_value("Name"))
            .ok_or_else(|| WheelError::InvalidMetadata("missing 'Name' field".to_string()))?;
        let version = non_empty(headers.get_first_value("Version"))
            .ok_or_else(|| WheelError::InvalidMetadata("missing 'Version' field".to_string()))?;

        let body = String::from_utf8_lossy(&content[body_start.min(content.len())..]);
        let description = non_empty(Some(body.into_owned()))
            .or_else(|| non_empty(headers.get_first_value("Description")));

        let project_urls = headers
            .get_all_values("Project-URL")
            .into_iter()
            .filter_map(|value| {
                let (label, url) = value.split_once(',')?;
                Some((label.trim().to_string(), url.trim().to_string()))
            })
            .collect();

        Ok(Self {
            metadata_version: non_empty(headers.get_first_value("Metadata-Version")),
            name,
            version,
            summary: non_empty(headers.get_first_value("Summary")),
            description,
            license: non_empty(headers.get_first_value("License")),
            license_expression: non_empty(headers.get_first_value("License-Expression")),
            home_page: non_empty(headers.get_first_value("Home-page")),
            project_urls,
            requires_python: non_empty(headers.get_first_value("Requires-Python")),
            requires_dist: headers
                .get_all_values("Requires-Dist")
                .into_iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            provides_extra: headers
                .get_all_values("Provides-Extra")
                .into_iter()
                .map(|value| value.trim().to_string())
                .collect(),
        })
    }

    /// The license, preferring the SPDX `License-Expression`.
    pub fn license(&self) -> Option<&str> {
        self.license_expression
            .as_deref()
            .or(self.license.as_deref())
    }

    /// The homepage, falling back to a `Project-URL` labelled as homepage.
    pub fn home(&self) -> Option<&str> {
        self.home_page.as_deref().or_else(|| {
            self.project_urls
                .iter()
                .find(|(label, _)| {
                    matches!(
                        label.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str(),
                        "homepage" | "home"
                    )
                })
                .map(|(_, url)| url.as_str())
        })
    }
}
