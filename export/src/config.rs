use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::AreaThresholds;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_URL_LENGTH: usize = 4000;
const DEFAULT_AOI_PARAMETER: &str = "AreaOfInterest";
const MAX_TAG_LENGTH: usize = 128;

/// Invalid or incomplete widget configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),
    /// No server URL configured.
    #[error("no FME Flow server URL configured")]
    MissingServerUrl,
    /// The server URL is not an absolute http(s) URL.
    #[error("invalid FME Flow server URL: {0}")]
    InvalidServerUrl(String),
    /// No token configured.
    #[error("no FME Flow token configured")]
    MissingToken,
    /// No repository configured.
    #[error("no repository configured")]
    MissingRepository,
}

/// Widget configuration as stored by the settings panel.
///
/// Numeric fields accept numbers or numeric strings. Non-positive or malformed values are
/// treated as unset rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportConfig {
    /// Base URL of the FME Flow server.
    pub fme_server_url: Option<String>,
    /// API token.
    pub fme_server_token: Option<String>,
    /// Repository holding the export workspaces.
    pub repository: Option<String>,
    /// Maximum drawable area. Larger geometries are rejected.
    #[serde(deserialize_with = "lenient_f64")]
    pub max_area: Option<f64>,
    /// Area above which the user is warned and asynchronous mode is forced.
    #[serde(deserialize_with = "lenient_f64")]
    pub large_area: Option<f64>,
    /// Request timeout in milliseconds.
    #[serde(deserialize_with = "lenient_u64")]
    pub request_timeout: Option<u64>,
    /// Maximum length of a serialized request URL.
    #[serde(deserialize_with = "lenient_u64")]
    pub max_url_length: Option<u64>,
    /// Run jobs synchronously unless forced otherwise.
    pub sync_mode: bool,
    /// Allow uploading an attached file as the source dataset.
    pub allow_remote_dataset: bool,
    /// Allow a remote URL as the source dataset.
    pub allow_remote_url_dataset: bool,
    /// Accept plain http remote dataset URLs.
    pub allow_http_remote_url: bool,
    /// Explicit name of the parameter receiving uploaded files.
    pub upload_target_param_name: Option<String>,
    /// Name of the parameter receiving the area of interest.
    pub aoi_param_name: Option<String>,
    /// Default job time-to-completion in seconds.
    #[serde(rename = "tm_ttc", deserialize_with = "lenient_u64")]
    pub tm_ttc: Option<u64>,
    /// Default job time-to-live in seconds.
    #[serde(rename = "tm_ttl", deserialize_with = "lenient_u64")]
    pub tm_ttl: Option<u64>,
    /// Default job tag.
    #[serde(rename = "tm_tag")]
    pub tm_tag: Option<String>,
}

/// Connection settings derived from an [`ExportConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Server URL without trailing slash.
    pub server_url: String,
    /// API token.
    pub token: String,
    /// Repository name.
    pub repository: String,
}

/// Job directive defaults, already clamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveDefaults {
    /// Time-to-completion in seconds.
    pub tm_ttc: Option<u64>,
    /// Time-to-live in seconds.
    pub tm_ttl: Option<u64>,
    /// Job tag, trimmed and capped.
    pub tm_tag: Option<String>,
}

impl ExportConfig {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validated connection settings.
    pub fn server_settings(&self) -> Result<ServerSettings, ConfigError> {
        let server_url = non_empty(self.fme_server_url.as_deref()).ok_or(ConfigError::MissingServerUrl)?;
        let parsed = reqwest::Url::parse(server_url)
            .map_err(|err| ConfigError::InvalidServerUrl(format!("{server_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ConfigError::InvalidServerUrl(server_url.to_string()));
        }
        let token = non_empty(self.fme_server_token.as_deref()).ok_or(ConfigError::MissingToken)?;
        let repository = non_empty(self.repository.as_deref()).ok_or(ConfigError::MissingRepository)?;

        Ok(ServerSettings {
            server_url: server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            repository: repository.to_string(),
        })
    }

    /// Area thresholds for geometry evaluation.
    pub fn area_thresholds(&self) -> AreaThresholds {
        AreaThresholds {
            max_area: self.max_area,
            large_area: self.large_area,
        }
    }

    /// Directive defaults with the tag trimmed and capped at 128 characters.
    pub fn directive_defaults(&self) -> DirectiveDefaults {
        DirectiveDefaults {
            tm_ttc: self.tm_ttc,
            tm_ttl: self.tm_ttl,
            tm_tag: self.tm_tag.as_deref().and_then(clamp_tag),
        }
    }

    /// Request timeout. Defaults to 60 seconds.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Maximum serialized URL length. Defaults to 4000.
    pub fn max_url_length(&self) -> usize {
        self.max_url_length
            .and_then(|length| usize::try_from(length).ok())
            .unwrap_or(DEFAULT_MAX_URL_LENGTH)
    }

    /// Name of the parameter receiving the area of interest.
    pub fn aoi_param_name(&self) -> &str {
        non_empty(self.aoi_param_name.as_deref()).unwrap_or(DEFAULT_AOI_PARAMETER)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Trims a tag and caps it at 128 characters. Blank tags are dropped.
pub(crate) fn clamp_tag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        return None;
    }
    Some(tag.chars().take(MAX_TAG_LENGTH).collect())
}

/// Reads a positive number from a JSON number or numeric string.
pub(crate) fn positive_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (number.is_finite() && number > 0.0).then_some(number)
}

/// Reads a positive integer, truncating fractions. Non-positive values are dropped.
pub(crate) fn positive_integer(value: &Value) -> Option<u64> {
    positive_number(value)
        .map(f64::trunc)
        .filter(|number| *number >= 1.0 && *number <= u64::MAX as f64)
        .map(|number| number as u64)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(positive_number))
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(positive_integer))
}
