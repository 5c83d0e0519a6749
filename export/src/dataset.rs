//! Source dataset resolution: a remote URL handed to the job, or an attached file uploaded first.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use leptos::logging;
use reqwest::Url;

use crate::{ExportConfig, WorkspaceParameter};

/// Parameter types that accept an uploaded file or folder.
pub const UPLOAD_PARAMETER_TYPES: &[&str] = &[
    "FILENAME_MUSTEXIST",
    "FILENAME",
    "MULTIFILE",
    "DIRNAME_SRC",
    "DIRNAME",
];

/// Upload target used when the workspace publishes no upload-typed parameter.
pub const FALLBACK_UPLOAD_PARAMETER: &str = "SourceDataset";

/// Parameter FME Flow reads a remote dataset URL from.
pub const REMOTE_URL_PARAMETER: &str = "opt_geturl";

const BLOCKED_HOST_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal"];

/// A remote dataset URL that failed the allowlist check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteUrlError {
    /// Not an absolute URL.
    #[error("invalid URL: {0}")]
    Invalid(String),
    /// Neither http nor https.
    #[error("unsupported URL scheme {0}")]
    UnsupportedScheme(String),
    /// Plain http while only https is allowed.
    #[error("only https URLs are allowed")]
    InsecureScheme,
    /// The URL carries a user name or password.
    #[error("URLs with embedded credentials are not allowed")]
    EmbeddedCredentials,
    /// The URL has no host.
    #[error("URL has no host")]
    MissingHost,
    /// The host is local, private or otherwise not publicly routable.
    #[error("host {0} is not allowed")]
    ForbiddenHost(String),
}

/// Checks that `raw` points at a public host over https (or http when `allow_http`).
pub fn validate_remote_url(raw: &str, allow_http: bool) -> Result<Url, RemoteUrlError> {
    let url = Url::parse(raw.trim()).map_err(|err| RemoteUrlError::Invalid(err.to_string()))?;

    match url.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => return Err(RemoteUrlError::InsecureScheme),
        other => return Err(RemoteUrlError::UnsupportedScheme(other.to_string())),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(RemoteUrlError::EmbeddedCredentials);
    }

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or(RemoteUrlError::MissingHost)?
        .to_ascii_lowercase();

    let forbidden = match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => is_forbidden_ip(ip),
        Err(_) => is_forbidden_name(&host),
    };
    if forbidden {
        return Err(RemoteUrlError::ForbiddenHost(host));
    }

    Ok(url)
}

fn is_forbidden_name(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host == "localhost" || BLOCKED_HOST_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}

fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_forbidden_ipv4(ip),
        IpAddr::V6(ip) => is_forbidden_ipv6(ip),
    }
}

fn is_forbidden_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 0.0.0.0/8
        || a == 0
        // Shared address space, 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_forbidden_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_forbidden_ipv4(mapped);
    }
    let [first, second, ..] = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // Unique local, fc00::/7
        || (first & 0xfe00) == 0xfc00
        // Link local, fe80::/10
        || (first & 0xffc0) == 0xfe80
        // Documentation, 2001:db8::/32
        || (first == 0x2001 && second == 0x0db8)
}

/// Picks the parameter an uploaded file is bound to: the configured override, then the first
/// upload-typed parameter, then [`FALLBACK_UPLOAD_PARAMETER`].
pub fn select_upload_parameter(parameters: &[WorkspaceParameter], override_name: Option<&str>) -> String {
    if let Some(name) = override_name.map(str::trim).filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    parameters
        .iter()
        .find(|parameter| {
            UPLOAD_PARAMETER_TYPES
                .iter()
                .any(|kind| parameter.kind.eq_ignore_ascii_case(kind))
        })
        .map(|parameter| parameter.name.clone())
        .unwrap_or_else(|| FALLBACK_UPLOAD_PARAMETER.to_string())
}

/// File attached to the export form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// File name as chosen by the user.
    pub name: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// File contents.
    pub data: Vec<u8>,
}

/// Where the job reads its source dataset from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// The workspace's own default dataset.
    Default,
    /// A validated remote URL, bound to [`REMOTE_URL_PARAMETER`].
    RemoteUrl(Url),
    /// A file to upload and bind to `parameter`.
    Upload {
        /// File to upload.
        file: UploadFile,
        /// Parameter receiving the uploaded path.
        parameter: String,
    },
}

/// Decides the dataset source. A remote URL wins over an attached file.
///
/// A rejected URL is an error unless a file can be uploaded instead.
pub fn resolve_dataset_source(
    remote_url: Option<&str>,
    file: Option<UploadFile>,
    config: &ExportConfig,
    parameters: &[WorkspaceParameter],
) -> Result<DatasetSource, RemoteUrlError> {
    let remote_url = remote_url.map(str::trim).filter(|url| !url.is_empty());
    let file = file.filter(|_| config.allow_remote_dataset);

    if let Some(raw) = remote_url {
        if config.allow_remote_url_dataset {
            match validate_remote_url(raw, config.allow_http_remote_url) {
                Ok(url) => return Ok(DatasetSource::RemoteUrl(url)),
                Err(err) if file.is_some() => {
                    logging::warn!("Ignoring remote dataset URL: {err}");
                }
                Err(err) => {
                    logging::warn!("Rejected remote dataset URL: {err}");
                    return Err(err);
                }
            }
        } else {
            logging::warn!("Remote dataset URLs are disabled, ignoring {raw}");
        }
    }

    Ok(match file {
        Some(file) => DatasetSource::Upload {
            parameter: select_upload_parameter(parameters, config.upload_target_param_name.as_deref()),
            file,
        },
        None => DatasetSource::Default,
    })
}
