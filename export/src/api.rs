//! FME Flow REST v3 and data download client.

use async_trait::async_trait;
use fme_query::{AbortSignal, QueryError};
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    transport::{HttpRequest, HttpResponse, RequestBody, RequestTransport},
    ServerSettings, ServiceMode, UploadFile,
};

const REST_ROOT: &[&str] = &["fmerest", "v3"];
const DATA_DOWNLOAD_SERVICE: &str = "fmedatadownload";
/// Shared resource connection for temporary uploads.
pub const TEMP_RESOURCE: &str = "FME_SHAREDRESOURCE_TEMP";

/// Body of a successful call that is not plain metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Streamed result of a synchronous job.
    Blob {
        /// Payload.
        data: Vec<u8>,
        /// MIME type, if declared.
        content_type: Option<String>,
    },
    /// JSON document, usually a job status envelope.
    Json(Value),
}

/// Repository listed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Repository {
    /// Name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Owner.
    pub owner: Option<String>,
}

/// Workspace or other repository item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryItem {
    /// File name, including the `.fmw` extension.
    pub name: String,
    /// Display title.
    pub title: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Item type, `WORKSPACE` for workspaces.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// One choice of a list-typed parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOption {
    /// Label shown to the user.
    pub caption: Option<String>,
    /// Submitted value.
    pub value: Value,
}

/// Published parameter of a workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceParameter {
    /// Parameter name.
    pub name: String,
    /// FME parameter type, e.g. `FILENAME_MUSTEXIST` or `GEOMETRY`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Prompt.
    pub description: Option<String>,
    /// Default value.
    pub default_value: Option<Value>,
    /// The parameter may be left empty.
    pub optional: bool,
    /// Choices of list-typed parameters.
    pub list_options: Vec<ListOption>,
}

/// Workspace item with its published parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceItem {
    /// File name.
    pub name: String,
    /// Display title.
    pub title: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Published parameters.
    pub parameters: Vec<WorkspaceParameter>,
}

/// File stored in the temporary shared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// Path to bind to the upload parameter, e.g. `$(FME_SHAREDRESOURCE_TEMP)/x/data.zip`.
    pub path: String,
}

/// Result of the health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    /// The server reported `ok`.
    pub healthy: bool,
    /// Reported status.
    pub status: Option<String>,
}

/// Job to run through the data download service.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    /// Repository name.
    pub repository: String,
    /// Workspace file name.
    pub workspace: String,
    /// Published parameters and directives.
    pub parameters: Map<String, Value>,
    /// Synchronous or asynchronous execution.
    pub mode: ServiceMode,
}

/// Remote job-processing API. Every call stops when `signal` fires.
#[async_trait(?Send)]
pub trait FmeApi {
    /// Base URL of the server.
    fn server_url(&self) -> &str;

    /// Lists repositories.
    async fn repositories(&self, signal: &AbortSignal) -> Result<Vec<Repository>, QueryError>;

    /// Lists the workspaces of `repository`.
    async fn workspace_items(
        &self,
        repository: &str,
        signal: &AbortSignal,
    ) -> Result<Vec<RepositoryItem>, QueryError>;

    /// Looks up a workspace.
    async fn workspace_item(
        &self,
        repository: &str,
        workspace: &str,
        signal: &AbortSignal,
    ) -> Result<RepositoryItem, QueryError>;

    /// Published parameters of a workspace.
    async fn workspace_parameters(
        &self,
        repository: &str,
        workspace: &str,
        signal: &AbortSignal,
    ) -> Result<Vec<WorkspaceParameter>, QueryError>;

    /// Connection and token check.
    async fn health_check(&self, signal: &AbortSignal) -> Result<HealthStatus, QueryError>;

    /// Uploads `file` to `folder` in the temporary shared resource.
    async fn upload_temp_file(
        &self,
        file: &UploadFile,
        folder: &str,
        signal: &AbortSignal,
    ) -> Result<FileUpload, QueryError>;

    /// Runs a job. Synchronous and asynchronous jobs share this entry point.
    async fn submit_job(&self, job: &JobSubmission, signal: &AbortSignal) -> Result<ApiResponse, QueryError>;

    /// URL of the data download webhook carrying `parameters` in its query string.
    fn webhook_url(
        &self,
        repository: &str,
        workspace: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Url, QueryError>;
}

/// [`FmeApi`] over a [`RequestTransport`].
#[derive(Debug, Clone)]
pub struct FmeFlowClient<T> {
    settings: ServerSettings,
    transport: T,
}

impl<T> FmeFlowClient<T>
where
    T: RequestTransport,
{
    /// Client for the server described by `settings`.
    pub fn new(settings: ServerSettings, transport: T) -> Self {
        Self { settings, transport }
    }

    /// Connection settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, QueryError> {
        let mut url = Url::parse(&self.settings.server_url)
            .map_err(|err| QueryError::Other(format!("{}: {err}", self.settings.server_url)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| QueryError::Other(format!("{} cannot be a base URL", self.settings.server_url)))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn rest_endpoint(&self, segments: &[&str]) -> Result<Url, QueryError> {
        let segments: Vec<&str> = REST_ROOT.iter().chain(segments).copied().collect();
        self.endpoint(&segments)
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("Authorization", format!("fmetoken token={}", self.settings.token))
            .header("Accept", "application/json")
    }

    async fn send(&self, request: HttpRequest, signal: &AbortSignal) -> Result<HttpResponse, QueryError> {
        let response = self.transport.send(self.authorize(request), signal).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(status_error(&response))
        }
    }

    async fn get_json<R>(&self, segments: &[&str], signal: &AbortSignal) -> Result<R, QueryError>
    where
        R: DeserializeOwned,
    {
        let response = self
            .send(HttpRequest::get(self.rest_endpoint(segments)?), signal)
            .await?;
        Ok(serde_json::from_slice(&response.body)?)
    }
}

/// Non-2xx response as a [`QueryError::Http`], preferring the server's message.
fn status_error(response: &HttpResponse) -> QueryError {
    let message = response
        .json()
        .ok()
        .and_then(|body| {
            ["message", "error", "detail"]
                .iter()
                .find_map(|field| body.get(*field).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| {
            let text = response.text();
            let text = text.trim();
            if text.is_empty() || text.len() > 512 {
                format!("request failed with status {}", response.status)
            } else {
                text.to_string()
            }
        });
    QueryError::Http {
        status: response.status,
        message,
    }
}

/// Listing envelope of the REST API.
#[derive(Deserialize)]
struct Items<I> {
    #[serde(default = "Vec::new")]
    items: Vec<I>,
}

/// Value of a parameter as it appears in a query string or form.
pub(crate) fn parameter_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(values) => {
            let parts: Vec<String> = values.iter().filter_map(parameter_text).collect();
            Some(parts.join(" "))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

fn form_pairs(parameters: &Map<String, Value>) -> Vec<(String, String)> {
    parameters
        .iter()
        .filter_map(|(name, value)| parameter_text(value).map(|text| (name.clone(), text)))
        .collect()
}

#[async_trait(?Send)]
impl<T> FmeApi for FmeFlowClient<T>
where
    T: RequestTransport,
{
    fn server_url(&self) -> &str {
        &self.settings.server_url
    }

    async fn repositories(&self, signal: &AbortSignal) -> Result<Vec<Repository>, QueryError> {
        let listing: Items<Repository> = self.get_json(&["repositories"], signal).await?;
        Ok(listing.items)
    }

    async fn workspace_items(
        &self,
        repository: &str,
        signal: &AbortSignal,
    ) -> Result<Vec<RepositoryItem>, QueryError> {
        let mut url = self.rest_endpoint(&["repositories", repository, "items"])?;
        url.query_pairs_mut().append_pair("type", "WORKSPACE");
        let response = self.send(HttpRequest::get(url), signal).await?;
        let listing: Items<RepositoryItem> = serde_json::from_slice(&response.body)?;
        Ok(listing.items)
    }

    async fn workspace_item(
        &self,
        repository: &str,
        workspace: &str,
        signal: &AbortSignal,
    ) -> Result<RepositoryItem, QueryError> {
        self.get_json(&["repositories", repository, "items", workspace], signal)
            .await
    }

    async fn workspace_parameters(
        &self,
        repository: &str,
        workspace: &str,
        signal: &AbortSignal,
    ) -> Result<Vec<WorkspaceParameter>, QueryError> {
        self.get_json(
            &["repositories", repository, "items", workspace, "parameters"],
            signal,
        )
        .await
    }

    async fn health_check(&self, signal: &AbortSignal) -> Result<HealthStatus, QueryError> {
        let body: Value = self.get_json(&["healthcheck"], signal).await?;
        let status = body.get("status").and_then(Value::as_str).map(str::to_string);
        Ok(HealthStatus {
            healthy: status
                .as_deref()
                .map(|status| status.eq_ignore_ascii_case("ok"))
                .unwrap_or(false),
            status,
        })
    }

    async fn upload_temp_file(
        &self,
        file: &UploadFile,
        folder: &str,
        signal: &AbortSignal,
    ) -> Result<FileUpload, QueryError> {
        let mut url = self.rest_endpoint(&[
            "resources",
            "connections",
            TEMP_RESOURCE,
            "filesys",
            folder,
        ])?;
        url.query_pairs_mut()
            .append_pair("createDirectories", "true")
            .append_pair("overwrite", "true");

        let request = HttpRequest::post(
            url,
            RequestBody::Bytes {
                data: file.data.clone(),
                content_type: file
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            },
        )
        .header(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", file.name.replace('"', "")),
        );
        let response = self.send(request, signal).await?;

        // The listing of the created file carries its path relative to the resource.
        let reported = response
            .json()
            .ok()
            .and_then(|body| body.get("path").and_then(Value::as_str).map(str::to_string));
        let relative = match reported {
            Some(path) if !path.trim_matches('/').is_empty() => path.trim_matches('/').to_string(),
            _ => format!("{}/{}", folder.trim_matches('/'), file.name),
        };
        Ok(FileUpload {
            path: format!("$({TEMP_RESOURCE})/{relative}"),
        })
    }

    async fn submit_job(&self, job: &JobSubmission, signal: &AbortSignal) -> Result<ApiResponse, QueryError> {
        let mut parameters = job.parameters.clone();
        parameters.insert(
            "opt_servicemode".to_string(),
            Value::String(job.mode.as_str().to_string()),
        );

        // Synchronous results are streamed from the webhook URL, queued jobs are posted.
        let request = match job.mode {
            ServiceMode::Sync => HttpRequest::get(self.webhook_url(&job.repository, &job.workspace, &parameters)?),
            ServiceMode::Async => HttpRequest::post(
                self.endpoint(&[DATA_DOWNLOAD_SERVICE, &job.repository, &job.workspace])?,
                RequestBody::Form(form_pairs(&parameters)),
            ),
        };
        let response = self.send(request, signal).await?;

        if response.is_json() {
            Ok(ApiResponse::Json(response.json()?))
        } else {
            Ok(ApiResponse::Blob {
                data: response.body,
                content_type: response.content_type,
            })
        }
    }

    fn webhook_url(
        &self,
        repository: &str,
        workspace: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Url, QueryError> {
        let mut url = self.endpoint(&[DATA_DOWNLOAD_SERVICE, repository, workspace])?;
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in form_pairs(parameters) {
                query.append_pair(&name, &value);
            }
        }
        Ok(url)
    }
}
