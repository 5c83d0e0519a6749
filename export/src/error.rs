use fme_query::QueryError;

use crate::{ConfigError, GeometryError, RemoteUrlError};

/// Category of an [`ExportError`], used to pick the guidance shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad geometry, area exceeded or rejected input.
    Validation,
    /// Transport, timeout or DNS-class failure.
    Network,
    /// 401/403 equivalents.
    Auth,
    /// Missing or invalid server settings.
    Configuration,
    /// The server rejected or failed the request.
    Server,
    /// Not a real error. Filtered before display.
    Cancellation,
}

impl ErrorKind {
    /// Lowercase name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Server => "server",
            ErrorKind::Cancellation => "cancellation",
        }
    }
}

/// Failure of any export operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExportError {
    /// The drawn geometry was rejected.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// The drawn area is larger than the configured maximum.
    #[error("area {area} exceeds the maximum of {max_area}")]
    AreaExceeded {
        /// Drawn area.
        area: f64,
        /// Configured maximum.
        max_area: f64,
    },
    /// Server settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A remote dataset URL failed the allowlist check.
    #[error(transparent)]
    RemoteUrl(#[from] RemoteUrlError),
    /// A parameter the job cannot run without is missing.
    #[error("missing required parameter {0}")]
    MissingParameter(String),
    /// A request to the remote service failed.
    #[error(transparent)]
    Request(#[from] QueryError),
}

impl ExportError {
    /// Category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Geometry(_)
            | ExportError::AreaExceeded { .. }
            | ExportError::RemoteUrl(_)
            | ExportError::MissingParameter(_) => ErrorKind::Validation,
            ExportError::Config(_) => ErrorKind::Configuration,
            ExportError::Request(error) => request_kind(error),
        }
    }

    /// Returns true if the error is a cancellation, which must never be shown as a failure.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
    }
}

fn request_kind(error: &QueryError) -> ErrorKind {
    if error.is_cancelled() {
        return ErrorKind::Cancellation;
    }
    if error.is_auth() {
        return ErrorKind::Auth;
    }
    match error {
        QueryError::Network(_) | QueryError::Timeout(_) => ErrorKind::Network,
        QueryError::Other(message) => match QueryError::classify(message) {
            QueryError::Network(_) => ErrorKind::Network,
            _ => ErrorKind::Server,
        },
        _ => ErrorKind::Server,
    }
}

/// Orchestrator step a [`SubmissionError`] happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionStep {
    /// Merging form values with service parameters and resolving the service mode.
    Normalizing,
    /// Binding a remote URL or uploading an attached file.
    ResolvingDataset,
    /// Filling job directives from configuration.
    ApplyingDefaults,
    /// Submitting the job and interpreting the response.
    Complete,
}

impl SubmissionStep {
    /// camelCase name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStep::Normalizing => "normalizing",
            SubmissionStep::ResolvingDataset => "resolvingDataset",
            SubmissionStep::ApplyingDefaults => "applyingDefaults",
            SubmissionStep::Complete => "complete",
        }
    }
}

impl std::fmt::Display for SubmissionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single tagged error returned by the submission pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("submission failed while {step}: {source}")]
pub struct SubmissionError {
    /// Step that failed. Later steps never ran.
    pub step: SubmissionStep,
    /// Underlying failure.
    #[source]
    pub source: ExportError,
}

impl SubmissionError {
    /// Tags `source` with `step`.
    pub fn new(step: SubmissionStep, source: impl Into<ExportError>) -> Self {
        Self {
            step,
            source: source.into(),
        }
    }

    /// Category of the underlying failure.
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
