//! The submission pipeline: from a drawn area and form values to a normalized [`ExportResult`].
//!
//! A submission runs four steps in order. A failing step stops the pipeline and is reported as a
//! [`SubmissionError`] tagged with the step, so a job is never submitted half prepared.
//! Aborting the submission is an outcome of its own, [`SubmissionOutcome::Cancelled`].

use std::{
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use fme_query::{AbortSignal, CancelableSlot, Instant, QueryError};
use leptos::logging;
use serde_json::{Map, Value};

use crate::{
    config::{clamp_tag, positive_integer},
    dataset::{resolve_dataset_source, DatasetSource, UploadFile, REMOTE_URL_PARAMETER},
    resolve_service_mode, resolve_service_mode_with, ApiResponse, DirectiveDefaults, DrawingEvaluation, ExportConfig, ExportError,
    FmeApi, JobSubmission, ServiceMode, ServiceModeInput, ServiceModeOverrideInfo, SubmissionError,
    SubmissionPhase, SubmissionStep, WorkspaceParameter,
};

/// How long a streamed result stays downloadable before it is released.
pub const BLOB_REVOKE_DELAY: Duration = Duration::from_secs(60);

const GENERIC_FAILURE: &str = "The export could not be completed.";
const FAILURE_CODE: &str = "EXPORT_FAILED";

/// Streamed result of a synchronous job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBlob {
    /// Payload.
    pub data: Vec<u8>,
    /// MIME type, if declared.
    pub content_type: Option<String>,
    /// Delay after which the download handle must be released.
    pub revoke_after: Duration,
}

/// Terminal value of a submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportResult {
    /// The job was accepted or completed.
    pub success: bool,
    /// Server job id, or a local id when the server reported none.
    pub job_id: Option<String>,
    /// Download location reported by the server.
    pub download_url: Option<String>,
    /// Streamed result.
    pub blob: Option<ResultBlob>,
    /// Mode the job was submitted with.
    pub service_mode: Option<ServiceMode>,
    /// Message for the user.
    pub message: Option<String>,
    /// Failure code.
    pub code: Option<String>,
}

/// How a submission ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// The server answered. The result may still report a failed job.
    Completed(ExportResult),
    /// The submission was aborted.
    Cancelled,
}

/// Everything a submission needs besides configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    /// Repository holding the workspace.
    pub repository: String,
    /// Workspace file name.
    pub workspace: String,
    /// Published parameters of the workspace.
    pub workspace_parameters: Vec<WorkspaceParameter>,
    /// The workspace cannot run asynchronously.
    pub workspace_forbids_async: bool,
    /// Values entered in the export form.
    pub form_values: Map<String, Value>,
    /// Address notified about asynchronous jobs.
    pub requester_email: Option<String>,
    /// The validated drawing.
    pub drawing: DrawingEvaluation,
    /// Remote dataset URL entered by the user.
    pub remote_dataset_url: Option<String>,
    /// File attached by the user.
    pub upload: Option<UploadFile>,
}

/// Runs submissions one at a time. A new submission aborts the one in progress.
pub struct SubmissionOrchestrator<A> {
    api: Rc<A>,
    config: ExportConfig,
    slot: CancelableSlot,
}

impl<A> SubmissionOrchestrator<A>
where
    A: FmeApi,
{
    /// Orchestrator submitting through `api`.
    pub fn new(api: Rc<A>, config: ExportConfig) -> Self {
        Self {
            api,
            config,
            slot: CancelableSlot::new(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Aborts the submission in progress. Returns false if there was none.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    /// Returns true while a submission is in progress.
    pub fn is_submitting(&self) -> bool {
        self.slot.is_active()
    }

    /// Runs the pipeline.
    ///
    /// `on_status` sees the phases in order and always ends with [`SubmissionPhase::Idle`].
    /// `on_override` is called once if the service mode was forced.
    pub async fn submit(
        &self,
        request: SubmissionRequest,
        on_status: impl Fn(SubmissionPhase),
        on_override: impl FnOnce(&ServiceModeOverrideInfo),
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let signal = self.slot.acquire();
        let _guard = SubmissionGuard {
            slot: &self.slot,
            signal: signal.clone(),
            on_status: &on_status,
        };
        on_status(SubmissionPhase::Preparing);

        match self.run(request, &signal, &on_status, on_override).await {
            Err(err) if err.source.is_cancelled() || signal.is_aborted() => {
                logging::debug_warn!("Submission cancelled while {}.", err.step);
                Ok(SubmissionOutcome::Cancelled)
            }
            Err(err) => Err(err),
            Ok(_) if signal.is_aborted() => Ok(SubmissionOutcome::Cancelled),
            Ok(result) => Ok(SubmissionOutcome::Completed(result)),
        }
    }

    async fn run(
        &self,
        request: SubmissionRequest,
        signal: &AbortSignal,
        on_status: &impl Fn(SubmissionPhase),
        on_override: impl FnOnce(&ServiceModeOverrideInfo),
    ) -> Result<ExportResult, SubmissionError> {
        let SubmissionRequest {
            repository,
            workspace,
            workspace_parameters,
            workspace_forbids_async,
            form_values,
            requester_email,
            drawing,
            remote_dataset_url,
            upload,
        } = request;

        // Normalizing
        let step = SubmissionStep::Normalizing;
        ensure_active(signal, step)?;
        if let Some(max_area) = self.config.max_area {
            if drawing.evaluation.exceeds_maximum || drawing.area > max_area {
                return Err(SubmissionError::new(
                    step,
                    ExportError::AreaExceeded {
                        area: drawing.area,
                        max_area,
                    },
                ));
            }
        }

        let mut parameters = form_values;
        parameters.insert(
            self.config.aoi_param_name().to_string(),
            Value::String(drawing.polygon.to_json().to_string()),
        );
        parameters.insert("opt_responseformat".into(), Value::String("json".into()));
        parameters.insert("opt_showresult".into(), Value::String("true".into()));
        if let Some(email) = requester_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
        {
            parameters.insert("opt_requesteremail".into(), Value::String(email.to_string()));
        }

        // An asynchronous job needs someone to notify. Checked up front so nothing is uploaded
        // for a submission that cannot go out.
        let preliminary = resolve_service_mode(&self.mode_input(
            &drawing,
            self.sync_url_length(&repository, &workspace, &parameters)
                .map_err(|err| SubmissionError::new(step, err))?,
            workspace_forbids_async,
        ));
        ensure_notifiable(&parameters, preliminary.mode, step)?;

        // Resolving dataset
        let step = SubmissionStep::ResolvingDataset;
        ensure_active(signal, step)?;
        let source = resolve_dataset_source(
            remote_dataset_url.as_deref(),
            upload,
            &self.config,
            &workspace_parameters,
        )
        .map_err(|err| SubmissionError::new(step, err))?;
        match source {
            DatasetSource::Default => {}
            DatasetSource::RemoteUrl(url) => {
                parameters.insert(REMOTE_URL_PARAMETER.into(), Value::String(url.into()));
            }
            DatasetSource::Upload { file, parameter } => {
                on_status(SubmissionPhase::Uploading);
                let uploaded = self
                    .api
                    .upload_temp_file(&file, &local_id("upload"), signal)
                    .await
                    .map_err(|err| SubmissionError::new(step, err))?;
                parameters.insert(parameter, Value::String(uploaded.path));
            }
        }

        // Applying defaults
        let step = SubmissionStep::ApplyingDefaults;
        ensure_active(signal, step)?;
        on_status(SubmissionPhase::Finalizing);
        apply_directive_defaults(&mut parameters, &self.config.directive_defaults());

        // Complete
        let step = SubmissionStep::Complete;
        ensure_active(signal, step)?;
        // The dataset and directives lengthen the webhook URL, so the mode is settled only now.
        let url_length = self
            .sync_url_length(&repository, &workspace, &parameters)
            .map_err(|err| SubmissionError::new(step, err))?;
        let decision = resolve_service_mode_with(
            &self.mode_input(&drawing, url_length, workspace_forbids_async),
            on_override,
        );
        let mode = decision.mode;
        ensure_notifiable(&parameters, mode, step)?;
        on_status(SubmissionPhase::Submitting);
        let job = JobSubmission {
            repository,
            workspace,
            parameters,
            mode,
        };
        let response = self
            .api
            .submit_job(&job, signal)
            .await
            .map_err(|err| SubmissionError::new(step, err))?;
        Ok(interpret_response(response, mode))
    }
}

impl<A> SubmissionOrchestrator<A>
where
    A: FmeApi,
{
    /// Length of the webhook URL a synchronous submission of `parameters` would request.
    fn sync_url_length(
        &self,
        repository: &str,
        workspace: &str,
        parameters: &Map<String, Value>,
    ) -> Result<usize, ExportError> {
        let mut parameters = parameters.clone();
        parameters.insert(
            "opt_servicemode".into(),
            Value::String(ServiceMode::Sync.as_str().into()),
        );
        Ok(self
            .api
            .webhook_url(repository, workspace, &parameters)?
            .as_str()
            .len())
    }

    fn mode_input(
        &self,
        drawing: &DrawingEvaluation,
        url_length: usize,
        workspace_forbids_async: bool,
    ) -> ServiceModeInput {
        ServiceModeInput {
            sync_mode: self.config.sync_mode,
            area_warning: drawing.evaluation.should_warn,
            drawn_area: Some(drawing.area),
            large_area: self.config.large_area,
            url_length: Some(url_length),
            max_url_length: Some(self.config.max_url_length()),
            workspace_forbids_async,
        }
    }
}

fn ensure_notifiable(
    parameters: &Map<String, Value>,
    mode: ServiceMode,
    step: SubmissionStep,
) -> Result<(), SubmissionError> {
    if mode == ServiceMode::Async && !parameters.contains_key("opt_requesteremail") {
        Err(SubmissionError::new(
            step,
            ExportError::MissingParameter("opt_requesteremail".into()),
        ))
    } else {
        Ok(())
    }
}

/// Releases the slot and reports [`SubmissionPhase::Idle`] on every exit path.
struct SubmissionGuard<'a, F>
where
    F: Fn(SubmissionPhase),
{
    slot: &'a CancelableSlot,
    signal: AbortSignal,
    on_status: &'a F,
}

impl<F> Drop for SubmissionGuard<'_, F>
where
    F: Fn(SubmissionPhase),
{
    fn drop(&mut self) {
        self.slot.release(&self.signal);
        (self.on_status)(SubmissionPhase::Idle);
    }
}

fn ensure_active(signal: &AbortSignal, step: SubmissionStep) -> Result<(), SubmissionError> {
    if signal.is_aborted() {
        Err(SubmissionError::new(step, QueryError::Cancelled))
    } else {
        Ok(())
    }
}

/// Fills the job directives `tm_ttc`, `tm_ttl` and `tm_tag` from `defaults` where the form left
/// them unset. Values already present are sanitized the same way: numbers must be positive
/// integers, tags are trimmed and capped.
pub fn apply_directive_defaults(parameters: &mut Map<String, Value>, defaults: &DirectiveDefaults) {
    for (name, default) in [("tm_ttc", defaults.tm_ttc), ("tm_ttl", defaults.tm_ttl)] {
        let value = match parameters.remove(name) {
            Some(Value::Null) | None => default,
            Some(value) => positive_integer(&value),
        };
        if let Some(value) = value {
            parameters.insert(name.to_string(), Value::from(value));
        }
    }

    let tag = match parameters.remove("tm_tag") {
        Some(Value::Null) | None => defaults.tm_tag.clone(),
        Some(Value::String(tag)) => clamp_tag(&tag),
        Some(other) => clamp_tag(&other.to_string()),
    };
    if let Some(tag) = tag {
        parameters.insert("tm_tag".to_string(), Value::String(tag));
    }
}

/// Normalizes the answer of a job submission.
pub fn interpret_response(response: ApiResponse, mode: ServiceMode) -> ExportResult {
    match response {
        ApiResponse::Blob { data, content_type } => ExportResult {
            success: true,
            blob: Some(ResultBlob {
                data,
                content_type,
                revoke_after: BLOB_REVOKE_DELAY,
            }),
            service_mode: Some(mode),
            ..Default::default()
        },
        ApiResponse::Json(body) => interpret_envelope(&body, mode),
    }
}

fn interpret_envelope(body: &Value, mode: ServiceMode) -> ExportResult {
    let envelope = body.get("serviceResponse").unwrap_or(body);
    let status_info = envelope.get("statusInfo");
    let field = |name: &str| {
        status_info
            .and_then(|info| info.get(name))
            .or_else(|| envelope.get(name))
    };

    let status = field("status").and_then(Value::as_str);
    let message = field("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string);

    if status.map_or(false, |status| status.eq_ignore_ascii_case("success")) {
        let job_id = ["jobID", "id"]
            .iter()
            .find_map(|name| envelope.get(*name).and_then(id_text))
            .unwrap_or_else(|| local_id("job"));
        return ExportResult {
            success: true,
            job_id: Some(job_id),
            download_url: envelope.get("url").and_then(Value::as_str).map(str::to_string),
            service_mode: Some(mode),
            message,
            ..Default::default()
        };
    }

    ExportResult {
        success: false,
        service_mode: Some(mode),
        message: Some(message.unwrap_or_else(|| GENERIC_FAILURE.to_string())),
        code: Some(
            field("code")
                .and_then(id_text)
                .unwrap_or_else(|| FAILURE_CODE.to_string()),
        ),
        ..Default::default()
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

/// Locally unique id for uploads and jobs without a server id.
fn local_id(prefix: &str) -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Instant::now().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transport::{testing::FakeTransport, Method, RequestBody},
        AreaEvaluation, FmeFlowClient, OverrideReason, Polygon, ServerSettings,
    };
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    fn orchestrator(config: ExportConfig) -> (SubmissionOrchestrator<FmeFlowClient<FakeTransport>>, FakeTransport) {
        let transport = FakeTransport::default();
        let settings = ServerSettings {
            server_url: "https://flow.example.com".into(),
            token: "secret".into(),
            repository: "Exports".into(),
        };
        let api = Rc::new(FmeFlowClient::new(settings, transport.clone()));
        (SubmissionOrchestrator::new(api, config), transport)
    }

    fn drawing(area: f64, evaluation: AreaEvaluation) -> DrawingEvaluation {
        let polygon = Polygon::from_json(&json!({
            "rings": [[[0, 0], [0, 10], [10, 10], [10, 0], [0, 0]]],
            "spatialReference": { "wkid": 2056 }
        }))
        .expect("polygon");
        DrawingEvaluation {
            polygon,
            area,
            evaluation,
        }
    }

    fn request() -> SubmissionRequest {
        let mut form_values = Map::new();
        form_values.insert("Format".into(), json!("SHAPE"));
        SubmissionRequest {
            repository: "Exports".into(),
            workspace: "clip.fmw".into(),
            workspace_parameters: Vec::new(),
            workspace_forbids_async: false,
            form_values,
            requester_email: Some("analyst@example.com".into()),
            drawing: drawing(100.0, AreaEvaluation::default()),
            remote_dataset_url: None,
            upload: None,
        }
    }

    fn form_value(body: &RequestBody, name: &str) -> Option<String> {
        match body {
            RequestBody::Form(pairs) => pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn async_submission_reports_job_id() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());
        transport.push_json(
            200,
            json!({ "serviceResponse": { "statusInfo": { "status": "success", "mode": "async" }, "jobID": 42 } }),
        );
        let phases = RefCell::new(Vec::new());

        let outcome = orchestrator
            .submit(request(), |phase| phases.borrow_mut().push(phase), |_| {})
            .await
            .expect("submission");

        let SubmissionOutcome::Completed(result) = outcome else {
            panic!("expected a result")
        };
        assert!(result.success);
        assert_eq!(result.job_id.as_deref(), Some("42"));
        assert_eq!(result.service_mode, Some(ServiceMode::Async));
        assert_eq!(
            *phases.borrow(),
            vec![
                SubmissionPhase::Preparing,
                SubmissionPhase::Finalizing,
                SubmissionPhase::Submitting,
                SubmissionPhase::Idle
            ]
        );

        let job = transport.request(0);
        assert_eq!(job.method, Method::Post);
        assert_eq!(form_value(&job.body, "opt_servicemode").as_deref(), Some("async"));
        assert_eq!(form_value(&job.body, "opt_requesteremail").as_deref(), Some("analyst@example.com"));
        assert_eq!(form_value(&job.body, "Format").as_deref(), Some("SHAPE"));
        let aoi = form_value(&job.body, "AreaOfInterest").expect("aoi");
        assert_eq!(serde_json::from_str::<Value>(&aoi).expect("json")["spatialReference"]["wkid"], 2056);
        assert!(!orchestrator.is_submitting());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_an_outcome() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());
        let phases = RefCell::new(Vec::new());

        let (outcome, cancelled) = futures::join!(
            orchestrator.submit(request(), |phase| phases.borrow_mut().push(phase), |_| {}),
            async {
                fme_query::sleep(Duration::from_millis(10)).await;
                orchestrator.cancel()
            }
        );

        assert!(cancelled);
        assert_eq!(outcome, Ok(SubmissionOutcome::Cancelled));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(phases.borrow().last(), Some(&SubmissionPhase::Idle));
        assert!(!orchestrator.is_submitting());
    }

    #[tokio::test(start_paused = true)]
    async fn new_submission_aborts_previous() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());

        let (first, second) = futures::join!(
            orchestrator.submit(request(), |_| {}, |_| {}),
            async {
                fme_query::sleep(Duration::from_millis(10)).await;
                transport.push_json(200, json!({ "serviceResponse": { "statusInfo": { "status": "success" }, "id": "abc" } }));
                orchestrator.submit(request(), |_| {}, |_| {}).await
            }
        );

        assert_eq!(first, Ok(SubmissionOutcome::Cancelled));
        let Ok(SubmissionOutcome::Completed(result)) = second else {
            panic!("expected a result")
        };
        assert_eq!(result.job_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn area_above_maximum_is_blocked() {
        let config = ExportConfig {
            max_area: Some(50.0),
            ..ExportConfig::default()
        };
        let (orchestrator, transport) = orchestrator(config);

        let error = orchestrator.submit(request(), |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(error.step, SubmissionStep::Normalizing);
        assert_eq!(
            error.source,
            ExportError::AreaExceeded {
                area: 100.0,
                max_area: 50.0
            }
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn long_requests_are_forced_async() {
        let config = ExportConfig {
            sync_mode: true,
            max_url_length: Some(64),
            ..ExportConfig::default()
        };
        let (orchestrator, transport) = orchestrator(config);
        transport.push_json(200, json!({ "serviceResponse": { "statusInfo": { "status": "success" }, "jobID": 1 } }));
        let overrides = Cell::new(0);

        let outcome = orchestrator
            .submit(
                request(),
                |_| {},
                |info| {
                    assert_eq!(info.reason, OverrideReason::UrlLength);
                    assert!(info.url_length.unwrap_or_default() > 64);
                    overrides.set(overrides.get() + 1);
                },
            )
            .await
            .expect("submission");

        assert_eq!(overrides.get(), 1);
        assert!(matches!(outcome, SubmissionOutcome::Completed(ExportResult { success: true, .. })));
        assert_eq!(transport.request(0).method, Method::Post);
    }

    #[tokio::test]
    async fn remote_dataset_counts_toward_url_length() {
        let config = ExportConfig {
            sync_mode: true,
            allow_remote_url_dataset: true,
            max_url_length: Some(500),
            ..ExportConfig::default()
        };

        // Without the dataset the webhook URL fits.
        let (short, short_transport) = orchestrator(config.clone());
        short_transport.push_blob(b"PK\x03\x04", "application/zip");
        short.submit(request(), |_| {}, |_| {}).await.expect("submission");
        let job = short_transport.request(0);
        assert_eq!(job.method, Method::Get);
        assert!(job.url.as_str().len() <= 500);

        let (orchestrator, transport) = orchestrator(config);
        transport.push_json(200, json!({ "serviceResponse": { "statusInfo": { "status": "success" }, "jobID": 3 } }));
        let mut request = request();
        request.remote_dataset_url = Some(format!("https://data.example.com/{}.zip", "a".repeat(300)));
        let reported = RefCell::new(Vec::new());

        orchestrator
            .submit(request, |_| {}, |info| reported.borrow_mut().push(info.clone()))
            .await
            .expect("submission");

        let reported = reported.borrow();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].reason, OverrideReason::UrlLength);
        assert!(reported[0].url_length.unwrap_or_default() > 500);
        let job = transport.request(0);
        assert_eq!(job.method, Method::Post);
        assert!(form_value(&job.body, REMOTE_URL_PARAMETER).is_some());
        assert_eq!(form_value(&job.body, "opt_servicemode").as_deref(), Some("async"));
    }

    #[tokio::test]
    async fn network_failure_is_not_a_cancellation() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());
        transport.push(Err(QueryError::classify(
            "error sending request for url (https://flow.example.com/fmedatadownload/Cancellations/clip.fmw): dns error",
        )));
        let mut request = request();
        request.repository = "Cancellations".into();

        let error = orchestrator.submit(request, |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(error.step, SubmissionStep::Complete);
        assert_eq!(error.kind(), crate::ErrorKind::Network);
    }

    #[tokio::test]
    async fn sync_submission_streams_blob() {
        let config = ExportConfig {
            sync_mode: true,
            ..ExportConfig::default()
        };
        let (orchestrator, transport) = orchestrator(config);
        transport.push_blob(b"PK\x03\x04", "application/zip");
        let mut request = request();
        request.requester_email = None;

        let outcome = orchestrator.submit(request, |_| {}, |_| {}).await.expect("submission");
        let SubmissionOutcome::Completed(result) = outcome else {
            panic!("expected a result")
        };
        let blob = result.blob.expect("blob");
        assert_eq!(blob.data, b"PK\x03\x04".to_vec());
        assert_eq!(blob.revoke_after, BLOB_REVOKE_DELAY);
        assert_eq!(result.service_mode, Some(ServiceMode::Sync));
        assert_eq!(transport.request(0).method, Method::Get);
    }

    #[tokio::test]
    async fn async_submission_requires_email() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());
        let mut request = request();
        request.requester_email = Some("  ".into());

        let error = orchestrator.submit(request, |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(error.step, SubmissionStep::Normalizing);
        assert_eq!(error.source, ExportError::MissingParameter("opt_requesteremail".into()));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn attached_file_is_uploaded_and_bound() {
        let config = ExportConfig {
            allow_remote_dataset: true,
            ..ExportConfig::default()
        };
        let (orchestrator, transport) = orchestrator(config);
        transport.push_json(201, json!({ "path": "/upload-1/parcels.zip" }));
        transport.push_json(200, json!({ "serviceResponse": { "statusInfo": { "status": "success" }, "jobID": 9 } }));

        let mut request = request();
        request.workspace_parameters = vec![WorkspaceParameter {
            name: "InputData".into(),
            kind: "FILENAME_MUSTEXIST".into(),
            ..Default::default()
        }];
        request.upload = Some(UploadFile {
            name: "parcels.zip".into(),
            content_type: Some("application/zip".into()),
            data: vec![1, 2, 3],
        });
        let phases = RefCell::new(Vec::new());

        orchestrator
            .submit(request, |phase| phases.borrow_mut().push(phase), |_| {})
            .await
            .expect("submission");

        assert!(phases.borrow().contains(&SubmissionPhase::Uploading));
        let job = transport.request(1);
        assert_eq!(
            form_value(&job.body, "InputData").as_deref(),
            Some("$(FME_SHAREDRESOURCE_TEMP)/upload-1/parcels.zip")
        );
    }

    #[tokio::test]
    async fn rejected_remote_url_stops_before_submission() {
        let config = ExportConfig {
            allow_remote_url_dataset: true,
            ..ExportConfig::default()
        };
        let (orchestrator, transport) = orchestrator(config);
        let mut request = request();
        request.remote_dataset_url = Some("https://192.168.0.10/data.zip".into());

        let error = orchestrator.submit(request, |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(error.step, SubmissionStep::ResolvingDataset);
        assert_eq!(error.kind(), crate::ErrorKind::Validation);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn server_failure_is_tagged_with_step() {
        let (orchestrator, transport) = orchestrator(ExportConfig::default());
        transport.push_json(500, json!({ "message": "Engine unavailable" }));

        let error = orchestrator.submit(request(), |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(error.step, SubmissionStep::Complete);
        assert_eq!(error.kind(), crate::ErrorKind::Server);
        assert!(error.source.is_recoverable());
    }

    #[test]
    fn directive_defaults_fill_only_missing_values() {
        let mut parameters = Map::new();
        parameters.insert("tm_ttl".into(), json!("-5"));
        parameters.insert("tm_tag".into(), json!("  nightly  "));
        let defaults = DirectiveDefaults {
            tm_ttc: Some(300),
            tm_ttl: Some(600),
            tm_tag: Some("exports".into()),
        };

        apply_directive_defaults(&mut parameters, &defaults);

        assert_eq!(parameters.get("tm_ttc"), Some(&json!(300)));
        // An invalid explicit value is dropped rather than replaced.
        assert_eq!(parameters.get("tm_ttl"), None);
        assert_eq!(parameters.get("tm_tag"), Some(&json!("nightly")));

        let mut parameters = Map::new();
        parameters.insert("tm_ttc".into(), json!(45.9));
        apply_directive_defaults(&mut parameters, &DirectiveDefaults::default());
        assert_eq!(parameters.get("tm_ttc"), Some(&json!(45)));
        assert_eq!(parameters.len(), 1);
    }

    #[test]
    fn envelope_interpretation() {
        let result = interpret_response(
            ApiResponse::Json(json!({ "status": "SUCCESS", "jobID": 42 })),
            ServiceMode::Async,
        );
        assert!(result.success);
        assert_eq!(result.job_id.as_deref(), Some("42"));

        let result = interpret_response(
            ApiResponse::Json(json!({ "serviceResponse": { "statusInfo": { "status": "success" } } })),
            ServiceMode::Async,
        );
        assert!(result.job_id.expect("local id").starts_with("job-"));

        let result = interpret_response(
            ApiResponse::Json(json!({ "serviceResponse": { "statusInfo": { "status": "failure", "message": "Translation failed" } } })),
            ServiceMode::Async,
        );
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Translation failed"));

        let result = interpret_response(ApiResponse::Json(json!(["unexpected"])), ServiceMode::Sync);
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some(GENERIC_FAILURE));
        assert_eq!(result.code.as_deref(), Some(FAILURE_CODE));
    }
}
