use leptos::logging;

/// How FME Flow runs a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceMode {
    /// The result is streamed back in the response.
    Sync,
    /// The job is queued and the requester is notified when it finishes.
    Async,
}

impl ServiceMode {
    /// Value of the `opt_servicemode` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceMode::Sync => "sync",
            ServiceMode::Async => "async",
        }
    }
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why asynchronous mode was forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideReason {
    /// The drawn area is above the warning threshold.
    Area,
    /// The serialized request would not fit in a URL.
    UrlLength,
}

impl OverrideReason {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideReason::Area => "area",
            OverrideReason::UrlLength => "url_length",
        }
    }
}

/// Describes a forced asynchronous decision, for the user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceModeOverrideInfo {
    /// Rule that matched.
    pub reason: OverrideReason,
    /// Drawn area for [`OverrideReason::Area`].
    pub value: Option<f64>,
    /// Threshold that was crossed.
    pub threshold: Option<f64>,
    /// Computed request URL length for [`OverrideReason::UrlLength`].
    pub url_length: Option<usize>,
}

/// Everything the resolver looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServiceModeInput {
    /// Configured preference.
    pub sync_mode: bool,
    /// The area is above the warning threshold.
    pub area_warning: bool,
    /// Absolute drawn area.
    pub drawn_area: Option<f64>,
    /// Warning threshold.
    pub large_area: Option<f64>,
    /// Length of the serialized request URL, including the area of interest.
    pub url_length: Option<usize>,
    /// Maximum URL length accepted by the transport.
    pub max_url_length: Option<usize>,
    /// The workspace cannot run asynchronously.
    pub workspace_forbids_async: bool,
}

/// Outcome of [`resolve_service_mode`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceModeDecision {
    /// Mode to submit with.
    pub mode: ServiceMode,
    /// Set when a rule overrode the configured preference.
    pub forced: Option<ServiceModeOverrideInfo>,
}

/// Decides the service mode. The first matching rule wins:
/// 1. the URL is too long,
/// 2. the area warning is raised and the workspace allows async,
/// 3. otherwise the configured preference.
pub fn resolve_service_mode(input: &ServiceModeInput) -> ServiceModeDecision {
    if let (Some(url_length), Some(max_url_length)) = (input.url_length, input.max_url_length) {
        if url_length > max_url_length {
            return ServiceModeDecision {
                mode: ServiceMode::Async,
                forced: Some(ServiceModeOverrideInfo {
                    reason: OverrideReason::UrlLength,
                    value: None,
                    threshold: Some(max_url_length as f64),
                    url_length: Some(url_length),
                }),
            };
        }
    }

    if input.area_warning && !input.workspace_forbids_async {
        return ServiceModeDecision {
            mode: ServiceMode::Async,
            forced: Some(ServiceModeOverrideInfo {
                reason: OverrideReason::Area,
                value: input.drawn_area,
                threshold: input.large_area,
                url_length: None,
            }),
        };
    }

    ServiceModeDecision {
        mode: if input.sync_mode {
            ServiceMode::Sync
        } else {
            ServiceMode::Async
        },
        forced: None,
    }
}

/// [`resolve_service_mode`], reporting a forced decision once through `on_override`.
pub fn resolve_service_mode_with(
    input: &ServiceModeInput,
    on_override: impl FnOnce(&ServiceModeOverrideInfo),
) -> ServiceModeDecision {
    let decision = resolve_service_mode(input);
    if let Some(info) = &decision.forced {
        logging::log!("Service mode forced to async ({})", info.reason.as_str());
        on_override(info);
    }
    decision
}
