#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About FME Export
//!
//! The submission side of an FME Flow export widget: everything between "the user drew an area"
//! and "the job was accepted", without any rendering.
//!
//! - [`GeometryEvaluator`] validates and measures the drawn area of interest.
//! - [`resolve_service_mode`] decides between synchronous and asynchronous execution.
//! - [`resolve_dataset_source`] binds a remote dataset URL or an uploaded file.
//! - [`SubmissionOrchestrator`] runs the whole pipeline and normalizes the answer into an
//!   [`ExportResult`].
//! - [`DrawingSession`], [`SubmissionPhase`] and [`DrawingSurface`] track the UI state around it.
//!
//! Server metadata (repositories, workspaces, health) is read through the query cache of
//! [`fme_query`], see [`fetch_repositories`] and [`use_workspace_metadata`].
//!
//! ```rust
//! use fme_export::*;
//!
//! let config = ExportConfig::from_json(r#"{ "maxArea": 1000000, "largeArea": "250000" }"#).unwrap();
//! let evaluation = evaluate_area(300_000.0, config.area_thresholds());
//! assert!(evaluation.should_warn);
//! assert!(!evaluation.exceeds_maximum);
//! ```

mod api;
mod config;
mod dataset;
mod error;
mod geometry;
mod orchestrator;
mod queries;
mod service_mode;
mod session;
pub mod transport;

pub use api::*;
pub use config::*;
pub use dataset::*;
pub use error::*;
pub use geometry::*;
pub use orchestrator::*;
pub use queries::*;
pub use service_mode::*;
pub use session::*;
pub use transport::{ReqwestTransport, RequestTransport};
