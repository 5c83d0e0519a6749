#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About FME Query
//!
//! Asynchronous request state for FME Flow clients built with [Leptos](https://github.com/leptos-rs/leptos).
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! Every read from the remote service (repository listings, workspace metadata, health checks)
//! goes through a [`QueryCache`] keyed by [`QueryKey`], which provides:
//! - caching with stale times
//! - at most one request in flight per key
//! - retries with fixed or exponential delays
//! - subscriber notification
//! - invalidation
//! - eviction of unused entries
//! - cancellation, reference counted across subscribers and awaiting callers
//!
//! Writes go through [`Mutation`]s, which are never deduplicated.
//!
//! ## The main entry points are:
//! - [`QueryClient::fetch_query`] - Imperative, deduplicated fetch.
//! - [`use_fme_query`](crate::use_query::use_fme_query()) - A reactive view of one cache entry.
//! - [`use_fme_mutation`](crate::mutation::use_fme_mutation()) - A reactive, cancelable remote write.
//!
//! # A Simple Example
//!
//! In the root of your App, provide a query client with [provide_query_client] or [provide_query_client_with_options] if you want to override the default options.
//!
//! ```rust
//! use fme_query::*;
//! use leptos::*;
//!
//! #[component]
//! pub fn App() -> impl IntoView {
//!     // Provides Query Client for entire app.
//!     provide_query_client();
//!
//!     // Rest of App...
//! }
//! ```
//!
//! Then read through the cache anywhere below it.
//!
//! ```rust
//! use fme_query::*;
//!
//! async fn repository_names(client: &QueryClient) -> Result<Vec<String>, QueryError> {
//!     client
//!         .fetch_query(
//!             query_key!["fme", "repositories"],
//!             |_signal: AbortSignal| async { Ok::<_, QueryError>(vec!["Samples".to_string()]) },
//!             client.query_options(),
//!         )
//!         .await
//! }
//! ```
//!

mod abort;
mod garbage_collector;
mod instant;
mod mutation;
mod query;
mod query_cache;
mod query_client;
mod query_error;
mod query_executor;
mod query_key;
mod query_options;
mod query_result;
mod query_state;
mod use_query;
mod util;

pub use abort::*;
pub use instant::*;
pub use mutation::*;
pub use query_cache::QueryCache;
pub use query_client::*;
pub use query_error::*;
pub use query_key::*;
pub use query_options::*;
pub use query_result::*;
pub use query_state::*;
pub use use_query::*;
pub use util::{sleep, spawn_local, with_timeout};

/// Convenience trait for query value requirements.
pub trait QueryValue: std::fmt::Debug + Clone {}
impl<V> QueryValue for V where V: std::fmt::Debug + Clone {}

#[doc(hidden)]
pub mod __private {
    pub use serde_json::Value;
}
