//! Cached reads of server metadata.
//!
//! Every read goes through the [`QueryClient`], so repository listings and workspace metadata are
//! deduplicated, retried and shared between the export form and the workspace picker.

use std::{rc::Rc, time::Duration};

use fme_query::{
    query_key, run_abortable, use_fme_query, use_query_client, with_timeout, AbortSignal, CancelableSlot,
    QueryClient, QueryError, QueryKey, QueryOptions, QueryResult, RefetchFn,
};
use leptos::{create_memo, logging, SignalGet, SignalGetUntracked};

use crate::{FmeApi, HealthStatus, Repository, RepositoryItem, WorkspaceParameter};

/// Workspace item together with its published parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceMetadata {
    /// The workspace item.
    pub item: RepositoryItem,
    /// Its published parameters.
    pub parameters: Vec<WorkspaceParameter>,
}

/// Key of the repository listing of a server.
pub fn repositories_key(server_url: &str) -> QueryKey {
    query_key!["fme", "repositories", server_url]
}

/// Key of the workspace listing of a repository.
pub fn workspaces_key(server_url: &str, repository: &str) -> QueryKey {
    query_key!["fme", "workspaces", server_url, repository]
}

/// Key of the metadata of one workspace.
pub fn workspace_key(server_url: &str, repository: &str, workspace: &str) -> QueryKey {
    query_key!["fme", "workspace", server_url, repository, workspace]
}

/// Key of the health check of a server.
pub fn health_key(server_url: &str) -> QueryKey {
    query_key!["fme", "health", server_url]
}

fn repositories_fetcher<A>(
    api: Rc<A>,
) -> impl Fn(AbortSignal) -> futures::future::LocalBoxFuture<'static, Result<Vec<Repository>, QueryError>>
where
    A: FmeApi + 'static,
{
    use futures::FutureExt;
    move |signal| {
        let api = api.clone();
        async move { api.repositories(&signal).await }.boxed_local()
    }
}

fn workspace_fetcher<A>(
    api: Rc<A>,
    repository: String,
    workspace: String,
) -> impl Fn(AbortSignal) -> futures::future::LocalBoxFuture<'static, Result<WorkspaceMetadata, QueryError>>
where
    A: FmeApi + 'static,
{
    use futures::FutureExt;
    move |signal| {
        let api = api.clone();
        let repository = repository.clone();
        let workspace = workspace.clone();
        async move {
            let (item, parameters) = futures::try_join!(
                api.workspace_item(&repository, &workspace, &signal),
                api.workspace_parameters(&repository, &workspace, &signal),
            )?;
            Ok(WorkspaceMetadata { item, parameters })
        }
        .boxed_local()
    }
}

/// Repository listing, served from cache while fresh.
pub async fn fetch_repositories<A>(client: &QueryClient, api: Rc<A>) -> Result<Vec<Repository>, QueryError>
where
    A: FmeApi + 'static,
{
    let key = repositories_key(api.server_url());
    client
        .fetch_query(key, repositories_fetcher(api), client.query_options())
        .await
}

/// Workspaces of `repository`, served from cache while fresh.
pub async fn fetch_workspaces<A>(
    client: &QueryClient,
    api: Rc<A>,
    repository: &str,
) -> Result<Vec<RepositoryItem>, QueryError>
where
    A: FmeApi + 'static,
{
    let key = workspaces_key(api.server_url(), repository);
    let repository = repository.to_string();
    client
        .fetch_query(
            key,
            move |signal| {
                let api = api.clone();
                let repository = repository.clone();
                async move { api.workspace_items(&repository, &signal).await }
            },
            client.query_options(),
        )
        .await
}

/// Item and parameters of a workspace, served from cache while fresh.
pub async fn fetch_workspace_metadata<A>(
    client: &QueryClient,
    api: Rc<A>,
    repository: &str,
    workspace: &str,
) -> Result<WorkspaceMetadata, QueryError>
where
    A: FmeApi + 'static,
{
    let key = workspace_key(api.server_url(), repository, workspace);
    client
        .fetch_query(
            key,
            workspace_fetcher(api, repository.to_string(), workspace.to_string()),
            client.query_options(),
        )
        .await
}

/// Health of the server. Always hits the network and is never retried, so a bad token is
/// reported at once.
pub async fn check_connection<A>(client: &QueryClient, api: Rc<A>) -> Result<HealthStatus, QueryError>
where
    A: FmeApi + 'static,
{
    let key = health_key(api.server_url());
    client
        .refetch_query(
            key,
            move |signal| {
                let api = api.clone();
                async move { api.health_check(&signal).await }
            },
            client.query_options().set_retry(false),
        )
        .await
}

/// [`fetch_workspace_metadata`] guarded by a watchdog.
///
/// When the request has not settled after `timeout`, it is cancelled so the loading flag resets,
/// and [`QueryError::Timeout`] is returned.
pub async fn load_workspace<A>(
    client: &QueryClient,
    api: Rc<A>,
    repository: &str,
    workspace: &str,
    timeout: Duration,
) -> Result<WorkspaceMetadata, QueryError>
where
    A: FmeApi + 'static,
{
    let key = workspace_key(api.server_url(), repository, workspace);
    match with_timeout(timeout, fetch_workspace_metadata(client, api, repository, workspace)).await {
        Ok(result) => result,
        Err(expired) => {
            logging::warn!("Loading workspace {workspace} did not finish within {timeout:?}.");
            client.cancel_query(&key);
            Err(expired)
        }
    }
}

/// Warms the cache with the metadata of `workspaces`.
///
/// Starting a new prefetch through the same `slot` abandons the previous one. Abandoned requests
/// are aborted unless another caller or a subscriber still depends on them.
/// Returns false if the prefetch was abandoned.
pub async fn prefetch_workspaces<A>(
    client: &QueryClient,
    api: Rc<A>,
    slot: &CancelableSlot,
    repository: &str,
    workspaces: &[String],
) -> bool
where
    A: FmeApi + 'static,
{
    let signal = slot.acquire();
    let prefetch = futures::future::join_all(workspaces.iter().map(|workspace| {
        client.prefetch_query(
            workspace_key(api.server_url(), repository, workspace),
            workspace_fetcher(api.clone(), repository.to_string(), workspace.clone()),
            client.query_options(),
        )
    }));

    let finished = run_abortable(&signal, prefetch).await.is_ok();
    if !finished {
        // Requests someone else still awaits or observes keep running.
        for workspace in workspaces {
            client.release_query(&workspace_key(api.server_url(), repository, workspace));
        }
    }
    slot.release(&signal);
    finished
}

/// Reactive repository listing.
pub fn use_repositories<A>(api: Rc<A>) -> QueryResult<Vec<Repository>, impl RefetchFn>
where
    A: FmeApi + 'static,
{
    let server_url = api.server_url().to_string();
    let options = use_query_client().query_options();
    use_fme_query(
        move || repositories_key(&server_url),
        repositories_fetcher(api),
        options,
    )
}

/// Reactive metadata of the selected workspace. Follows changes of `repository` and `workspace`.
pub fn use_workspace_metadata<A>(
    api: Rc<A>,
    repository: impl Fn() -> String + 'static,
    workspace: impl Fn() -> String + 'static,
) -> QueryResult<WorkspaceMetadata, impl RefetchFn>
where
    A: FmeApi + 'static,
{
    let server_url = api.server_url().to_string();
    let options: QueryOptions<WorkspaceMetadata> = use_query_client().query_options();
    let selection = create_memo(move |_| (repository(), workspace()));

    use_fme_query(
        move || {
            let (repository, workspace) = selection.get();
            workspace_key(&server_url, &repository, &workspace)
        },
        move |signal| {
            let (repository, workspace) = selection.get_untracked();
            workspace_fetcher(api.clone(), repository, workspace)(signal)
        },
        options,
    )
}
