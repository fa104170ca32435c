//! Container teardown, individually or by run label.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_core::api::ContainerApi;

/// Stops, kills, and removes one container.
///
/// Stop and kill failures are expected for containers that already exited
/// and are only logged; the removal result is returned.
///
/// # Errors
///
/// Returns an error if the container cannot be removed.
pub async fn teardown_container(api: &dyn ContainerApi, id: &ContainerId, grace: Duration) -> Result<()> {
    if let Err(e) = api.stop_container(id, grace).await {
        tracing::debug!(container = %id, error = %e, "stop failed");
    }
    if let Err(e) = api.kill_container(id).await {
        tracing::debug!(container = %id, error = %e, "kill failed");
    }
    api.remove_container(id).await?;
    tracing::info!(container = %id, "container removed");
    Ok(())
}

/// Tears down every container labelled `label_key=label_value`, all
/// concurrently.
///
/// Every teardown runs to completion; the first failure is returned.
/// Returns the number of containers found.
///
/// # Errors
///
/// Returns an error if the containers cannot be listed or any of them
/// cannot be removed.
pub async fn teardown_by_label(
    api: Arc<dyn ContainerApi>,
    label_key: &str,
    label_value: &str,
    grace: Duration,
) -> Result<usize> {
    let ids = api.list_containers(label_key, label_value).await?;
    if ids.is_empty() {
        return Ok(0);
    }
    tracing::info!(label = %label_value, count = ids.len(), "tearing down labelled containers");

    let mut tasks = JoinSet::new();
    for id in ids.iter().cloned() {
        let api = Arc::clone(&api);
        let _ = tasks.spawn(async move { teardown_container(api.as_ref(), &id, grace).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| BerthError::runtime("destroy", label_value, e)).and_then(|r| r);
        if let Err(e) = outcome {
            tracing::warn!(label = %label_value, error = %e, "teardown failed");
            let _ = first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(ids.len()), Err)
}
