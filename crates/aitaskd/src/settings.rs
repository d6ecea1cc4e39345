//! Application settings service.
//!
//! Currently one recognized key: `workspace_max_parallel`, clamped to
//! [1, 20]. Writing it re-applies the limit to every workspace and runner.

use std::sync::Arc;

use crate::storage::{Result, Storage};

pub const WORKSPACE_MAX_PARALLEL_KEY: &str = "workspace_max_parallel";
pub const DEFAULT_WORKSPACE_MAX_PARALLEL: u32 = 3;
pub const MIN_WORKSPACE_MAX_PARALLEL: u32 = 1;
pub const MAX_WORKSPACE_MAX_PARALLEL: u32 = 20;

/// Clamp a requested limit into the accepted range.
pub fn clamp_workspace_max_parallel(value: u32) -> u32 {
    value.clamp(MIN_WORKSPACE_MAX_PARALLEL, MAX_WORKSPACE_MAX_PARALLEL)
}

/// Effective `workspace_max_parallel`, defaulting when unset or invalid.
pub async fn get_workspace_max_parallel(storage: &Arc<Storage>) -> Result<u32> {
    let Some(setting) = storage.get_setting(WORKSPACE_MAX_PARALLEL_KEY).await? else {
        return Ok(DEFAULT_WORKSPACE_MAX_PARALLEL);
    };
    match setting.value.parse::<u32>() {
        Ok(value) => Ok(clamp_workspace_max_parallel(value)),
        Err(_) => Ok(DEFAULT_WORKSPACE_MAX_PARALLEL),
    }
}

/// Persist a clamped `workspace_max_parallel` and re-apply it to all
/// workspaces and runners. Returns the applied value.
pub async fn set_workspace_max_parallel(storage: &Arc<Storage>, value: u32) -> Result<u32> {
    let clamped = clamp_workspace_max_parallel(value);
    storage
        .set_setting(WORKSPACE_MAX_PARALLEL_KEY, &clamped.to_string())
        .await?;
    storage.apply_concurrency_limit(clamped).await?;
    Ok(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_store::{create, seed_workspace};

    #[test]
    fn clamping_bounds() {
        assert_eq!(clamp_workspace_max_parallel(0), 1);
        assert_eq!(clamp_workspace_max_parallel(7), 7);
        assert_eq!(clamp_workspace_max_parallel(50), 20);
    }

    #[tokio::test]
    async fn default_when_unparseable() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        storage
            .set_setting(WORKSPACE_MAX_PARALLEL_KEY, "not-a-number")
            .await
            .unwrap();
        assert_eq!(
            get_workspace_max_parallel(&storage).await.unwrap(),
            DEFAULT_WORKSPACE_MAX_PARALLEL
        );
    }

    #[tokio::test]
    async fn set_applies_globally() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/settings-ws").await;

        let applied = set_workspace_max_parallel(&storage, 99).await.unwrap();
        assert_eq!(applied, 20);

        assert_eq!(get_workspace_max_parallel(&storage).await.unwrap(), 20);
        assert_eq!(
            storage.get_workspace(ws).await.unwrap().concurrency_limit,
            20
        );
        assert_eq!(storage.get_runner(runner).await.unwrap().max_parallel, 20);
    }
}
